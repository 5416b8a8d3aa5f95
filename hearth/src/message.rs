use crate::status::{Result, Status};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::os::unix::io::RawFd;

/// Payload is a command record with a fixed `ns:u16, cmd:u16` header.
pub const PROTO_COMMAND: u8 = 0x01;
/// Payload is externally encoded, the core transports it untouched.
pub const PROTO_EXTERNAL: u8 = 0x02;

/// Size of the envelope prefix (`len:u32` + `proto:u8`).
pub const ENVELOPE_PREFIX: usize = 5;

/// Byte offset of the descriptor field inside a framed OPEN record; the
/// channel rewrites it in place with the descriptor delivered by the kernel.
pub const OPEN_FD_OFFSET: usize = ENVELOPE_PREFIX + 4 + 4 + 4;

/// Total size of a framed OPEN record.
pub const OPEN_FRAME_LEN: usize = OPEN_FD_OFFSET + 4;

const NS_CHANNEL: u16 = 0x01;
const NS_KEEPALIVE: u16 = 0x02;

const CMD_OPEN: u16 = 0x01;
const CMD_CLOSE: u16 = 0x02;
const CMD_QUIT: u16 = 0x03;
const CMD_TERMINATE: u16 = 0x04;

const CMD_PING: u16 = 0x01;
const CMD_PONG: u16 = 0x02;

/// Command records understood by the core.
///
/// `Open` always travels with one descriptor attached as ancillary data;
/// the in-band `fd` value is a placeholder overwritten on receipt.
/// Unrecognized ids decode to `Unknown` so receivers can stay idempotent
/// across version skew instead of tearing the channel down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Record {
    Open { slot: u32, pid: i32, fd: RawFd },
    Close { slot: u32, pid: i32 },
    Quit,
    Terminate,
    Ping,
    Pong,
    Unknown { ns: u16, cmd: u16 },
}

impl Record {
    #[inline]
    fn ids(&self) -> (u16, u16) {
        match self {
            Record::Open { .. } => (NS_CHANNEL, CMD_OPEN),
            Record::Close { .. } => (NS_CHANNEL, CMD_CLOSE),
            Record::Quit => (NS_CHANNEL, CMD_QUIT),
            Record::Terminate => (NS_CHANNEL, CMD_TERMINATE),
            Record::Ping => (NS_KEEPALIVE, CMD_PING),
            Record::Pong => (NS_KEEPALIVE, CMD_PONG),
            Record::Unknown { ns, cmd } => (*ns, *cmd),
        }
    }

    /// Encodes the record as a complete envelope frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        let (ns, cmd) = self.ids();

        body.write_u16::<LittleEndian>(ns).expect("record header write");
        body.write_u16::<LittleEndian>(cmd).expect("record header write");

        match *self {
            Record::Open { slot, pid, fd } => {
                body.write_u32::<LittleEndian>(slot).expect("record body write");
                body.write_i32::<LittleEndian>(pid).expect("record body write");
                body.write_i32::<LittleEndian>(fd).expect("record body write");
            }
            Record::Close { slot, pid } => {
                body.write_u32::<LittleEndian>(slot).expect("record body write");
                body.write_i32::<LittleEndian>(pid).expect("record body write");
                body.write_i32::<LittleEndian>(-1).expect("record body write");
            }
            _ => (),
        }

        frame(PROTO_COMMAND, &body)
    }

    /// Decodes a command payload (the bytes following the protocol tag).
    pub fn decode(payload: &[u8]) -> Result<Record> {
        let mut cursor = Cursor::new(payload);

        let ns = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Status::corruption("record decode", "short command header"))?;
        let cmd = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Status::corruption("record decode", "short command header"))?;

        let record = match (ns, cmd) {
            (NS_CHANNEL, CMD_OPEN) | (NS_CHANNEL, CMD_CLOSE) => {
                let slot = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| Status::corruption("record decode", "short channel body"))?;
                let pid = cursor
                    .read_i32::<LittleEndian>()
                    .map_err(|_| Status::corruption("record decode", "short channel body"))?;
                let fd = cursor
                    .read_i32::<LittleEndian>()
                    .map_err(|_| Status::corruption("record decode", "short channel body"))?;

                if cmd == CMD_OPEN {
                    Record::Open { slot, pid, fd }
                } else {
                    Record::Close { slot, pid }
                }
            }
            (NS_CHANNEL, CMD_QUIT) => Record::Quit,
            (NS_CHANNEL, CMD_TERMINATE) => Record::Terminate,
            (NS_KEEPALIVE, CMD_PING) => Record::Ping,
            (NS_KEEPALIVE, CMD_PONG) => Record::Pong,
            (ns, cmd) => Record::Unknown { ns, cmd },
        };

        Ok(record)
    }
}

/// One decoded envelope, borrowing the payload from the input buffer.
#[derive(Debug, Eq, PartialEq)]
pub struct Envelope<'a> {
    pub proto: u8,
    pub payload: &'a [u8],
}

/// Assembles an envelope frame around a payload.
pub fn frame(proto: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(ENVELOPE_PREFIX + payload.len());

    buf.write_u32::<LittleEndian>(len).expect("envelope write");
    buf.push(proto);
    buf.extend_from_slice(payload);
    buf
}

/// Attempts to read one envelope from the head of `buf`. Returns the total
/// frame size and the envelope, or `None` while the frame is incomplete.
/// A frame whose declared length cannot hold the protocol tag is corrupt.
pub fn peek(buf: &[u8]) -> Result<Option<(usize, Envelope)>> {
    if buf.len() < ENVELOPE_PREFIX {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    let len = cursor.read_u32::<LittleEndian>().expect("length prefix read") as usize;

    if len < 1 {
        return Err(Status::corruption("envelope decode", "length shorter than protocol tag"));
    }

    let total = 4 + len;
    if buf.len() < total {
        return Ok(None);
    }

    let proto = buf[4];
    Ok(Some((total, Envelope { proto, payload: &buf[ENVELOPE_PREFIX..total] })))
}

/// True when the framed bytes start an OPEN record, which must carry a
/// descriptor as ancillary data.
pub fn is_open_frame(buf: &[u8]) -> bool {
    if buf.len() < OPEN_FRAME_LEN || buf[4] != PROTO_COMMAND {
        return false;
    }

    let mut cursor = Cursor::new(&buf[ENVELOPE_PREFIX..]);
    let ns = cursor.read_u16::<LittleEndian>().expect("command id read");
    let cmd = cursor.read_u16::<LittleEndian>().expect("command id read");

    ns == NS_CHANNEL && cmd == CMD_OPEN
}

/// Reads the placeholder descriptor field of a framed OPEN record.
pub fn open_frame_fd(buf: &[u8]) -> Option<RawFd> {
    if !is_open_frame(buf) {
        return None;
    }
    let mut cursor = Cursor::new(&buf[OPEN_FD_OFFSET..]);
    cursor.read_i32::<LittleEndian>().ok()
}

/// Overwrites the descriptor field of a framed OPEN record with the
/// descriptor actually delivered by the kernel.
pub fn rewrite_open_fd(buf: &mut [u8], fd: RawFd) {
    let mut field = &mut buf[OPEN_FD_OFFSET..OPEN_FD_OFFSET + 4];
    field.write_i32::<LittleEndian>(fd).expect("fd rewrite");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_roundtrip() {
        let record = Record::Open { slot: 3, pid: 4242, fd: 17 };
        let frame = record.encode();

        assert_eq!(frame.len(), OPEN_FRAME_LEN);
        assert!(is_open_frame(&frame));
        assert_eq!(open_frame_fd(&frame), Some(17));

        let (total, envelope) = peek(&frame).unwrap().unwrap();
        assert_eq!(total, frame.len());
        assert_eq!(envelope.proto, PROTO_COMMAND);
        assert_eq!(Record::decode(envelope.payload).unwrap(), record);
    }

    #[test]
    fn test_close_carries_placeholder_fd() {
        let frame = Record::Close { slot: 9, pid: 100 }.encode();
        let (_, envelope) = peek(&frame).unwrap().unwrap();

        match Record::decode(envelope.payload).unwrap() {
            Record::Close { slot, pid } => {
                assert_eq!(slot, 9);
                assert_eq!(pid, 100);
            }
            record => panic!("unexpected record {:?}", record),
        }
        assert!(!is_open_frame(&frame));
    }

    #[test]
    fn test_empty_body_records() {
        for record in &[Record::Quit, Record::Terminate, Record::Ping, Record::Pong] {
            let frame = record.encode();
            assert_eq!(frame.len(), ENVELOPE_PREFIX + 4);

            let (_, envelope) = peek(&frame).unwrap().unwrap();
            assert_eq!(Record::decode(envelope.payload).unwrap(), *record);
        }
    }

    #[test]
    fn test_rewrite_open_fd() {
        let mut frame = Record::Open { slot: 0, pid: 1, fd: -1 }.encode();
        rewrite_open_fd(&mut frame, 55);

        assert_eq!(open_frame_fd(&frame), Some(55));

        let (_, envelope) = peek(&frame).unwrap().unwrap();
        match Record::decode(envelope.payload).unwrap() {
            Record::Open { fd, .. } => assert_eq!(fd, 55),
            record => panic!("unexpected record {:?}", record),
        }
    }

    #[test]
    fn test_peek_incomplete() {
        let frame = Record::Terminate.encode();
        for cut in 0..frame.len() {
            assert_eq!(peek(&frame[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn test_peek_two_frames() {
        let mut bytes = Record::Quit.encode();
        bytes.extend(Record::Ping.encode());

        let (first, envelope) = peek(&bytes).unwrap().unwrap();
        assert_eq!(Record::decode(envelope.payload).unwrap(), Record::Quit);

        let (_, envelope) = peek(&bytes[first..]).unwrap().unwrap();
        assert_eq!(Record::decode(envelope.payload).unwrap(), Record::Ping);
    }

    #[test]
    fn test_zero_length_is_corrupt() {
        let bytes = [0u8, 0, 0, 0, 1];
        assert!(peek(&bytes).is_err());
    }

    #[test]
    fn test_unknown_command_is_tolerated() {
        let frame = super::frame(PROTO_COMMAND, &[0xff, 0xff, 0xee, 0xee]);
        let (_, envelope) = peek(&frame).unwrap().unwrap();

        match Record::decode(envelope.payload).unwrap() {
            Record::Unknown { ns, cmd } => {
                assert_eq!(ns, 0xffff);
                assert_eq!(cmd, 0xeeee);
            }
            record => panic!("unexpected record {:?}", record),
        }
    }

    #[test]
    fn test_short_command_header_is_corrupt() {
        assert!(Record::decode(&[0x01]).is_err());
    }

    #[test]
    fn test_external_payload_passthrough() {
        let frame = super::frame(PROTO_EXTERNAL, b"opaque bytes");
        let (_, envelope) = peek(&frame).unwrap().unwrap();

        assert_eq!(envelope.proto, PROTO_EXTERNAL);
        assert_eq!(envelope.payload, b"opaque bytes");
    }
}
