use crate::channel;
use crate::logging::{self, Logger};
use crate::message::{self, Record, PROTO_COMMAND};
use crate::net::buffer::Buffer;
use crate::net::socket::{Protocol, Socket, SocketState};
use crate::status::{Result, Status};
use std::net::SocketAddr;

pub const READ_BUF_SIZE: usize = 65536;
pub const WRITE_BUF_SIZE: usize = 8 * 65536;

/// Inbound traffic surfaced by one readiness event.
#[derive(Debug, Eq, PartialEq)]
pub enum TaskEvent {
    /// Application payload: a command record the core does not consume, or
    /// an externally encoded message, or a raw chunk from an unframed
    /// transport.
    Message { proto: u8, payload: Vec<u8> },
    /// A core command record arriving on the control channel.
    Control(Record),
}

/// Application seam. Implementations hold whatever per-worker state they
/// need; the framework drives them from the readiness loop.
pub trait Handler: Send + 'static {
    /// Application-level hello, invoked right after a connection is
    /// admitted. An error evicts the new task.
    fn on_open(&mut self, _task: &mut Task) -> Result<()> {
        Ok(())
    }

    /// One inbound message. `proto` is the envelope's protocol tag; for
    /// unframed transports it is the raw tag `0`.
    fn on_message(&mut self, task: &mut Task, proto: u8, payload: &[u8]) -> Result<()>;

    /// Worker is about to exit in response to TERMINATE.
    fn on_exit(&mut self) {}

    /// Log-reopen request (SIGUSR1).
    fn on_reopen(&mut self) {}
}

/// Protocol tag reported to the handler for unframed payloads.
pub const PROTO_RAW: u8 = 0x00;

/// One active connection inside a worker: the socket, its buffered I/O and
/// its heartbeat bookkeeping. The task owns the socket exclusively; the
/// worker owns the task through the sharded pool.
pub struct Task {
    socket: Socket,
    shard: usize,
    recv_buf: Buffer,
    send_buf: Buffer,
    probes_out: u8,
    wants_write: bool,
    last_peer: Option<SocketAddr>,
    log: Logger,
}

impl Task {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(socket: Socket, shard: usize, log: L) -> Task {
        let task_log = match log.into() {
            Some(log) => log.new(logging::o!("peer" => socket.peer().to_owned())),
            None => logging::discard(),
        };

        Task {
            socket,
            shard,
            recv_buf: Buffer::new(READ_BUF_SIZE),
            send_buf: Buffer::new(WRITE_BUF_SIZE),
            probes_out: 0,
            wants_write: false,
            last_peer: None,
            log: task_log,
        }
    }

    #[inline]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    #[inline]
    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Shard the task was filed under; stable for its whole lifetime.
    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    #[inline]
    pub fn send_len(&self) -> usize {
        self.send_buf.len()
    }

    /// True once after the outbound buffer gained data; the caller raises
    /// write interest in the notifier.
    #[inline]
    pub fn take_wants_write(&mut self) -> bool {
        let wants = self.wants_write;
        self.wants_write = false;
        wants
    }

    /// Marks the connection dead so the next heartbeat sweep reclaims it.
    #[inline]
    pub fn mark_unconnect(&mut self) {
        self.socket.set_state(SocketState::Unconnect);
    }

    /// Queues one framed message for asynchronous delivery. For datagram
    /// sockets the frame is sent immediately to the last peer.
    pub fn queue(&mut self, proto: u8, payload: &[u8]) -> Result<()> {
        let frame = message::frame(proto, payload);

        match self.socket.protocol() {
            Protocol::Udp => {
                let addr = self
                    .last_peer
                    .ok_or_else(|| Status::invalid_argument("task send", "no datagram peer"))?;
                self.socket.send_datagram(&frame, addr)?;
                Ok(())
            }
            _ => {
                if !self.send_buf.push(&frame) {
                    return Err(Status::io_error("task send", "send buffer full"));
                }
                self.wants_write = true;
                Ok(())
            }
        }
    }

    /// Queues raw bytes with no envelope, for unframed transports.
    pub fn queue_raw(&mut self, payload: &[u8]) -> Result<()> {
        if !self.send_buf.push(payload) {
            return Err(Status::io_error("task send", "send buffer full"));
        }
        self.wants_write = true;
        Ok(())
    }

    /// Reads everything available and decodes it into task events. An error
    /// return means the task must be evicted (except for datagram sockets,
    /// which shrug off transient failures).
    pub fn recv(&mut self, now_usec: u64) -> Result<Vec<TaskEvent>> {
        match self.socket.protocol() {
            Protocol::Channel => self.recv_channel(now_usec),
            Protocol::Udp => self.recv_datagrams(now_usec),
            Protocol::Http => self.recv_raw(now_usec),
            Protocol::Tcp | Protocol::Unix => self.recv_framed(now_usec),
        }
    }

    /// Flushes buffered outbound data. Stamps the send clock when bytes
    /// actually moved.
    pub fn send(&mut self, now_usec: u64) -> Result<usize> {
        let sent = self.socket.drain(&mut self.send_buf)?;
        if sent > 0 {
            self.socket.stamp_send(now_usec);
        }
        Ok(sent)
    }

    /// Emits one keepalive probe and counts it against the eviction limit.
    /// The send clock is stamped at queue time so back-to-back sweeps do not
    /// multiply probes while the frame sits in the outbound buffer.
    pub fn heartbeat_send(&mut self, now_usec: u64) -> Result<()> {
        self.probes_out = self.probes_out.saturating_add(1);
        self.socket.stamp_send(now_usec);
        self.queue(PROTO_COMMAND, &Record::Ping.encode()[message::ENVELOPE_PREFIX..])
    }

    /// True when the peer has failed more consecutive probes than allowed.
    #[inline]
    pub fn heartbeat_out(&self, limit: u8) -> bool {
        self.probes_out > limit
    }

    #[inline]
    pub fn probes_outstanding(&self) -> u8 {
        self.probes_out
    }

    fn recv_framed(&mut self, now_usec: u64) -> Result<Vec<TaskEvent>> {
        let (received, eof) = self.socket.fill(&mut self.recv_buf)?;

        if received > 0 {
            self.socket.stamp_recv(now_usec);
            // Any sign of life settles outstanding probes.
            self.probes_out = 0;
        }

        let mut events = Vec::new();
        self.extract_frames(&mut events, false)?;

        if eof {
            return Err(Status::io_error("task recv", "connection closed"));
        }
        Ok(events)
    }

    fn recv_raw(&mut self, now_usec: u64) -> Result<Vec<TaskEvent>> {
        let (received, eof) = self.socket.fill(&mut self.recv_buf)?;

        let mut events = Vec::new();
        if received > 0 {
            self.socket.stamp_recv(now_usec);
            self.probes_out = 0;

            events.push(TaskEvent::Message {
                proto: PROTO_RAW,
                payload: self.recv_buf.pending().to_vec(),
            });
            self.recv_buf.clear();
        }

        if eof {
            return Err(Status::io_error("task recv", "connection closed"));
        }
        Ok(events)
    }

    fn recv_datagrams(&mut self, now_usec: u64) -> Result<Vec<TaskEvent>> {
        let mut events = Vec::new();
        let mut chunk = [0u8; READ_BUF_SIZE];

        loop {
            match self.socket.recv_datagram(&mut chunk) {
                Ok((size, addr)) => {
                    self.socket.stamp_recv(now_usec);
                    self.last_peer = Some(addr);

                    match message::peek(&chunk[..size]) {
                        Ok(Some((_, envelope))) => events.push(TaskEvent::Message {
                            proto: envelope.proto,
                            payload: envelope.payload.to_vec(),
                        }),
                        // A datagram is all-or-nothing, a short or corrupt
                        // one is dropped rather than buffered.
                        Ok(None) | Err(_) => {
                            logging::debug!(self.log, "dropping malformed datagram";
                                            "context" => "recv",
                                            "size" => size);
                        }
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(events)
    }

    fn recv_channel(&mut self, now_usec: u64) -> Result<Vec<TaskEvent>> {
        let fd = self.socket.raw_fd();
        let mut chunk = [0u8; channel::CHANNEL_BUF_SIZE];

        loop {
            match channel::recv_bytes(fd, &mut chunk, &self.log) {
                Ok(received) => {
                    self.socket.stamp_recv(now_usec);
                    if !self.recv_buf.push(&chunk[..received]) {
                        return Err(Status::io_error("channel recv", "control backlog overflow"));
                    }
                }
                Err(Status::Again) => break,
                Err(status) => return Err(status),
            }
        }

        let mut events = Vec::new();
        self.extract_frames(&mut events, true)?;
        Ok(events)
    }

    /// Decodes complete envelopes off the inbound buffer. Keepalive records
    /// are consumed here; everything else becomes an event. On the control
    /// channel a corrupt frame is skipped so supervisor traffic keeps
    /// flowing, elsewhere it is fatal for the task.
    fn extract_frames(&mut self, events: &mut Vec<TaskEvent>, control: bool) -> Result<()> {
        loop {
            let (total, proto, payload) = match message::peek(self.recv_buf.pending()) {
                Ok(Some((total, envelope))) => {
                    (total, envelope.proto, envelope.payload.to_vec())
                }
                Ok(None) => break,
                Err(status) => {
                    if !control {
                        return Err(status);
                    }
                    logging::error!(self.log, "corrupt frame on control channel, resynchronizing";
                                    "context" => "extract_frames",
                                    "status" => status.to_string());
                    self.recv_buf.clear();
                    break;
                }
            };

            self.recv_buf.consume(total);

            if proto == PROTO_COMMAND {
                match Record::decode(&payload) {
                    Ok(Record::Ping) => {
                        // Answer in kind, nothing surfaces to the caller.
                        let pong = Record::Pong.encode();
                        self.queue(PROTO_COMMAND, &pong[message::ENVELOPE_PREFIX..])?;
                        continue;
                    }
                    Ok(Record::Pong) => {
                        self.probes_out = 0;
                        continue;
                    }
                    Ok(record) if control => {
                        events.push(TaskEvent::Control(record));
                        continue;
                    }
                    Ok(_) => {
                        events.push(TaskEvent::Message { proto, payload });
                        continue;
                    }
                    Err(status) => {
                        if !control {
                            return Err(status);
                        }
                        logging::error!(self.log, "undecodable control record";
                                        "context" => "extract_frames",
                                        "status" => status.to_string());
                        continue;
                    }
                }
            }

            events.push(TaskEvent::Message { proto, payload });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PROTO_EXTERNAL;
    use crate::net::socket::Protocol;
    use mio::net::UnixStream;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn stream_pair() -> (Task, StdUnixStream) {
        let (local, remote) = StdUnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        remote.set_nonblocking(true).unwrap();

        let socket =
            Socket::from_unix_stream(UnixStream::from_std(local), Protocol::Unix, "test".to_owned());
        (Task::new(socket, 3, None), remote)
    }

    fn read_all(remote: &mut StdUnixStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match remote.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend(&chunk[..n]),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => panic!("read failed: {}", err),
            }
        }
        out
    }

    #[test]
    fn test_queue_and_send() {
        let (mut task, mut remote) = stream_pair();

        task.queue(PROTO_EXTERNAL, b"payload one").unwrap();
        assert!(task.take_wants_write());
        assert!(task.send_len() > 0);

        let sent = task.send(1_000).unwrap();
        assert_eq!(sent, message::ENVELOPE_PREFIX + 11);
        assert_eq!(task.send_len(), 0);
        assert_eq!(task.socket().send_tm(), 1_000);

        let bytes = read_all(&mut remote);
        let (_, envelope) = message::peek(&bytes).unwrap().unwrap();
        assert_eq!(envelope.proto, PROTO_EXTERNAL);
        assert_eq!(envelope.payload, b"payload one");
    }

    #[test]
    fn test_recv_framed_messages() {
        let (mut task, mut remote) = stream_pair();

        let mut bytes = message::frame(PROTO_EXTERNAL, b"first");
        bytes.extend(message::frame(PROTO_EXTERNAL, b"second"));
        remote.write_all(&bytes).unwrap();

        let events = task.recv(500).unwrap();
        assert_eq!(
            events,
            vec![
                TaskEvent::Message { proto: PROTO_EXTERNAL, payload: b"first".to_vec() },
                TaskEvent::Message { proto: PROTO_EXTERNAL, payload: b"second".to_vec() },
            ]
        );
        assert_eq!(task.socket().recv_tm(), 500);
    }

    #[test]
    fn test_recv_partial_frame_waits() {
        let (mut task, mut remote) = stream_pair();

        let bytes = message::frame(PROTO_EXTERNAL, b"split payload");
        remote.write_all(&bytes[..4]).unwrap();
        assert!(task.recv(1).unwrap().is_empty());

        remote.write_all(&bytes[4..]).unwrap();
        let events = task.recv(2).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_recv_eof_is_fatal() {
        let (mut task, remote) = stream_pair();
        drop(remote);

        let err = task.recv(1).unwrap_err();
        assert!(!err.is_again());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut task, mut remote) = stream_pair();

        remote.write_all(&Record::Ping.encode()).unwrap();

        let events = task.recv(1).unwrap();
        assert!(events.is_empty());

        // The reply is queued, not yet written.
        assert!(task.send_len() > 0);
        task.send(2).unwrap();

        let bytes = read_all(&mut remote);
        let (_, envelope) = message::peek(&bytes).unwrap().unwrap();
        assert_eq!(Record::decode(envelope.payload).unwrap(), Record::Pong);
    }

    #[test]
    fn test_heartbeat_bookkeeping() {
        let (mut task, mut remote) = stream_pair();

        assert!(!task.heartbeat_out(2));

        for _ in 0..3 {
            task.heartbeat_send(7_000).unwrap();
        }
        assert_eq!(task.socket().send_tm(), 7_000);
        assert_eq!(task.probes_outstanding(), 3);
        assert!(task.heartbeat_out(2));
        task.send(1).unwrap();

        // A pong from the peer settles the count.
        remote.write_all(&Record::Pong.encode()).unwrap();
        task.recv(2).unwrap();
        assert_eq!(task.probes_outstanding(), 0);
        assert!(!task.heartbeat_out(2));
    }

    #[test]
    fn test_inbound_data_settles_probes() {
        let (mut task, mut remote) = stream_pair();

        task.heartbeat_send(1).unwrap();
        assert_eq!(task.probes_outstanding(), 1);

        remote.write_all(&message::frame(PROTO_EXTERNAL, b"alive")).unwrap();
        task.recv(9).unwrap();
        assert_eq!(task.probes_outstanding(), 0);
    }

    #[test]
    fn test_corrupt_frame_evicts_stream_task() {
        let (mut task, mut remote) = stream_pair();

        // Zero length prefix cannot hold the protocol tag.
        remote.write_all(&[0, 0, 0, 0, 9, 9]).unwrap();
        assert!(task.recv(1).is_err());
    }

    #[test]
    fn test_mark_unconnect() {
        let (mut task, _remote) = stream_pair();
        task.mark_unconnect();
        assert_eq!(task.socket().state(), SocketState::Unconnect);
    }
}
