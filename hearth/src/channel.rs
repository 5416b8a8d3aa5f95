use crate::logging::{self, Logger};
use crate::message;
use crate::status::{Result, Status};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use nix::unistd::Pid;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Sentinel for "no descriptor".
pub const FD_UNKNOWN: RawFd = -1;

/// Receive buffer sized for a batch of command records.
pub const CHANNEL_BUF_SIZE: usize = 4096;

/// Sends one framed message on a channel endpoint.
///
/// When the frame is an OPEN command record, the descriptor named by the
/// record's placeholder field is attached as `SCM_RIGHTS` ancillary data so
/// the kernel transfers it to the peer. Partial writes are not retried;
/// callers rebuild and resend the whole frame.
pub fn send_bytes(fd: RawFd, buf: &[u8], log: &Logger) -> Result<usize> {
    let iov = [IoSlice::new(buf)];
    let pass_fd = message::open_frame_fd(buf);

    let sent = match pass_fd {
        Some(pass) => {
            let fds = [pass];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)?
        }
        None => sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None)?,
    };

    if sent != buf.len() {
        logging::error!(log, "short write on control channel";
                        "context" => "send_bytes",
                        "fd" => fd,
                        "sent" => sent,
                        "expected" => buf.len());
        return Err(Status::io_error("channel send", format!("partial write of {} bytes", sent)));
    }

    Ok(sent)
}

/// Receives bytes from a channel endpoint.
///
/// If the data begins an OPEN command record, the single `SCM_RIGHTS`
/// descriptor delivered alongside it is written into the record's
/// placeholder field. Truncated ancillary data is logged but not fatal;
/// an OPEN arriving without its descriptor is corruption.
pub fn recv_bytes(fd: RawFd, buf: &mut [u8], log: &Logger) -> Result<usize> {
    let mut received_fds: Vec<RawFd> = Vec::new();
    let bytes;

    {
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let mut iov = [IoSliceMut::new(buf)];
        let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

        bytes = msg.bytes;

        match msg.cmsgs() {
            Ok(cmsgs) => {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        received_fds.extend(fds);
                    }
                }
            }
            Err(errno) => {
                logging::debug!(log, "truncated ancillary data on control channel";
                                "context" => "recv_bytes",
                                "fd" => fd,
                                "errno" => errno.desc());
            }
        }
    }

    if bytes == 0 {
        return Err(Status::io_error("channel recv", "peer closed"));
    }

    if message::is_open_frame(&buf[..bytes]) {
        if received_fds.len() != 1 {
            close_all(&received_fds);
            return Err(Status::corruption(
                "channel recv",
                format!("open record with {} ancillary descriptors", received_fds.len()),
            ));
        }
        message::rewrite_open_fd(buf, received_fds[0]);
    } else if !received_fds.is_empty() {
        // Stray descriptors would otherwise leak into this process forever.
        logging::debug!(log, "dropping unexpected ancillary descriptors";
                        "context" => "recv_bytes",
                        "fd" => fd,
                        "count" => received_fds.len());
        close_all(&received_fds);
    }

    Ok(bytes)
}

fn close_all(fds: &[RawFd]) {
    for &fd in fds {
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}

/// Requests SIGIO delivery to `owner` when the endpoint becomes readable.
pub fn set_async_owner(fd: RawFd, owner: Pid) -> Result<()> {
    unsafe {
        let flags = nix::libc::fcntl(fd, nix::libc::F_GETFL);
        if flags == -1 {
            return Err(nix::errno::Errno::last().into());
        }
        if nix::libc::fcntl(fd, nix::libc::F_SETFL, flags | nix::libc::O_ASYNC) == -1 {
            return Err(nix::errno::Errno::last().into());
        }
        if nix::libc::fcntl(fd, nix::libc::F_SETOWN, owner.as_raw()) == -1 {
            return Err(nix::errno::Errno::last().into());
        }
    }
    Ok(())
}

/// Both ends of one worker's control channel, created before the worker is
/// spawned. The supervisor keeps `local` for itself and for OPEN fan-out;
/// `peer` is installed on a well-known descriptor in the child.
pub struct ChannelPair {
    local: Option<OwnedFd>,
    peer: Option<OwnedFd>,
}

impl ChannelPair {
    /// Creates the socketpair. Both ends are non-blocking and close-on-exec;
    /// the spawn path explicitly re-inherits the peer end for the child.
    pub fn open() -> Result<ChannelPair> {
        let (local, peer) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;

        Ok(ChannelPair { local: Some(local), peer: Some(peer) })
    }

    /// Placeholder for a table slot with no live channel.
    pub fn closed() -> ChannelPair {
        ChannelPair { local: None, peer: None }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.local.is_some()
    }

    #[inline]
    pub fn local_fd(&self) -> RawFd {
        self.local.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(FD_UNKNOWN)
    }

    #[inline]
    pub fn peer_fd(&self) -> RawFd {
        self.peer.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(FD_UNKNOWN)
    }

    /// Sends a frame on the supervisor-side end.
    pub fn send(&self, buf: &[u8], log: &Logger) -> Result<usize> {
        match &self.local {
            Some(fd) => send_bytes(fd.as_raw_fd(), buf, log),
            None => Err(Status::io_error("channel send", "channel is closed")),
        }
    }

    /// Receives a frame on the supervisor-side end.
    pub fn recv(&self, buf: &mut [u8], log: &Logger) -> Result<usize> {
        match &self.local {
            Some(fd) => recv_bytes(fd.as_raw_fd(), buf, log),
            None => Err(Status::io_error("channel recv", "channel is closed")),
        }
    }

    /// Closes both ends. Idempotent.
    pub fn close(&mut self) {
        self.local.take();
        self.peer.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Record;
    use std::io::Write;

    fn pair() -> ChannelPair {
        ChannelPair::open().unwrap()
    }

    #[test]
    fn test_open_is_nonblocking_pair() {
        let channel = pair();
        assert!(channel.is_open());
        assert!(channel.local_fd() >= 0);
        assert!(channel.peer_fd() >= 0);

        // An empty channel must report Again rather than blocking.
        let mut buf = [0u8; 64];
        let err = channel.recv(&mut buf, &logging::discard()).unwrap_err();
        assert!(err.is_again());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut channel = pair();
        channel.close();
        channel.close();
        assert!(!channel.is_open());
        assert_eq!(channel.local_fd(), FD_UNKNOWN);
        assert_eq!(channel.peer_fd(), FD_UNKNOWN);
    }

    #[test]
    fn test_command_roundtrip_without_descriptor() {
        let channel = pair();
        let log = logging::discard();

        let frame = Record::Terminate.encode();
        channel.send(&frame, &log).unwrap();

        let mut buf = [0u8; CHANNEL_BUF_SIZE];
        let bytes = recv_bytes(channel.peer_fd(), &mut buf, &log).unwrap();
        assert_eq!(&buf[..bytes], &frame[..]);

        let (_, envelope) = message::peek(&buf[..bytes]).unwrap().unwrap();
        assert_eq!(Record::decode(envelope.payload).unwrap(), Record::Terminate);
    }

    #[test]
    fn test_open_record_transfers_descriptor() {
        let channel = pair();
        let log = logging::discard();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        let sender_fd = file.as_file().as_raw_fd();

        let frame = Record::Open { slot: 5, pid: 777, fd: sender_fd }.encode();
        channel.send(&frame, &log).unwrap();

        let mut buf = [0u8; CHANNEL_BUF_SIZE];
        let bytes = recv_bytes(channel.peer_fd(), &mut buf, &log).unwrap();

        let (_, envelope) = message::peek(&buf[..bytes]).unwrap().unwrap();
        let record = Record::decode(envelope.payload).unwrap();

        match record {
            Record::Open { slot, pid, fd } => {
                assert_eq!(slot, 5);
                assert_eq!(pid, 777);
                // The kernel allocates a fresh descriptor in the receiver.
                assert_ne!(fd, sender_fd);
                assert!(fd >= 0);

                // Prove the received descriptor references the same file.
                let mut received = unsafe { std::fs::File::from_raw_fd(fd) };
                received.write_all(b"hello across the channel").unwrap();
                drop(received);

                file.flush().unwrap();
                let contents = std::fs::read(file.path()).unwrap();
                assert_eq!(contents, b"hello across the channel");
            }
            record => panic!("unexpected record {:?}", record),
        }
    }

    #[test]
    fn test_peer_close_is_reported() {
        let mut channel = pair();
        let log = logging::discard();

        let peer = channel.peer.take().unwrap();
        drop(peer);

        let mut buf = [0u8; 64];
        let err = channel.recv(&mut buf, &log).unwrap_err();
        match err {
            Status::IOError(ctx, detail) => {
                assert_eq!(ctx, "channel recv");
                assert_eq!(detail, "peer closed");
            }
            status => panic!("unexpected status {:?}", status),
        }
    }

    #[test]
    fn test_send_on_closed_channel_fails() {
        let mut channel = pair();
        channel.close();

        let frame = Record::Quit.encode();
        assert!(channel.send(&frame, &logging::discard()).is_err());
    }
}
