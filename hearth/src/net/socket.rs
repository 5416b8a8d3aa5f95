use crate::net::buffer::Buffer;
use crate::status::{Result, Status};
use mio::net::{TcpListener, TcpStream, UdpSocket, UnixListener, UnixStream};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::path::Path;

/// Wire protocol spoken on a socket. `Http` rides on a TCP transport but is
/// delivered to the application unframed; `Channel` marks the control
/// channel inherited from the supervisor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
    Http,
    Channel,
}

impl Protocol {
    /// Parses the configuration surface's protocol name.
    pub fn from_name(name: &str) -> Option<Protocol> {
        match name.to_ascii_uppercase().as_str() {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            "UNIX" => Some(Protocol::Unix),
            "HTTP" => Some(Protocol::Http),
            _ => None,
        }
    }

    /// True for the stream transports that participate in heartbeat sweeps.
    #[inline]
    pub fn is_stream(self) -> bool {
        match self {
            Protocol::Tcp | Protocol::Unix | Protocol::Http => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Listening,
    Connected,
    Unconnect,
}

pub enum SocketKind {
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    UnixListener(UnixListener),
    UnixStream(UnixStream),
    Udp(UdpSocket),
    /// Descriptor owned elsewhere (the worker's channel endpoint).
    Inherited(RawFd),
}

/// A non-blocking socket tagged with its protocol, connection state and
/// communication timestamps (microseconds on the owning worker's clock).
pub struct Socket {
    kind: SocketKind,
    protocol: Protocol,
    state: SocketState,
    peer: String,
    send_tm: u64,
    recv_tm: u64,
}

impl Socket {
    /// Opens a listening (or, for UDP, bound) socket for the given protocol.
    /// For `Unix`, `host` is a filesystem path and a stale socket file is
    /// removed first.
    pub fn listen(protocol: Protocol, host: &str, port: u16) -> Result<Socket> {
        let socket = match protocol {
            Protocol::Tcp | Protocol::Http => {
                let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
                let listener = TcpListener::bind(addr)
                    .map_err(|err| Status::io_error("tcp listen", err.to_string()))?;
                Socket {
                    peer: format!("{}", addr),
                    kind: SocketKind::TcpListener(listener),
                    protocol,
                    state: SocketState::Listening,
                    send_tm: 0,
                    recv_tm: 0,
                }
            }
            Protocol::Udp => {
                let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
                let socket = UdpSocket::bind(addr)
                    .map_err(|err| Status::io_error("udp bind", err.to_string()))?;
                // No listen state for datagram sockets, the bound socket
                // serves traffic directly.
                Socket {
                    peer: format!("{}", addr),
                    kind: SocketKind::Udp(socket),
                    protocol,
                    state: SocketState::Connected,
                    send_tm: 0,
                    recv_tm: 0,
                }
            }
            Protocol::Unix => {
                if Path::new(host).exists() {
                    fs::remove_file(host).ok();
                }
                let listener = UnixListener::bind(host)
                    .map_err(|err| Status::io_error("unix listen", err.to_string()))?;
                Socket {
                    peer: host.to_owned(),
                    kind: SocketKind::UnixListener(listener),
                    protocol,
                    state: SocketState::Listening,
                    send_tm: 0,
                    recv_tm: 0,
                }
            }
            Protocol::Channel => {
                return Err(Status::invalid_argument("listen", "channel sockets are inherited"))
            }
        };

        Ok(socket)
    }

    /// Rebuilds a listening (or, for UDP, bound) socket from a descriptor
    /// inherited across exec. The caller vouches that the descriptor is a
    /// bound socket of the named protocol; this process takes ownership.
    pub fn from_inherited(fd: RawFd, protocol: Protocol) -> Result<Socket> {
        let socket = match protocol {
            Protocol::Tcp | Protocol::Http => {
                let listener = unsafe { TcpListener::from_raw_fd(fd) };
                Socket {
                    peer: match listener.local_addr() {
                        Ok(addr) => format!("{}", addr),
                        Err(_) => "inherited".to_owned(),
                    },
                    kind: SocketKind::TcpListener(listener),
                    protocol,
                    state: SocketState::Listening,
                    send_tm: 0,
                    recv_tm: 0,
                }
            }
            Protocol::Unix => {
                let listener = unsafe { UnixListener::from_raw_fd(fd) };
                Socket {
                    peer: "inherited".to_owned(),
                    kind: SocketKind::UnixListener(listener),
                    protocol,
                    state: SocketState::Listening,
                    send_tm: 0,
                    recv_tm: 0,
                }
            }
            Protocol::Udp => {
                let socket = unsafe { UdpSocket::from_raw_fd(fd) };
                Socket {
                    peer: match socket.local_addr() {
                        Ok(addr) => format!("{}", addr),
                        Err(_) => "inherited".to_owned(),
                    },
                    kind: SocketKind::Udp(socket),
                    protocol,
                    state: SocketState::Connected,
                    send_tm: 0,
                    recv_tm: 0,
                }
            }
            Protocol::Channel => {
                return Err(Status::invalid_argument("adopt listener", "channel is not a listener"))
            }
        };

        Ok(socket)
    }

    /// Wraps an already-connected Unix stream, e.g. one end of a pair.
    pub fn from_unix_stream(stream: UnixStream, protocol: Protocol, peer: String) -> Socket {
        Socket {
            kind: SocketKind::UnixStream(stream),
            protocol,
            state: SocketState::Connected,
            peer,
            send_tm: 0,
            recv_tm: 0,
        }
    }

    /// Wraps the control-channel descriptor inherited across exec. The
    /// descriptor stays owned by the worker; dropping the socket does not
    /// close it.
    pub fn channel(fd: RawFd) -> Socket {
        Socket {
            kind: SocketKind::Inherited(fd),
            protocol: Protocol::Channel,
            state: SocketState::Connected,
            peer: "supervisor".to_owned(),
            send_tm: 0,
            recv_tm: 0,
        }
    }

    /// Accepts one pending connection, decorating it with the protocol tag
    /// of the listener and a larger send buffer. Returns `Ok(None)` when the
    /// accept queue is drained.
    pub fn accept(&mut self) -> Result<Option<Socket>> {
        let accepted = match &self.kind {
            SocketKind::TcpListener(listener) => match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nodelay(true).ok();
                    set_send_buffer(stream.as_raw_fd());
                    Some(Socket {
                        peer: format!("{}", addr),
                        kind: SocketKind::TcpStream(stream),
                        protocol: self.protocol,
                        state: SocketState::Connected,
                        send_tm: 0,
                        recv_tm: 0,
                    })
                }
                Err(ref err) if would_block(err) => None,
                Err(err) => return Err(Status::io_error("tcp accept", err.to_string())),
            },
            SocketKind::UnixListener(listener) => match listener.accept() {
                Ok((stream, addr)) => {
                    set_send_buffer(stream.as_raw_fd());
                    Some(Socket {
                        peer: format!("{:?}", addr),
                        kind: SocketKind::UnixStream(stream),
                        protocol: self.protocol,
                        state: SocketState::Connected,
                        send_tm: 0,
                        recv_tm: 0,
                    })
                }
                Err(ref err) if would_block(err) => None,
                Err(err) => return Err(Status::io_error("unix accept", err.to_string())),
            },
            _ => return Err(Status::invalid_argument("accept", "not a listening socket")),
        };

        Ok(accepted)
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        match &self.kind {
            SocketKind::TcpListener(listener) => listener.as_raw_fd(),
            SocketKind::TcpStream(stream) => stream.as_raw_fd(),
            SocketKind::UnixListener(listener) => listener.as_raw_fd(),
            SocketKind::UnixStream(stream) => stream.as_raw_fd(),
            SocketKind::Udp(socket) => socket.as_raw_fd(),
            SocketKind::Inherited(fd) => *fd,
        }
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: SocketState) {
        self.state = state;
    }

    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Actual bound address, where the transport has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            SocketKind::TcpListener(listener) => listener.local_addr().ok(),
            SocketKind::TcpStream(stream) => stream.local_addr().ok(),
            SocketKind::Udp(socket) => socket.local_addr().ok(),
            _ => None,
        }
    }

    #[inline]
    pub fn send_tm(&self) -> u64 {
        self.send_tm
    }

    #[inline]
    pub fn recv_tm(&self) -> u64 {
        self.recv_tm
    }

    #[inline]
    pub fn stamp_send(&mut self, now_usec: u64) {
        self.send_tm = now_usec;
    }

    #[inline]
    pub fn stamp_recv(&mut self, now_usec: u64) {
        self.recv_tm = now_usec;
    }

    /// Reads everything currently available into `buffer`. The boolean is
    /// true when the peer has closed its end.
    pub fn fill(&mut self, buffer: &mut Buffer) -> io::Result<(usize, bool)> {
        match &mut self.kind {
            SocketKind::TcpStream(stream) => buffer.fill_from(stream),
            SocketKind::UnixStream(stream) => buffer.fill_from(stream),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a stream socket")),
        }
    }

    /// Writes as much buffered data as the socket accepts.
    pub fn drain(&mut self, buffer: &mut Buffer) -> io::Result<usize> {
        match &mut self.kind {
            SocketKind::TcpStream(stream) => buffer.drain_to(stream),
            SocketKind::UnixStream(stream) => buffer.drain_to(stream),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a stream socket")),
        }
    }

    /// Receives a single datagram. Only valid for UDP sockets.
    pub fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match &mut self.kind {
            SocketKind::Udp(socket) => socket.recv_from(buf),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a datagram socket")),
        }
    }

    pub fn send_datagram(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match &mut self.kind {
            SocketKind::Udp(socket) => socket.send_to(buf, addr),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a datagram socket")),
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match &mut self.kind {
            SocketKind::TcpListener(listener) => registry.register(listener, token, interests),
            SocketKind::TcpStream(stream) => registry.register(stream, token, interests),
            SocketKind::UnixListener(listener) => registry.register(listener, token, interests),
            SocketKind::UnixStream(stream) => registry.register(stream, token, interests),
            SocketKind::Udp(socket) => registry.register(socket, token, interests),
            SocketKind::Inherited(fd) => registry.register(&mut SourceFd(fd), token, interests),
        }
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match &mut self.kind {
            SocketKind::TcpListener(listener) => registry.reregister(listener, token, interests),
            SocketKind::TcpStream(stream) => registry.reregister(stream, token, interests),
            SocketKind::UnixListener(listener) => registry.reregister(listener, token, interests),
            SocketKind::UnixStream(stream) => registry.reregister(stream, token, interests),
            SocketKind::Udp(socket) => registry.reregister(socket, token, interests),
            SocketKind::Inherited(fd) => registry.reregister(&mut SourceFd(fd), token, interests),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match &mut self.kind {
            SocketKind::TcpListener(listener) => registry.deregister(listener),
            SocketKind::TcpStream(stream) => registry.deregister(stream),
            SocketKind::UnixListener(listener) => registry.deregister(listener),
            SocketKind::UnixStream(stream) => registry.deregister(stream),
            SocketKind::Udp(socket) => registry.deregister(socket),
            SocketKind::Inherited(fd) => registry.deregister(&mut SourceFd(fd)),
        }
    }
}

#[inline]
fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted
}

/// Bumps SO_SNDBUF on accepted sockets. Failure is harmless and ignored.
fn set_send_buffer(fd: RawFd) {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    nix::sys::socket::setsockopt(&borrowed, nix::sys::socket::sockopt::SndBuf, &crate::SEND_BUF_SIZE)
        .ok();
}
