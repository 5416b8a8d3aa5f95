use std::fmt;
use std::io;
use std::net;
use std::result;

pub type Result<T> = result::Result<T, Status>;

/// Tagged status value carried by every fallible operation in the framework.
///
/// `Again` covers the OS-transient conditions (`EAGAIN`, `EWOULDBLOCK`,
/// `EINTR`) which are handled locally by retry or deferral and must never
/// reach the supervisor's signal loop.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Status {
    Nothing,
    Again,
    IOError(&'static str, String),
    InvalidArgument(&'static str, String),
    NotSupported(&'static str, String),
    Corruption(&'static str, String),
    Timeout(&'static str, String),
}

impl Status {
    #[inline]
    pub fn io_error<D: Into<String>>(context: &'static str, detail: D) -> Status {
        Status::IOError(context, detail.into())
    }

    #[inline]
    pub fn invalid_argument<D: Into<String>>(context: &'static str, detail: D) -> Status {
        Status::InvalidArgument(context, detail.into())
    }

    #[inline]
    pub fn not_supported<D: Into<String>>(context: &'static str, detail: D) -> Status {
        Status::NotSupported(context, detail.into())
    }

    #[inline]
    pub fn corruption<D: Into<String>>(context: &'static str, detail: D) -> Status {
        Status::Corruption(context, detail.into())
    }

    #[inline]
    pub fn timeout<D: Into<String>>(context: &'static str, detail: D) -> Status {
        Status::Timeout(context, detail.into())
    }

    /// True for the transient conditions that merely mean "try later".
    #[inline]
    pub fn is_again(&self) -> bool {
        *self == Status::Again
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Nothing => write!(f, "ok"),
            Status::Again => write!(f, "resource temporarily unavailable"),
            Status::IOError(ctx, detail) => write!(f, "io error: {}: {}", ctx, detail),
            Status::InvalidArgument(ctx, detail) => write!(f, "invalid argument: {}: {}", ctx, detail),
            Status::NotSupported(ctx, detail) => write!(f, "not supported: {}: {}", ctx, detail),
            Status::Corruption(ctx, detail) => write!(f, "corruption: {}: {}", ctx, detail),
            Status::Timeout(ctx, detail) => write!(f, "timeout: {}: {}", ctx, detail),
        }
    }
}

impl From<io::Error> for Status {
    #[inline]
    fn from(err: io::Error) -> Status {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Status::Again,
            io::ErrorKind::TimedOut => Status::timeout("io", err.to_string()),
            _ => Status::io_error("io", err.to_string()),
        }
    }
}

impl From<nix::errno::Errno> for Status {
    #[inline]
    fn from(errno: nix::errno::Errno) -> Status {
        use nix::errno::Errno;

        match errno {
            Errno::EAGAIN | Errno::EINTR => Status::Again,
            Errno::ETIMEDOUT => Status::timeout("os", errno.desc()),
            errno => Status::io_error("os", errno.desc()),
        }
    }
}

impl From<net::AddrParseError> for Status {
    #[inline]
    fn from(err: net::AddrParseError) -> Status {
        Status::invalid_argument("address parse", err.to_string())
    }
}

/// Extension helpers for `Result<T>` mirroring the "transient failures are
/// not failures" folding used throughout the event loop.
pub trait StatusUtils {
    /// True only for non-transient failures.
    fn has_failed(&self) -> bool;
}

impl<T> StatusUtils for Result<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(status) => !status.is_again(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_folds_to_again() {
        let status: Status = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(status, Status::Again);

        let status: Status = io::Error::from(io::ErrorKind::Interrupted).into();
        assert_eq!(status, Status::Again);
    }

    #[test]
    fn test_errno_folds_to_again() {
        let status: Status = nix::errno::Errno::EAGAIN.into();
        assert_eq!(status, Status::Again);

        let status: Status = nix::errno::Errno::EINTR.into();
        assert_eq!(status, Status::Again);
    }

    #[test]
    fn test_hard_io_error_is_fatal() {
        let result: Result<()> = Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        assert!(result.has_failed());
    }

    #[test]
    fn test_again_is_not_a_failure() {
        let result: Result<()> = Err(Status::Again);
        assert!(!result.has_failed());
        assert!(result.unwrap_err().is_again());
    }

    #[test]
    fn test_display_carries_context() {
        let status = Status::io_error("spawn worker", "fork failed");
        assert_eq!(status.to_string(), "io error: spawn worker: fork failed");
    }
}
