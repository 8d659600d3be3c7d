use std::io;
use std::net;

pub type SockResult<T> = Result<T, SockError>;

/// Error plumbing shared by every reactor surface.
///
/// `Wait` is transient (retry later), `Stale` means the connection id no
/// longer refers to a live slot, and `Fatal` terminates the connection via
/// the close path.
#[derive(Debug, Eq, PartialEq)]
pub enum SockError {
    /// The operation would block; retry after the next readiness event.
    Wait,
    /// The connection id is stale or was never valid.
    Stale,
    /// The write queue is at capacity; the caller must back off.
    QueueFull,
    /// The object was not linked to the connection.
    NotFound,
    /// Unrecoverable; the connection is scheduled for closure.
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    AddrParse,
    Capacity,
    Closed,
    Eof,
    Io(io::ErrorKind),
}

impl From<io::Error> for SockError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => SockError::Wait,
            kind => SockError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for SockError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        SockError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for SockResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(SockError::Wait) => false,
            _ => true,
        }
    }
}
