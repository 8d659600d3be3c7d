use crate::identity::ConnId;
use std::io;
use std::os::unix::io::RawFd;

/// Read/write hooks allow a transport layer (e.g. TLS) to interpose on a
/// connection's descriptor I/O. The default hooks map one-to-one to the OS
/// socket calls.
///
/// Hooks MUST NOT call back into the runtime: they run inside the write
/// lock and a re-entrant call would deadlock the connection.
pub trait RwHooks: Send + Sync {
    /// Reads into `buf`. `Ok(0)` means end-of-stream; a `WouldBlock` error
    /// means no data is currently available.
    fn read(&self, uuid: ConnId, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning the number of bytes accepted.
    fn write(&self, uuid: ConnId, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    /// Reports the number of bytes held in a hook-internal buffer that
    /// still await transmission. The default hooks buffer nothing.
    fn flush(&self, _uuid: ConnId, _fd: RawFd) -> io::Result<usize> {
        Ok(0)
    }

    /// Closes the underlying descriptor and releases hook resources.
    ///
    /// Returning a value greater than zero requests another flush-and-close
    /// pass (a transport may need to write a shutdown record first).
    fn close(&self, uuid: ConnId, fd: RawFd) -> io::Result<usize>;
}

/// The default hooks: plain fd syscalls.
pub(crate) struct SocketHooks;

impl RwHooks for SocketHooks {
    fn read(&self, _uuid: ConnId, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let count = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

        if count < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(count as usize)
    }

    fn write(&self, _uuid: ConnId, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let count = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };

        if count < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(count as usize)
    }

    fn close(&self, _uuid: ConnId, fd: RawFd) -> io::Result<usize> {
        let rc = unsafe { libc::close(fd) };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (RawFd, RawFd) {
        let (left, right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        right.set_nonblocking(true).unwrap();
        (left.into_raw_fd(), right.into_raw_fd())
    }

    #[test]
    fn test_default_hooks_roundtrip() {
        let (left, right) = pair();
        let hooks = SocketHooks;
        let uuid = ConnId::INVALID;

        let written = hooks.write(uuid, left, b"hello").unwrap();
        assert_eq!(written, 5);

        let mut buf = [0u8; 16];
        let read = hooks.read(uuid, right, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"hello");

        hooks.close(uuid, left).unwrap();
        hooks.close(uuid, right).unwrap();
    }

    #[test]
    fn test_read_would_block() {
        let (left, right) = pair();
        let hooks = SocketHooks;
        let uuid = ConnId::INVALID;

        let mut buf = [0u8; 16];
        let err = hooks.read(uuid, right, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        hooks.close(uuid, left).unwrap();
        hooks.close(uuid, right).unwrap();
    }

    #[test]
    fn test_read_eof_after_peer_close() {
        let (left, right) = pair();
        let hooks = SocketHooks;
        let uuid = ConnId::INVALID;

        hooks.close(uuid, left).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(hooks.read(uuid, right, &mut buf).unwrap(), 0);

        hooks.close(uuid, right).unwrap();
    }
}
