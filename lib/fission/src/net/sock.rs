use crate::shared::{ErrorType, SockError, SockResult};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;

/// A parsed bind / dial target.
///
/// An empty port with a path-like address (`/...` or `./...`) selects a
/// Unix-domain socket at that path; anything else is TCP. An empty TCP
/// address binds every interface; `localhost` and `127.0.0.1` restrict
/// binding to the loopback.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SockAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Parses an `(address, port)` pair into a socket target.
pub fn parse_addr(address: &str, port: &str) -> SockResult<SockAddr> {
    if port.is_empty() && (address.starts_with('/') || address.starts_with("./")) {
        return Ok(SockAddr::Unix(PathBuf::from(address)));
    }

    let port: u16 = match port.parse() {
        Ok(port) => port,
        Err(_) => return Err(SockError::Fatal(ErrorType::AddrParse)),
    };

    let host = match address {
        "" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    };

    if let Ok(ip) = host.parse() {
        return Ok(SockAddr::Tcp(SocketAddr::new(ip, port)));
    }

    // Fall back to resolution for hostnames.
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => Ok(SockAddr::Tcp(addr)),
            None => Err(SockError::Fatal(ErrorType::AddrParse)),
        },
        Err(_) => Err(SockError::Fatal(ErrorType::AddrParse)),
    }
}

/// Creates a bound, listening, non-blocking socket and returns its raw
/// descriptor. A pre-existing Unix socket path is unlinked first.
pub fn listen(addr: &SockAddr) -> io::Result<RawFd> {
    match addr {
        SockAddr::Tcp(addr) => {
            let listener = mio::net::TcpListener::bind(*addr)?;
            Ok(listener.into_raw_fd())
        }
        SockAddr::Unix(path) => {
            drop(std::fs::remove_file(path));
            let listener = mio::net::UnixListener::bind(path)?;
            Ok(listener.into_raw_fd())
        }
    }
}

/// Returns the local address a TCP listener descriptor is bound to. Used to
/// recover the ephemeral port after binding port 0.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    storage_to_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an inet socket"))
}

/// Starts a non-blocking connect and returns the raw descriptor. The
/// connection result is read later via `take_error` once the descriptor
/// reports writability.
pub fn connect(addr: &SockAddr) -> io::Result<RawFd> {
    match addr {
        SockAddr::Tcp(addr) => {
            let stream = mio::net::TcpStream::connect(*addr)?;
            Ok(stream.into_raw_fd())
        }
        SockAddr::Unix(path) => {
            let stream = mio::net::UnixStream::connect(path)?;
            Ok(stream.into_raw_fd())
        }
    }
}

/// Accepts one pending connection off a listening descriptor. The accepted
/// socket is created non-blocking and close-on-exec. Returns the descriptor
/// and the stringified peer address.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, String)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let accepted = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if accepted < 0 {
        return Err(io::Error::last_os_error());
    }

    let peer = match storage_to_addr(&storage) {
        Some(addr) => Ok(addr.to_string()),
        None => unix_peer_string(&storage),
    };

    Ok((accepted, peer.unwrap_or_default()))
}

/// Reads and clears the pending socket error. Used by the dialer once a
/// connecting descriptor turns writable.
pub fn take_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }

    Ok(())
}

/// Returns the stringified peer address of a connected descriptor, if any.
pub fn peer_name(fd: RawFd) -> Option<String> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let rc = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };

    if rc < 0 {
        return None;
    }

    match storage_to_addr(&storage) {
        Some(addr) => Some(addr.to_string()),
        None => unix_peer_string(&storage).ok(),
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            let addr4 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr4.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(addr4.sin_port))))
        }
        libc::AF_INET6 => {
            let addr6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(addr6.sin6_port))))
        }
        _ => None,
    }
}

fn unix_peer_string(storage: &libc::sockaddr_storage) -> io::Result<String> {
    if i32::from(storage.ss_family) != libc::AF_UNIX {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown address family"));
    }

    let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
    let path: Vec<u8> = addr
        .sun_path
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as u8)
        .collect();

    Ok(String::from_utf8_lossy(&path).into_owned())
}
