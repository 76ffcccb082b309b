//! Listening and connected sockets.
//!
//! TCP listeners are created by hand so the backlog is configurable;
//! everything else goes through `std::net` / `std::os::unix::net` with
//! non-blocking mode switched on.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use log::{debug, warn};
use shardio_core::{Address, BindAddr};

// ── Listeners ───────────────────────────────────────────────────────

pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind and listen, non-blocking. An existing unix path is never
    /// removed; it fails with `AddrInUse`.
    pub fn bind(addr: &BindAddr, backlog: i32) -> io::Result<Self> {
        match addr {
            BindAddr::Inet(sa) => Ok(Listener::Tcp(bind_tcp(*sa, backlog)?)),
            BindAddr::Unix(path) => {
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Unix { listener, path: path.clone() })
            }
        }
    }

    /// Accept one connection as a non-blocking stream.
    pub fn accept(&self) -> io::Result<(Stream, Address)> {
        match self {
            Listener::Tcp(l) => {
                let (s, peer) = l.accept()?;
                s.set_nonblocking(true)?;
                Ok((Stream::Tcp(s), Address::from(peer)))
            }
            Listener::Unix { listener, .. } => {
                let (s, peer) = listener.accept()?;
                s.set_nonblocking(true)?;
                Ok((Stream::Unix(s), Address::from(&peer)))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<Address> {
        match self {
            Listener::Tcp(l) => l.local_addr().map(Address::from),
            Listener::Unix { path, .. } => Ok(Address::Unix(Some(path.clone()))),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix { listener, .. } => listener.as_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            match std::fs::remove_file(&*path) {
                Ok(()) => debug!("unlinked {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to unlink {}: {}", path.display(), e),
            }
        }
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR` and an explicit
/// backlog.
fn bind_tcp(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };

    let fd = unsafe {
        libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: fresh descriptor from socket(2); closed on every error path by drop.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);

    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(raw, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let ret = unsafe { libc::listen(raw, backlog) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from(fd))
}

fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Bind a non-blocking UDP socket.
pub(crate) fn bind_udp(addr: &BindAddr) -> io::Result<UdpSocket> {
    match addr {
        BindAddr::Inet(sa) => {
            let socket = UdpSocket::bind(sa)?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        }
        BindAddr::Unix(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "datagram network needs an inet address",
        )),
    }
}

/// Full length of the datagram at the head of the queue, which stays
/// queued. `WouldBlock` when there is none.
pub(crate) fn peek_datagram_len(socket: &UdpSocket) -> io::Result<usize> {
    let ret = unsafe {
        libc::recv(
            socket.as_raw_fd(),
            std::ptr::null_mut(),
            0,
            libc::MSG_PEEK | libc::MSG_TRUNC,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

// ── Connected streams ───────────────────────────────────────────────

/// An accepted, non-blocking stream socket. Dropping it closes the fd.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).read(buf),
            Stream::Unix(s) => (&*s).read(buf),
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => (&*s).write(buf),
            Stream::Unix(s) => (&*s).write(buf),
        }
    }

    pub fn set_nodelay(&self, enable: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nodelay(enable),
            Stream::Unix(_) => Ok(()),
        }
    }

    pub fn local_addr(&self) -> io::Result<Address> {
        match self {
            Stream::Tcp(s) => s.local_addr().map(Address::from),
            Stream::Unix(s) => s.local_addr().map(|a| Address::from(&a)),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(s) => s.as_fd(),
            Stream::Unix(s) => s.as_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_tcp_ephemeral() {
        let l = Listener::bind(&BindAddr::Inet("127.0.0.1:0".parse().unwrap()), 16).unwrap();
        let addr = l.local_addr().unwrap().as_inet().unwrap();
        assert_ne!(addr.port(), 0);

        // Non-blocking: nothing pending.
        let err = l.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (stream, peer) = l.accept().unwrap();
        assert!(matches!(stream, Stream::Tcp(_)));
        assert!(peer.as_inet().is_some());
    }

    #[test]
    fn test_stream_local_addr() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = l.local_addr().unwrap();
        let stream = Stream::Tcp(TcpStream::connect(addr).unwrap());
        assert_eq!(stream.local_addr().unwrap().as_inet().unwrap().ip(), addr.ip());

        // getsockname on something that is not a socket must not be
        // reported as a unix address.
        let not_a_socket = OwnedFd::from(std::fs::File::open("/dev/null").unwrap());
        let stream = Stream::Tcp(TcpStream::from(not_a_socket));
        assert!(stream.local_addr().is_err());
    }

    #[test]
    fn test_peek_datagram_len() {
        let server = bind_udp(&BindAddr::Inet("127.0.0.1:0".parse().unwrap())).unwrap();
        let err = peek_datagram_len(&server).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&[9u8; 3000], server.local_addr().unwrap()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert_eq!(peek_datagram_len(&server).unwrap(), 3000);
        // Still queued.
        let mut buf = [0u8; 4096];
        assert_eq!(server.recv_from(&mut buf).unwrap().0, 3000);
    }

    #[test]
    fn test_bind_tcp_in_use() {
        let first = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();
        let err = Listener::bind(&BindAddr::Inet(addr), 16).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_unix_listener_unlinks_on_drop() {
        let path = std::env::temp_dir().join(format!("shardio-sock-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let l = Listener::bind(&BindAddr::Unix(path.clone()), 16).unwrap();
        assert!(path.exists());

        // Stale path is not stolen.
        let err = Listener::bind(&BindAddr::Unix(path.clone()), 16).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(path.exists());

        drop(l);
        assert!(!path.exists());
    }
}
