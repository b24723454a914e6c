//! Non-blocking socket setup.
//!
//! Every descriptor the runtime polls goes through [`set_nonblocking`], for
//! listeners and accepted connections alike. Std's `accept` hands back
//! blocking sockets even when the listener is non-blocking.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};

/// Put `fd` into non-blocking mode.
///
/// Returns `true` if the flag was changed and `false` if it was already set;
/// calling it again is a no-op.
pub fn set_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(false);
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(true)
}

/// Create a non-blocking TCP listener bound to `addr`.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    set_nonblocking(socket.as_raw_fd())?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Parse a `host:port` listen address.
pub fn parse_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.parse::<SocketAddr>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{addr}: {e}")))
}
