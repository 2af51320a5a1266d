// ABOUTME: AF_VSOCK stream transport setup shared by the server and client binaries

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, VsockAddr, sockopt::ReuseAddr,
};
use tracing::warn;

/// Default protocol port on both sides.
pub const DEFAULT_PORT: u32 = 9999;

/// Listen backlog for the server socket.
pub const LISTEN_BACKLOG: i32 = 5;

/// Bind a listening vsock socket on `port` for any CID.
pub fn listen(port: u32) -> io::Result<OwnedFd> {
    let sock = socket::socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;

    if let Err(err) = socket::setsockopt(&sock, ReuseAddr, &true) {
        warn!(error = %err, "failed to set SO_REUSEADDR");
    }

    let addr = VsockAddr::new(libc::VMADDR_CID_ANY, port);
    socket::bind(sock.as_raw_fd(), &addr).map_err(io::Error::from)?;
    socket::listen(&sock, Backlog::new(LISTEN_BACKLOG).map_err(io::Error::from)?)
        .map_err(io::Error::from)?;

    Ok(sock)
}

/// Connect to the guest at `(cid, port)`.
pub fn connect(cid: u32, port: u32) -> io::Result<OwnedFd> {
    let sock = socket::socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;

    let addr = VsockAddr::new(cid, port);
    socket::connect(sock.as_raw_fd(), &addr).map_err(io::Error::from)?;
    Ok(sock)
}

/// Accept one connection, returning the stream and the peer's CID.
pub fn accept(listener: &OwnedFd) -> io::Result<(OwnedFd, u32)> {
    let raw = socket::accept(listener.as_raw_fd()).map_err(io::Error::from)?;
    let stream = unsafe { OwnedFd::from_raw_fd(raw) };
    let peer: VsockAddr =
        socket::getpeername(stream.as_raw_fd()).map_err(io::Error::from)?;
    Ok((stream, peer.cid()))
}

/// Put `fd` into nonblocking mode.
///
/// Sessions and drivers rely on `EAGAIN` from reads and writes; every
/// stream handed to a frame queue goes through here first.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
