use crate::reactor::poller::platform::{
    sys_accept, sys_bind, sys_close, sys_ipv6_is_necessary, sys_listen, sys_set_reuseaddr,
    sys_socket_for, sys_sockname,
};

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const BACKLOG: i32 = 1024;

/// A non-blocking TCP listener.
///
/// Accepted sockets are returned as owned descriptors, ready to be handed
/// to a worker with [`WorkerHandle::accept`](crate::WorkerHandle::accept).
pub struct Listener {
    /// File descriptor of the listening socket.
    fd: RawFd,
}

impl Listener {
    /// Binds a listener to `address`.
    ///
    /// This function:
    /// - creates a non-blocking socket,
    /// - enables `SO_REUSEADDR`,
    /// - configures IPv6 dual-stack if applicable,
    /// - binds and starts listening.
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let fd = sys_socket_for(&address)?;
        let listener = Self { fd };

        sys_set_reuseaddr(fd)?;
        sys_ipv6_is_necessary(fd, &address)?;
        sys_bind(fd, &address)?;
        sys_listen(fd, BACKLOG)?;

        Ok(listener)
    }

    /// Accepts one pending connection.
    ///
    /// Fails with [`io::ErrorKind::WouldBlock`] when none is pending.
    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let (fd, peer) = sys_accept(self.fd)?;

        // SAFETY: `fd` was just returned by accept(2) and is owned by nobody else.
        Ok((unsafe { OwnedFd::from_raw_fd(fd) }, peer))
    }

    /// Returns the local socket address of this listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sys_sockname(self.fd)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    /// Closes the listening socket.
    fn drop(&mut self) {
        sys_close(self.fd);
    }
}
