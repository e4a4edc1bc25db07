use super::poller::platform::{
    sys_close, sys_connect, sys_set_buffer_sizes, sys_set_nodelay, sys_set_nonblocking,
    sys_set_reuseaddr, sys_socket_for,
};
use crate::config::WorkerConfig;

use tracing::debug;

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Options applied to every socket a worker takes over.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SocketOptions {
    pub(crate) no_delay: bool,
    pub(crate) buffer_size: usize,
}

impl SocketOptions {
    pub(crate) fn from_config(config: &WorkerConfig) -> Self {
        Self {
            no_delay: config.no_delay,
            buffer_size: config.buffer_size_kb * 1024,
        }
    }

    /// Switches the socket to non-blocking mode and configures it.
    pub(crate) fn apply(&self, fd: RawFd) -> io::Result<()> {
        sys_set_nonblocking(fd)?;
        sys_set_nodelay(fd, self.no_delay)?;
        sys_set_buffer_sizes(fd, self.buffer_size)?;
        sys_set_reuseaddr(fd)
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// A socket waiting to be promoted to a connection.
///
/// Owns the socket until promotion; a dropped channel closes it.
#[derive(Debug)]
pub(crate) struct PendingChannel {
    pub(crate) fd: RawFd,
    pub(crate) is_client: bool,

    /// Remote address of an outbound connection, used to reconnect.
    pub(crate) addr: Option<SocketAddr>,
}

impl PendingChannel {
    pub(crate) fn server(fd: RawFd) -> Self {
        Self {
            fd,
            is_client: false,
            addr: None,
        }
    }

    pub(crate) fn client(fd: RawFd, addr: SocketAddr) -> Self {
        Self {
            fd,
            is_client: true,
            addr: Some(addr),
        }
    }

    /// Releases ownership of the socket.
    pub(crate) fn into_raw_fd(mut self) -> RawFd {
        std::mem::replace(&mut self.fd, -1)
    }
}

impl Drop for PendingChannel {
    fn drop(&mut self) {
        if self.fd >= 0 {
            sys_close(self.fd);
        }
    }
}

/// An outbound connection attempt.
///
/// A target either has a connect in flight (`started`) or waits until
/// `retry_after` before the next attempt. The socket is `-1` when reopening
/// it failed; it is opened again at the next attempt. Dropping the target
/// closes its socket.
#[derive(Debug)]
pub(crate) struct ConnectionTarget {
    pub(crate) addr: SocketAddr,
    pub(crate) fd: RawFd,
    pub(crate) retry_after: Instant,
    pub(crate) started: bool,
}

impl ConnectionTarget {
    /// Opens and configures a socket for `addr`.
    pub(crate) fn open(addr: SocketAddr, options: &SocketOptions) -> io::Result<Self> {
        let fd = open_socket(&addr, options)?;

        Ok(Self {
            addr,
            fd,
            retry_after: Instant::now(),
            started: false,
        })
    }

    /// A reconnection to `addr`, attempted once `delay` has elapsed.
    pub(crate) fn reconnect(addr: SocketAddr, delay: Duration, options: &SocketOptions) -> Self {
        let mut target = Self {
            addr,
            fd: -1,
            retry_after: Instant::now(),
            started: false,
        };
        target.schedule_retry(delay, options);

        target
    }

    /// Initiates the non-blocking connect.
    ///
    /// Returns `Ok(true)` if it completed synchronously.
    pub(crate) fn start(&mut self, options: &SocketOptions) -> io::Result<bool> {
        if self.fd < 0 {
            self.fd = open_socket(&self.addr, options)?;
        }

        let connected = sys_connect(self.fd, &self.addr)?;
        self.started = true;

        Ok(connected)
    }

    /// `true` once the target should be registered for connect readiness
    /// or attempted again.
    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.started || self.retry_after <= now
    }

    /// Drops the current socket and arms the next attempt.
    ///
    /// A fresh socket is opened right away when possible.
    pub(crate) fn schedule_retry(&mut self, delay: Duration, options: &SocketOptions) {
        debug!(address = %self.addr, "reconnecting...");

        self.close_socket();
        self.started = false;
        self.retry_after = Instant::now() + delay;

        match open_socket(&self.addr, options) {
            Ok(fd) => self.fd = fd,
            Err(e) => debug!(address = %self.addr, error = %e, "failed to reopen socket"),
        }
    }

    /// Hands the connected socket over for promotion.
    pub(crate) fn into_channel(mut self) -> PendingChannel {
        let fd = std::mem::replace(&mut self.fd, -1);
        PendingChannel::client(fd, self.addr)
    }

    fn close_socket(&mut self) {
        if self.fd >= 0 {
            sys_close(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for ConnectionTarget {
    fn drop(&mut self) {
        self.close_socket();
    }
}

fn open_socket(addr: &SocketAddr, options: &SocketOptions) -> io::Result<RawFd> {
    let fd = sys_socket_for(addr)?;

    if let Err(e) = options.apply(fd) {
        sys_close(fd);
        return Err(e);
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn retry_waits_for_delay() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut target = ConnectionTarget::open(addr, &SocketOptions::default()).unwrap();
        target.started = true;

        target.schedule_retry(Duration::from_secs(1), &SocketOptions::default());

        let now = Instant::now();
        assert!(!target.started);
        assert!(!target.is_due(now));
        assert!(target.is_due(now + Duration::from_millis(1001)));
        assert!(target.fd >= 0);
    }

    #[test]
    fn target_without_socket_opens_one_on_start() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut target = ConnectionTarget {
            addr,
            fd: -1,
            retry_after: Instant::now(),
            started: false,
        };
        assert!(target.is_due(Instant::now()));

        target.start(&SocketOptions::default()).unwrap();
        assert!(target.fd >= 0);
        assert!(target.started);

        let channel = target.into_channel();
        assert!(channel.is_client);
        assert_eq!(channel.addr, Some(addr));
        assert!(channel.fd >= 0);
    }
}
