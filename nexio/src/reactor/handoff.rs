//! Cross-thread hand-off between arbitrary threads and a worker loop.
//!
//! Other threads never touch a worker's connections or registrations.
//! They push marker values onto bounded queues (or the write-request list)
//! and wake the poller; the owning thread applies them during its next
//! `do_processing` pass.

use super::poller::Waker;
use super::target::{ConnectionTarget, PendingChannel, SocketOptions};
use crate::config::WorkerConfig;
use crate::connection::ConnectionRef;
use crate::error::{Error, Result};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::debug;

use std::net::SocketAddr;
use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// State shared between a worker loop and its handles.
pub(crate) struct Shared {
    pub(crate) name: String,

    /// Accepted or freshly connected sockets awaiting promotion.
    pub(crate) connected: ArrayQueue<PendingChannel>,

    /// Outbound connect attempts submitted from other threads.
    pub(crate) connecting: ArrayQueue<ConnectionTarget>,

    /// Asynchronous connections to process again.
    pub(crate) restarting: ArrayQueue<ConnectionRef>,

    /// Connections that want their output flushed.
    pub(crate) pending_writes: Mutex<Vec<ConnectionRef>>,

    pub(crate) socket: SocketOptions,
    pub(crate) reconnect_delay: Duration,
    pub(crate) waker: Arc<Waker>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) stopped: AtomicBool,
    pub(crate) owner: OnceLock<ThreadId>,
}

impl Shared {
    pub(crate) fn new(config: &WorkerConfig, waker: Arc<Waker>) -> Self {
        Self {
            name: config.name.clone(),
            connected: ArrayQueue::new(config.queue_capacity),
            connecting: ArrayQueue::new(config.queue_capacity),
            restarting: ArrayQueue::new(config.queue_capacity),
            pending_writes: Mutex::new(Vec::new()),
            socket: SocketOptions::from_config(config),
            reconnect_delay: config.reconnect_delay,
            waker,
            shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            owner: OnceLock::new(),
        }
    }
}

/// Cloneable, thread-safe handle to a running worker.
///
/// Every submission wakes the worker's poller so the change is picked up
/// promptly.
#[derive(Clone)]
pub struct WorkerHandle {
    pub(crate) shared: Arc<Shared>,
}

impl WorkerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Name of the worker thread.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// `false` once the worker loop has exited.
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// `true` when called from the worker's own thread.
    pub(crate) fn on_worker_thread(&self) -> bool {
        self.shared.owner.get() == Some(&thread::current().id())
    }

    /// Interrupts the worker's poll. On the worker thread itself the queues
    /// are drained before the next poll anyway.
    fn wake(&self) {
        if !self.on_worker_thread() {
            self.shared.waker.wake();
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) || !self.is_running() {
            return Err(Error::WorkerStopped(self.shared.name.clone()));
        }
        Ok(())
    }

    /// Hands an accepted socket over to the worker.
    ///
    /// The socket is switched to non-blocking mode and configured
    /// (`TCP_NODELAY`, buffer sizes, `SO_REUSEADDR`) before it is queued.
    /// On failure the socket is closed.
    pub fn accept<S: IntoRawFd>(&self, socket: S) -> Result<()> {
        let channel = PendingChannel::server(socket.into_raw_fd());

        self.ensure_running()?;
        self.shared.socket.apply(channel.fd)?;

        self.shared
            .connected
            .push(channel)
            .map_err(|_| Error::QueueFull("connected"))?;

        self.shared.waker.wake();
        Ok(())
    }

    /// Opens an outbound connection to `addr`, owned by the worker.
    ///
    /// The connect attempt starts immediately; completion is observed by the
    /// worker. Failures are retried indefinitely, `reconnect_delay` apart.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.ensure_running()?;

        let socket = &self.shared.socket;
        let mut target = ConnectionTarget::open(addr, socket)?;

        match target.start(socket) {
            Ok(true) => debug!(address = %addr, "opened socket, connected"),
            Ok(false) => debug!(address = %addr, "opened socket, connecting..."),
            Err(e) => {
                debug!(address = %addr, error = %e, "connect failed, will retry");
                target.schedule_retry(self.shared.reconnect_delay, socket);
            }
        }

        self.shared
            .connecting
            .push(target)
            .map_err(|_| Error::QueueFull("connecting"))?;

        self.shared.waker.wake();
        Ok(())
    }

    /// Requests write interest for a connection owned by this worker.
    ///
    /// The interest change itself is applied on the worker thread.
    pub fn want_to_write(&self, conn: ConnectionRef) -> Result<()> {
        self.ensure_running()?;

        self.shared.pending_writes.lock().push(conn);
        self.wake();

        Ok(())
    }

    /// Queues an asynchronous connection for another processing attempt.
    pub fn restart(&self, conn: ConnectionRef) -> Result<()> {
        self.ensure_running()?;

        self.shared
            .restarting
            .push(conn)
            .map_err(|_| Error::QueueFull("restarting"))?;
        self.wake();

        Ok(())
    }

    /// Asks the worker loop to close everything and exit.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.waker.wake();
    }
}

#[cfg(test)]
pub(crate) fn test_handle() -> WorkerHandle {
    use super::poller::Poller;

    let poller = Poller::new(1).expect("poller");
    let config = WorkerConfig {
        name: String::from("test"),
        queue_capacity: 16,
        ..WorkerConfig::default()
    };
    let shared = Shared::new(&config, poller.waker());

    WorkerHandle::new(Arc::new(shared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn accept_queues_socket_and_configures_it() {
        let handle = test_handle();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        handle.accept(stream).unwrap();

        let channel = handle.shared.connected.pop().unwrap();
        assert!(!channel.is_client);
        assert!(channel.fd >= 0);
    }

    #[test]
    fn full_queue_rejects_restart() {
        let handle = test_handle();
        let conn = ConnectionRef {
            index: 0,
            generation: 1,
        };

        for _ in 0..16 {
            handle.restart(conn).unwrap();
        }

        assert!(matches!(
            handle.restart(conn),
            Err(Error::QueueFull("restarting"))
        ));
    }

    #[test]
    fn stopped_worker_rejects_submissions() {
        let handle = test_handle();
        handle.shutdown();

        let conn = ConnectionRef {
            index: 0,
            generation: 1,
        };

        assert!(matches!(handle.want_to_write(conn), Err(Error::WorkerStopped(_))));
        assert!(handle.shared.pending_writes.lock().is_empty());
    }

    #[test]
    fn concurrent_write_requests_are_all_recorded() {
        let handle = test_handle();
        let conn = ConnectionRef {
            index: 2,
            generation: 5,
        };

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        handle.want_to_write(conn).unwrap();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        let pending = handle.shared.pending_writes.lock();
        assert_eq!(pending.len(), 400);
        assert!(pending.iter().all(|c| *c == conn));
    }

    #[test]
    fn requests_from_the_worker_thread_are_still_queued() {
        let handle = test_handle();
        let conn = ConnectionRef {
            index: 1,
            generation: 1,
        };
        assert!(!handle.on_worker_thread());

        handle.shared.owner.set(thread::current().id()).unwrap();
        assert!(handle.on_worker_thread());

        let other = handle.clone();
        assert!(!thread::spawn(move || other.on_worker_thread()).join().unwrap());

        handle.want_to_write(conn).unwrap();
        handle.restart(conn).unwrap();

        assert_eq!(handle.shared.pending_writes.lock().len(), 1);
        assert_eq!(handle.shared.restarting.pop(), Some(conn));
    }
}
