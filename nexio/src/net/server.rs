use super::Listener;
use crate::config::{ServerConfig, WorkerConfig};
use crate::error::Result;
use crate::protocol::Protocol;
use crate::reactor::poller::{Interest, Poller, Waker};
use crate::reactor::{Worker, WorkerHandle};

use tracing::{debug, error, trace, warn};

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LISTENER_TOKEN: usize = 0;
const ACCEPT_TIMEOUT: Duration = Duration::from_millis(100);

/// A TCP server: one acceptor thread and a set of workers.
///
/// Accepted sockets are distributed over the workers round-robin. Each
/// worker then owns its connections for their whole lifetime.
///
/// Dropping the server stops the acceptor and every worker.
pub struct Server {
    local_addr: SocketAddr,
    workers: Vec<Worker>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds `config.address` and starts serving `protocol`.
    pub fn start<P: Protocol>(config: ServerConfig, protocol: Arc<P>) -> Result<Self> {
        let listener = Listener::bind(config.address)?;
        let local_addr = listener.local_addr()?;

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let worker_config = WorkerConfig {
                name: format!("{}-{id}", config.worker.name),
                ..config.worker.clone()
            };
            workers.push(Worker::spawn(worker_config, protocol.clone())?);
        }

        let poller = Poller::new(16)?;
        poller.register(listener.as_raw_fd(), LISTENER_TOKEN, Interest::READ)?;

        let waker = poller.waker();
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor = Acceptor {
            listener,
            poller,
            workers: workers.iter().map(Worker::handle).collect(),
            shutdown: shutdown.clone(),
            next: 0,
        };

        let acceptor = thread::Builder::new()
            .name(format!("{}-acceptor", config.worker.name))
            .spawn(move || acceptor.run())?;

        debug!(address = %local_addr, workers = workers.len(), "server started");

        Ok(Self {
            local_addr,
            workers,
            shutdown,
            waker,
            acceptor: Some(acceptor),
        })
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handles of the server's workers.
    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.workers.iter().map(Worker::handle).collect()
    }

    /// Stops accepting, then shuts every worker down and waits for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake();

        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State of the acceptor thread.
struct Acceptor {
    listener: Listener,
    poller: Poller,
    workers: Vec<WorkerHandle>,
    shutdown: Arc<AtomicBool>,

    /// Worker receiving the next accepted socket.
    next: usize,
}

impl Acceptor {
    fn run(mut self) {
        let mut events = Vec::with_capacity(1);

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poller.poll(&mut events, Some(ACCEPT_TIMEOUT)) {
                error!(error = %e, "acceptor poll failed");
                continue;
            }

            if !events.is_empty() {
                self.accept_pending();
            }
        }

        debug!("acceptor stopped");
    }

    /// Accepts until the backlog is empty.
    fn accept_pending(&mut self) {
        loop {
            let (socket, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };

            let worker = &self.workers[self.next % self.workers.len()];
            self.next = self.next.wrapping_add(1);

            trace!(%peer, worker = worker.name(), "accepted connection");

            if let Err(e) = worker.accept(socket) {
                warn!(%peer, worker = worker.name(), error = %e, "failed to hand over connection");
            }
        }
    }
}
