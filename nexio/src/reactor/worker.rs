use super::event_loop::EventLoop;
use super::handoff::{Shared, WorkerHandle};
use super::poller::Poller;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::protocol::Protocol;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Maximum readiness events collected per poll.
const EVENT_CAPACITY: usize = 1024;

/// One event loop running on its own thread.
///
/// The worker owns every connection it accepts or opens. Other threads
/// interact with it through its [`WorkerHandle`].
///
/// Dropping the worker shuts it down and waits for its thread.
///
/// # Examples
///
/// ```no_run
/// use std::net::TcpListener;
/// use std::sync::Arc;
///
/// use nexio::{BoxError, Connection, Outcome, Worker, WorkerConfig};
///
/// let protocol = |conn: &mut Connection| -> Result<Outcome, BoxError> {
///     let n = conn.input().remaining();
///     let bytes = conn.input_mut().take(n).unwrap_or_default().to_vec();
///     conn.write(&bytes);
///     Ok(Outcome::Complete)
/// };
///
/// let worker = Worker::spawn(WorkerConfig::default(), Arc::new(protocol)).unwrap();
/// let listener = TcpListener::bind("127.0.0.1:7000").unwrap();
///
/// for stream in listener.incoming() {
///     worker.handle().accept(stream.unwrap()).unwrap();
/// }
/// ```
pub struct Worker {
    handle: WorkerHandle,

    /// Join handle of the loop thread; taken on join.
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts a worker thread running `protocol` over its connections.
    pub fn spawn<P: Protocol>(config: WorkerConfig, protocol: Arc<P>) -> Result<Self> {
        config.validate()?;

        let poller = Poller::new(EVENT_CAPACITY)?;
        let shared = Arc::new(Shared::new(&config, poller.waker()));
        let handle = WorkerHandle::new(shared.clone());

        let thread = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                let mut event_loop = EventLoop::new(&config, shared, poller, protocol);
                event_loop.run();
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// A cloneable handle for submitting work from other threads.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Signals the loop to close all connections and exit.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Shuts the worker down and waits for its thread to finish.
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.shutdown();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
