use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::Protocol;
use crate::reactor::{Worker, WorkerHandle};

use tracing::debug;

use std::net::SocketAddr;
use std::sync::Arc;

/// A worker dedicated to outbound connections.
///
/// Every connection is kept alive: a failed connect or a connection the
/// peer closes is reopened after the configured reconnect delay.
pub struct Client {
    worker: Worker,
    connections: usize,
}

impl Client {
    /// Starts the client worker running `protocol`.
    pub fn start<P: Protocol>(config: ClientConfig, protocol: Arc<P>) -> Result<Self> {
        let worker = Worker::spawn(config.worker, protocol)?;

        Ok(Self {
            worker,
            connections: config.connections,
        })
    }

    /// Opens `connections` connections to `addr`.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, connections = self.connections, "connecting");

        let handle = self.worker.handle();
        for _ in 0..self.connections {
            handle.connect(addr)?;
        }

        Ok(())
    }

    /// Handle of the client's worker.
    pub fn handle(&self) -> WorkerHandle {
        self.worker.handle()
    }

    /// Closes every connection and stops the worker.
    pub fn shutdown(self) {
        self.worker.join();
    }
}
