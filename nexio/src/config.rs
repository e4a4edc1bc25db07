//! Builders for worker, server and client configuration.
//!
//! Loading configuration from files is left to the application; these
//! builders only collect and validate the values the event loop needs.

use crate::error::{Error, Result};

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

/// Settings of one event loop worker.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Thread name of the worker.
    pub name: String,

    /// Kernel send/receive buffer size applied to every socket, in KiB.
    pub buffer_size_kb: usize,

    /// Disables Nagle's algorithm on every socket.
    pub no_delay: bool,

    /// Maximum number of messages processed per read event.
    pub max_pipeline: usize,

    /// Capacity of each cross-thread hand-off queue.
    pub queue_capacity: usize,

    /// Hard upper bound on pooled connections.
    pub pool_capacity: usize,

    /// Connections constructed up front.
    pub initial_pool_size: usize,

    /// Upper bound on a single poller wait.
    pub select_timeout: Duration,

    /// Bytes read from a socket per read event.
    pub read_chunk: usize,

    /// Largest input backlog a connection may accumulate.
    pub max_input_size: usize,

    /// Delay before a failed or dropped outbound connection is retried.
    pub reconnect_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: String::from("nexio-worker"),
            buffer_size_kb: 16,
            no_delay: true,
            max_pipeline: usize::MAX,
            queue_capacity: 65_536,
            pool_capacity: 100_000,
            initial_pool_size: 64,
            select_timeout: Duration::from_millis(50),
            read_chunk: 16 * 1024,
            max_input_size: 8 * 1024 * 1024,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Starts a builder from the default settings.
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_pipeline == 0 {
            return Err(Error::InvalidConfig("max_pipeline must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be > 0"));
        }
        if self.pool_capacity == 0 {
            return Err(Error::InvalidConfig("pool_capacity must be > 0"));
        }
        if self.read_chunk == 0 {
            return Err(Error::InvalidConfig("read_chunk must be > 0"));
        }
        if self.buffer_size_kb == 0 {
            return Err(Error::InvalidConfig("buffer_size_kb must be > 0"));
        }

        Ok(())
    }
}

/// Builder for [`WorkerConfig`].
///
/// # Examples
///
/// ```
/// let config = nexio::WorkerBuilder::new()
///     .name("echo-0")
///     .max_pipeline(16)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.max_pipeline, 16);
/// ```
#[derive(Clone, Debug, Default)]
pub struct WorkerBuilder {
    config: WorkerConfig,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn buffer_size_kb(mut self, kb: usize) -> Self {
        self.config.buffer_size_kb = kb;
        self
    }

    pub fn no_delay(mut self, no_delay: bool) -> Self {
        self.config.no_delay = no_delay;
        self
    }

    pub fn max_pipeline(mut self, n: usize) -> Self {
        self.config.max_pipeline = n;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.queue_capacity = n;
        self
    }

    pub fn pool_capacity(mut self, n: usize) -> Self {
        self.config.pool_capacity = n;
        self
    }

    pub fn initial_pool_size(mut self, n: usize) -> Self {
        self.config.initial_pool_size = n;
        self
    }

    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.config.select_timeout = timeout;
        self
    }

    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.config.read_chunk = bytes;
        self
    }

    pub fn max_input_size(mut self, bytes: usize) -> Self {
        self.config.max_input_size = bytes;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<WorkerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings of a listening [`Server`](crate::Server).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub workers: usize,
    pub worker: WorkerConfig,
}

/// Builder for [`ServerConfig`].
///
/// By default the server listens on `0.0.0.0:8080` with one worker per
/// available logical CPU.
#[derive(Clone, Debug)]
pub struct ServerBuilder {
    address: String,
    workers: usize,
    worker: WorkerConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            address: String::from("0.0.0.0:8080"),
            workers,
            worker: WorkerConfig::default(),
        }
    }

    /// Address to bind, e.g. `"127.0.0.1:0"` or `"[::]:8080"`.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn build(self) -> Result<ServerConfig> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be > 0"));
        }
        self.worker.validate()?;

        Ok(ServerConfig {
            address: self.address.parse()?,
            workers: self.workers,
            worker: self.worker,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings of an outbound [`Client`](crate::Client).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Connections opened per target address.
    pub connections: usize,
    pub worker: WorkerConfig,
}

/// Builder for [`ClientConfig`].
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    connections: usize,
    worker: WorkerConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            connections: 1,
            worker: WorkerConfig {
                name: String::from("nexio-client"),
                ..WorkerConfig::default()
            },
        }
    }

    pub fn connections(mut self, n: usize) -> Self {
        self.connections = n;
        self
    }

    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        if self.connections == 0 {
            return Err(Error::InvalidConfig("connections must be > 0"));
        }
        self.worker.validate()?;

        Ok(ClientConfig {
            connections: self.connections,
            worker: self.worker,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
