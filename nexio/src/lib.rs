//! # Nexio
//!
//! **Nexio** is a non-blocking socket reactor for the **Nebula** ecosystem. It drives
//! application protocols over TCP connections with one event loop per worker thread,
//! without an async runtime.
//!
//! Each worker:
//!
//! - owns a **readiness poller** (epoll on Linux, kqueue on macOS/BSD),
//! - keeps its connections in a **pool** of reusable slots,
//! - runs the protocol over buffered input with **pipelining** and **rollback checkpoints**,
//! - receives work from other threads through **bounded hand-off queues**,
//! - **reconnects** outbound connections that fail or get closed by the peer.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nexio::{BoxError, Connection, Outcome, Protocol, Server, ServerBuilder};
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn process(&self, conn: &mut Connection) -> Result<Outcome, BoxError> {
//!         let Some(end) = conn.input().find(b"\n") else {
//!             return Ok(Outcome::Incomplete);
//!         };
//!
//!         let line = conn.input_mut().take(end + 1).unwrap_or_default().to_vec();
//!         conn.write(&line);
//!
//!         Ok(Outcome::Complete)
//!     }
//! }
//!
//! let config = ServerBuilder::new().address("127.0.0.1:7000").workers(2).build()?;
//! let server = Server::start(config, Arc::new(Echo))?;
//!
//! println!("listening on {}", server.local_addr());
//! # Ok::<(), nexio::Error>(())
//! ```
//!
//! ## Modules
//!
//! - [`buffer`] — Byte buffers with a position/limit cursor
//! - [`net`] — Listener, server and client on top of workers
//!
//! ## Logging
//!
//! Nexio emits [`tracing`] events and installs no subscriber.

mod config;
mod connection;
mod error;
mod protocol;
mod reactor;
mod utils;

pub mod buffer;
pub mod net;

pub use buffer::Buffer;
pub use config::{
    ClientBuilder, ClientConfig, ServerBuilder, ServerConfig, WorkerBuilder, WorkerConfig,
};
pub use connection::{AsyncHandle, Connection, ConnectionRef, Role};
pub use error::{BoxError, Error, Result};
pub use net::{Client, Listener, Server};
pub use protocol::{Outcome, Protocol};
pub use reactor::{Worker, WorkerHandle};
