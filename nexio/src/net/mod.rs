//! Listening and connecting on top of worker event loops.
//!
//! - [`Listener`]: a non-blocking bound TCP listener,
//! - [`Server`]: an acceptor thread spreading accepted sockets over a set
//!   of workers,
//! - [`Client`]: a worker opening outbound connections.

mod client;
mod listener;
mod server;

pub use client::Client;
pub use listener::Listener;
pub use server::Server;
