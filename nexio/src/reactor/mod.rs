//! Worker event loops and their cross-thread surface.
//!
//! Each [`Worker`] runs one event loop on a dedicated thread. The loop:
//! - waits on the platform poller for socket readiness,
//! - reads input and runs the protocol over it,
//! - flushes output as the sockets accept it,
//! - drains the hand-off queues other threads feed through a
//!   [`WorkerHandle`].

mod event;
mod event_loop;
mod pipeline;
mod target;
mod worker;

pub(crate) mod handoff;
pub(crate) mod poller;

pub use handoff::WorkerHandle;
pub use worker::Worker;
