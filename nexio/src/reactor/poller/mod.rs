//! Platform-specific readiness poller.
//!
//! The worker uses the poller to:
//! - wait (with a bounded timeout) for socket readiness,
//! - change the interest set of a registration,
//! - get interrupted by other threads after they enqueue work.
//!
//! The concrete implementation is selected at compile time
//! depending on the target operating system.

pub(crate) mod common;

pub(crate) use common::{Interest, Waker};

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) type Poller = kqueue::KqueuePoller;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) type Poller = epoll::EpollPoller;

pub(crate) mod unix;

pub(crate) use unix as platform;
