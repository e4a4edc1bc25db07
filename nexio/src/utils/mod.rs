//! Utilities for memory-efficient data structures.
//!
//! This module provides low-level utilities used internally by the worker.
//! In particular, it exposes a [`Slab`] used as the registration table,
//! mapping poller tokens to registrations with reuse of freed slots.

mod slab;

pub(crate) use slab::Slab;
