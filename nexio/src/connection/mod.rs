//! Per-socket connection state.
//!
//! A [`Connection`] is owned by exactly one worker and mutated only on that
//! worker's thread. Other threads refer to it through a [`ConnectionRef`],
//! a plain `(slot, generation)` pair that goes stale as soon as the slot is
//! recycled.

pub(crate) mod pool;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::reactor::WorkerHandle;
use crate::reactor::poller::Interest;

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Which side opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Opened by this process through an outbound connect.
    Client,
    /// Accepted from a listener.
    Server,
}

/// Thread-safe identity of a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionRef {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// Handle a protocol hands to another thread to finish an asynchronous
/// connection.
#[derive(Clone)]
pub struct AsyncHandle {
    conn: ConnectionRef,
    worker: WorkerHandle,
}

impl AsyncHandle {
    /// The connection this handle resumes.
    pub fn connection(&self) -> ConnectionRef {
        self.conn
    }

    /// Asks the owning worker to run the protocol on the connection again.
    pub fn resume(&self) -> Result<()> {
        self.worker.restart(self.conn)
    }

    /// Asks the owning worker to flush the connection's output.
    pub fn want_to_write(&self) -> Result<()> {
        self.worker.want_to_write(self.conn)
    }
}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("conn", &self.conn)
            .field("worker", &self.worker.name())
            .finish()
    }
}

/// State of one socket attached to a worker.
pub struct Connection {
    pub(crate) input: Buffer,
    pub(crate) output: Buffer,

    /// Socket descriptor, `-1` while pooled.
    pub(crate) fd: RawFd,

    /// Registration token in the worker's table, exclusive while attached.
    pub(crate) token: Option<usize>,

    /// Interest currently applied to the registration.
    pub(crate) interest: Interest,

    /// High-water mark of fully processed input.
    pub(crate) completed_input_pos: usize,

    pub(crate) closed: bool,
    pub(crate) done: bool,

    /// The peer finished sending; only the pending output is still flushed.
    pub(crate) peer_closed: bool,

    role: Role,
    is_async: bool,
    initial: bool,
    close_after_write: bool,
    close_requested: bool,
    peer: Option<SocketAddr>,

    index: usize,
    generation: u64,
    worker: WorkerHandle,
    attachment: Option<Box<dyn Any + Send>>,
}

impl Connection {
    /// Creates a pooled (closed) connection for slot `index`.
    pub(crate) fn new(index: usize, worker: WorkerHandle) -> Self {
        Self {
            input: Buffer::new(),
            output: Buffer::new(),
            fd: -1,
            token: None,
            interest: Interest::READ,
            completed_input_pos: 0,
            closed: true,
            done: false,
            peer_closed: false,
            role: Role::Server,
            is_async: false,
            initial: false,
            close_after_write: false,
            close_requested: false,
            peer: None,
            index,
            generation: 0,
            worker,
            attachment: None,
        }
    }

    /// Read side: unconsumed request bytes live in `[position, limit)`.
    pub fn input(&self) -> &Buffer {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Buffer {
        &mut self.input
    }

    /// Bytes queued for the peer.
    pub fn output(&self) -> &Buffer {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Buffer {
        &mut self.output
    }

    /// Appends bytes to the output.
    pub fn write(&mut self, bytes: &[u8]) {
        self.output.append(bytes);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    /// `true` during the processing attempt that runs right after the
    /// connection was established.
    pub fn is_initial(&self) -> bool {
        self.initial
    }

    /// `true` once the connection is closed or a close was requested.
    pub fn is_closed(&self) -> bool {
        self.closed || self.close_requested
    }

    /// `true` if the last message completed and its response is ready.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Defers completion of the current message.
    ///
    /// The worker stops processing the connection until it is resumed via
    /// [`AsyncHandle::resume`].
    pub fn set_async(&mut self) -> AsyncHandle {
        self.is_async = true;
        self.async_handle()
    }

    /// Handle usable from any thread to resume or flush this connection.
    pub fn async_handle(&self) -> AsyncHandle {
        AsyncHandle {
            conn: self.handle(),
            worker: self.worker.clone(),
        }
    }

    /// Thread-safe identity of this connection.
    pub fn handle(&self) -> ConnectionRef {
        ConnectionRef {
            index: self.index,
            generation: self.generation,
        }
    }

    /// Requests an immediate close; pending output is discarded.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    /// Requests a close once the output has been fully flushed.
    pub fn close_after_write(&mut self) {
        self.close_after_write = true;
    }

    pub fn closes_after_write(&self) -> bool {
        self.close_after_write
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Remote address of the socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Input position up to which messages were fully processed.
    pub fn completed_input_pos(&self) -> usize {
        self.completed_input_pos
    }

    /// Stores protocol-specific state; replaced on each call and dropped
    /// when the connection returns to the pool.
    pub fn attach<T: Any + Send>(&mut self, value: T) {
        self.attachment = Some(Box::new(value));
    }

    pub fn attachment<T: Any + Send>(&self) -> Option<&T> {
        self.attachment.as_ref()?.downcast_ref()
    }

    pub fn attachment_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.attachment.as_mut()?.downcast_mut()
    }

    pub fn take_attachment<T: Any + Send>(&mut self) -> Option<T> {
        let boxed = self.attachment.take()?;

        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.attachment = Some(other);
                None
            }
        }
    }

    /// Clears the per-attempt flags before the protocol runs.
    pub(crate) fn begin_attempt(&mut self) {
        self.done = false;
        self.is_async = false;
    }

    pub(crate) fn set_initial(&mut self, initial: bool) {
        self.initial = initial;
    }

    /// Takes a recycled slot back into service.
    ///
    /// # Panics
    ///
    /// Panics if the slot was not closed, which means it was handed out
    /// twice.
    pub(crate) fn reopen(&mut self) {
        assert!(self.closed, "pooled connection {} is still open", self.index);
        debug_assert!(self.is_reset());

        self.closed = false;
        self.initial = true;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Binds the connection to its socket and registration.
    pub(crate) fn attach_socket(
        &mut self,
        fd: RawFd,
        token: usize,
        role: Role,
        peer: Option<SocketAddr>,
    ) {
        self.fd = fd;
        self.token = Some(token);
        self.interest = Interest::READ;
        self.role = role;
        self.peer = peer;
    }

    /// Restores the pooled state.
    pub(crate) fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.fd = -1;
        self.token = None;
        self.interest = Interest::READ;
        self.completed_input_pos = 0;
        self.closed = true;
        self.done = false;
        self.peer_closed = false;
        self.role = Role::Server;
        self.is_async = false;
        self.initial = false;
        self.close_after_write = false;
        self.close_requested = false;
        self.peer = None;
        self.attachment = None;
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.closed && self.input.is_empty() && self.output.is_empty() && self.token.is_none()
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .field("async", &self.is_async)
            .field("input", &self.input.remaining())
            .field("output", &self.output.size())
            .finish()
    }
}
