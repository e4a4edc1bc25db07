use super::event::Event;
use super::handoff::{Shared, WorkerHandle};
use super::pipeline;
use super::poller::platform::{sys_close, sys_peername, sys_take_socket_error};
use super::poller::{Interest, Poller};
use super::target::{ConnectionTarget, PendingChannel};
use crate::config::WorkerConfig;
use crate::connection::Role;
use crate::connection::pool::ConnectionPool;
use crate::protocol::Protocol;
use crate::utils::Slab;

use tracing::{debug, error, trace, warn};

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

/// What a registration token refers to.
enum Entry {
    /// An outbound connect waiting for completion.
    Connecting(ConnectionTarget),

    /// An established connection, by pool slot.
    Connection(usize),
}

/// The worker's event loop.
///
/// Owns the poller, the registration table and the connection pool. Only
/// the worker thread ever touches them; other threads go through the
/// queues in [`Shared`].
pub(crate) struct EventLoop<P> {
    shared: Arc<Shared>,
    protocol: Arc<P>,
    poller: Poller,

    /// Readiness events of the last poll.
    events: Vec<Event>,

    /// Registration table indexed by poller tokens.
    registrations: Slab<Entry>,

    pool: ConnectionPool,

    /// Targets waiting for their next connect attempt.
    retrying: Vec<ConnectionTarget>,

    /// Read staging area, `read_chunk` bytes.
    scratch: Vec<u8>,

    max_pipeline: usize,
    max_input_size: usize,
    select_timeout: Duration,
}

impl<P: Protocol> EventLoop<P> {
    pub(crate) fn new(
        config: &WorkerConfig,
        shared: Arc<Shared>,
        poller: Poller,
        protocol: Arc<P>,
    ) -> Self {
        let pool = ConnectionPool::new(
            config.initial_pool_size,
            config.pool_capacity,
            WorkerHandle::new(shared.clone()),
        );

        Self {
            shared,
            protocol,
            poller,
            events: Vec::with_capacity(256),
            registrations: Slab::new(config.initial_pool_size.max(16)),
            pool,
            retrying: Vec::new(),
            scratch: vec![0; config.read_chunk],
            max_pipeline: config.max_pipeline,
            max_input_size: config.max_input_size,
            select_timeout: config.select_timeout,
        }
    }

    /// Main loop.
    ///
    /// Each iteration:
    /// 1. waits for readiness, at most `select_timeout`,
    /// 2. dispatches every ready registration,
    /// 3. drains the hand-off queues.
    ///
    /// Returns once shutdown was requested, after closing everything.
    pub(crate) fn run(&mut self) {
        let _ = self.shared.owner.set(thread::current().id());
        debug!(worker = %self.shared.name, "worker started");

        while !self.shared.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poller.poll(&mut self.events, Some(self.select_timeout)) {
                error!(worker = %self.shared.name, error = %e, "poll failed");
            }

            let events = mem::take(&mut self.events);
            for event in &events {
                self.dispatch(*event);
            }
            self.events = events;

            self.do_processing();
        }

        self.close_all();
        debug!(worker = %self.shared.name, "worker stopped");
    }

    fn dispatch(&mut self, event: Event) {
        match self.registrations.get(event.token) {
            Some(Entry::Connecting(_)) => self.finish_connect(event.token),

            Some(&Entry::Connection(index)) => {
                if event.error && !event.readable && !event.writable {
                    warn!(worker = %self.shared.name, token = event.token, "socket error");
                    self.close(index);
                    return;
                }

                if event.readable {
                    self.handle_read(index);
                }

                if event.writable && self.is_registered(index, event.token) {
                    self.handle_write(index);
                }
            }

            None => trace!(token = event.token, "event for a stale registration"),
        }
    }

    fn is_registered(&self, index: usize, token: usize) -> bool {
        self.pool
            .get(index)
            .is_some_and(|conn| !conn.closed && conn.token == Some(token))
    }

    /// Completes a pending outbound connect, or schedules another attempt.
    fn finish_connect(&mut self, token: usize) {
        let Some(Entry::Connecting(mut target)) = self.registrations.remove(token) else {
            return;
        };

        if let Err(e) = self.poller.deregister(target.fd) {
            trace!(address = %target.addr, error = %e, "deregister failed");
        }

        let established = sys_take_socket_error(target.fd).and_then(|()| sys_peername(target.fd));

        match established {
            Ok(_) => {
                debug!(worker = %self.shared.name, address = %target.addr, "connected");
                self.promote(target.into_channel());
            }
            Err(e) => {
                debug!(address = %target.addr, error = %e, "connect failed");
                target.schedule_retry(self.shared.reconnect_delay, &self.shared.socket);
                self.retrying.push(target);
            }
        }
    }

    fn handle_read(&mut self, index: usize) {
        let Some(conn) = self.pool.get_mut(index) else {
            return;
        };
        if conn.closed || conn.peer_closed {
            return;
        }

        if conn.completed_input_pos > 0 {
            conn.input.delete_before(conn.completed_input_pos);
            conn.completed_input_pos = 0;
        }

        match conn.input.append_from(conn.fd, &mut self.scratch) {
            Ok(0) => {
                debug!(peer = ?conn.peer_addr(), "the other end closed the connection");
                self.end_of_input(index);
                return;
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return;
            }
            Err(e) => {
                debug!(peer = ?conn.peer_addr(), error = %e, "read failed");
                self.remote_closed(index);
                return;
            }
        }

        if conn.input.size() > self.max_input_size {
            error!(
                peer = ?conn.peer_addr(),
                size = conn.input.size(),
                "input exceeds max_input_size, closing"
            );
            self.close(index);
            return;
        }

        if conn.is_async() {
            return;
        }

        pipeline::process(&*self.protocol, conn, self.max_pipeline);
        self.after_processing(index);
    }

    fn handle_write(&mut self, index: usize) {
        let Some(conn) = self.pool.get_mut(index) else {
            return;
        };
        if conn.closed {
            return;
        }

        match conn.output.write_to(conn.fd) {
            Ok(n) => conn.output.delete_before(n),
            Err(e) => {
                debug!(peer = ?conn.peer_addr(), error = %e, "write failed");
                self.remote_closed(index);
                return;
            }
        }

        if conn.output.is_empty() {
            if conn.peer_closed {
                self.remote_closed(index);
            } else if conn.closes_after_write() {
                self.close(index);
            } else {
                self.set_interest(index, Interest::READ);
            }
        } else {
            self.set_interest(index, Interest::READ_WRITE);
        }
    }

    /// Applies the state a processing pass left behind.
    fn after_processing(&mut self, index: usize) {
        let Some(conn) = self.pool.get(index) else {
            return;
        };
        if conn.closed {
            return;
        }

        if conn.close_requested() {
            self.close(index);
        } else if !conn.output.is_empty() {
            self.set_interest(index, Interest::READ_WRITE);
        } else if conn.closes_after_write() {
            self.close(index);
        }
    }

    /// The peer stopped sending. Responses still queued are flushed before
    /// the connection goes away; reading stops.
    fn end_of_input(&mut self, index: usize) {
        let Some(conn) = self.pool.get_mut(index) else {
            return;
        };
        if conn.output.is_empty() {
            self.remote_closed(index);
            return;
        }

        trace!(peer = ?conn.peer_addr(), pending = conn.output.size(), "flushing before close");

        conn.peer_closed = true;
        conn.close_after_write();
        self.set_interest(index, Interest::WRITE);
    }

    /// Closes a connection the peer went away from. Client connections are
    /// reconnected to their original address.
    fn remote_closed(&mut self, index: usize) {
        let reconnect = self
            .pool
            .get(index)
            .filter(|conn| conn.is_client())
            .and_then(|conn| conn.peer_addr());

        self.close(index);

        if let Some(addr) = reconnect {
            self.reconnect(addr);
        }
    }

    fn reconnect(&mut self, addr: SocketAddr) {
        let target =
            ConnectionTarget::reconnect(addr, self.shared.reconnect_delay, &self.shared.socket);
        self.retrying.push(target);
    }

    /// Drops a socket that could not be promoted. An outbound one is
    /// connected again later.
    fn reject(&mut self, channel: PendingChannel) {
        let reconnect = channel.addr.filter(|_| channel.is_client);
        drop(channel);

        if let Some(addr) = reconnect {
            debug!(address = %addr, "will reconnect");
            self.reconnect(addr);
        }
    }

    fn set_interest(&mut self, index: usize, interest: Interest) {
        let Some(conn) = self.pool.get_mut(index) else {
            return;
        };
        let interest = Interest {
            read: interest.read && !conn.peer_closed,
            ..interest
        };
        if conn.closed || conn.interest == interest {
            return;
        }
        let Some(token) = conn.token else {
            return;
        };

        match self.poller.reregister(conn.fd, token, interest) {
            Ok(()) => conn.interest = interest,
            Err(e) => {
                warn!(peer = ?conn.peer_addr(), error = %e, "failed to change interest");
                self.close(index);
            }
        }
    }

    /// Tears a connection down and returns it to the pool. Idempotent.
    fn close(&mut self, index: usize) {
        let Some(conn) = self.pool.get_mut(index) else {
            return;
        };
        if conn.closed {
            return;
        }

        if let Some(token) = conn.token {
            self.registrations.remove(token);
        }
        if let Err(e) = self.poller.deregister(conn.fd) {
            trace!(error = %e, "deregister failed");
        }
        sys_close(conn.fd);

        debug!(peer = ?conn.peer_addr(), role = ?conn.role(), "closed connection");

        conn.reset();
        self.pool.release(index);
    }

    /// Turns a connected socket into a pooled connection and gives the
    /// protocol its initial attempt.
    fn promote(&mut self, channel: PendingChannel) {
        let index = match self.pool.acquire() {
            Ok(conn) => conn.index(),
            Err(e) => {
                warn!(worker = %self.shared.name, error = %e, "rejecting connection");
                self.reject(channel);
                return;
            }
        };

        let token = self.registrations.insert(Entry::Connection(index));

        if let Err(e) = self.poller.register(channel.fd, token, Interest::READ) {
            warn!(worker = %self.shared.name, error = %e, "failed to register connection");

            self.registrations.remove(token);
            if let Some(conn) = self.pool.get_mut(index) {
                conn.reset();
            }
            self.pool.release(index);
            self.reject(channel);
            return;
        }

        let (role, peer) = if channel.is_client {
            (Role::Client, channel.addr)
        } else {
            (Role::Server, sys_peername(channel.fd).ok())
        };
        let fd = channel.into_raw_fd();

        let Some(conn) = self.pool.get_mut(index) else {
            return;
        };
        conn.attach_socket(fd, token, role, peer);

        debug!(worker = %self.shared.name, ?peer, ?role, "connected");

        pipeline::attempt(&*self.protocol, conn);
        conn.set_initial(false);

        self.after_processing(index);
    }

    /// Drains the hand-off queues, in this order: connect targets, newly
    /// connected sockets, restarted connections, write requests.
    fn do_processing(&mut self) {
        self.start_connecting();
        self.promote_connected();
        self.restart_async();
        self.apply_write_requests();
    }

    fn start_connecting(&mut self) {
        while let Some(target) = self.shared.connecting.pop() {
            self.retrying.push(target);
        }

        let now = Instant::now();
        let socket = self.shared.socket;
        let delay = self.shared.reconnect_delay;

        for mut target in mem::take(&mut self.retrying) {
            if !target.is_due(now) {
                self.retrying.push(target);
                continue;
            }

            if !target.started {
                debug!(address = %target.addr, "connecting");

                if let Err(e) = target.start(&socket) {
                    debug!(address = %target.addr, error = %e, "connect failed");
                    target.schedule_retry(delay, &socket);
                    self.retrying.push(target);
                    continue;
                }
            }

            let fd = target.fd;
            let token = self.registrations.insert(Entry::Connecting(target));

            if let Err(e) = self.poller.register(fd, token, Interest::CONNECT) {
                warn!(error = %e, "failed to register connect");

                if let Some(Entry::Connecting(mut target)) = self.registrations.remove(token) {
                    target.schedule_retry(delay, &socket);
                    self.retrying.push(target);
                }
            }
        }
    }

    fn promote_connected(&mut self) {
        for _ in 0..self.shared.connected.len() {
            let Some(channel) = self.shared.connected.pop() else {
                break;
            };
            self.promote(channel);
        }
    }

    fn restart_async(&mut self) {
        for _ in 0..self.shared.restarting.len() {
            let Some(conn_ref) = self.shared.restarting.pop() else {
                break;
            };
            let Some(conn) = self.pool.resolve(conn_ref) else {
                trace!(conn = ?conn_ref, "restart of a recycled connection ignored");
                continue;
            };

            trace!(conn = ?conn_ref, "restarting");

            let index = conn.index();
            pipeline::resume(&*self.protocol, conn, self.max_pipeline);
            self.after_processing(index);
        }
    }

    fn apply_write_requests(&mut self) {
        let requests = mem::take(&mut *self.shared.pending_writes.lock());

        for conn_ref in requests {
            if let Some(conn) = self.pool.resolve(conn_ref) {
                let index = conn.index();
                self.set_interest(index, Interest::READ_WRITE);
            }
        }
    }

    /// Closes every connection and pending connect on shutdown.
    fn close_all(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);

        debug!(
            worker = %self.shared.name,
            registrations = self.registrations.len(),
            retrying = self.retrying.len(),
            "closing all connections"
        );

        for token in self.registrations.indices() {
            match self.registrations.get(token) {
                Some(&Entry::Connection(index)) => self.close(index),
                Some(Entry::Connecting(_)) => {
                    if let Some(Entry::Connecting(target)) = self.registrations.remove(token) {
                        let _ = self.poller.deregister(target.fd);
                    }
                }
                None => {}
            }
        }

        self.retrying.clear();
        while self.shared.connecting.pop().is_some() {}
        while self.shared.connected.pop().is_some() {}

        debug!(
            worker = %self.shared.name,
            pooled = self.pool.allocated(),
            in_use = self.pool.in_use(),
            "closed all connections"
        );
    }
}

impl<P> Drop for EventLoop<P> {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
    }
}
