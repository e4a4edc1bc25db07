use super::{Connection, ConnectionRef};
use crate::error::{Error, Result};
use crate::reactor::WorkerHandle;

/// Bounded arena of reusable connections.
///
/// Slots are addressed by index and never destroyed: a released connection
/// goes back on the free list and is reopened by a later acquire. The arena
/// grows one slot at a time until `capacity` is reached, after which
/// acquisition is rejected.
pub(crate) struct ConnectionPool {
    slots: Vec<Connection>,
    free: Vec<usize>,
    capacity: usize,
    worker: WorkerHandle,
}

impl ConnectionPool {
    /// Creates a pool with `initial` pre-built slots.
    pub(crate) fn new(initial: usize, capacity: usize, worker: WorkerHandle) -> Self {
        let initial = initial.min(capacity);

        let slots: Vec<Connection> = (0..initial)
            .map(|index| Connection::new(index, worker.clone()))
            .collect();
        let free = (0..initial).rev().collect();

        Self {
            slots,
            free,
            capacity,
            worker,
        }
    }

    /// Hands out an open connection with empty buffers.
    pub(crate) fn acquire(&mut self) -> Result<&mut Connection> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                let index = self.slots.len();
                self.slots.push(Connection::new(index, self.worker.clone()));
                index
            }
            None => {
                return Err(Error::PoolExhausted {
                    capacity: self.capacity,
                });
            }
        };

        let conn = &mut self.slots[index];
        conn.reopen();

        Ok(conn)
    }

    /// Returns a connection to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the connection was not reset first.
    pub(crate) fn release(&mut self, index: usize) {
        let conn = &self.slots[index];
        assert!(
            conn.is_reset(),
            "connection {index} released without being reset"
        );

        self.free.push(index);
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Connection> {
        self.slots.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.slots.get_mut(index)
    }

    /// Looks up the live connection a cross-thread reference points to.
    ///
    /// Returns `None` when the slot was closed or recycled since the
    /// reference was taken.
    pub(crate) fn resolve(&mut self, conn: ConnectionRef) -> Option<&mut Connection> {
        self.slots
            .get_mut(conn.index)
            .filter(|c| !c.closed && c.generation() == conn.generation)
    }

    /// Number of connections currently handed out.
    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of slots constructed so far.
    pub(crate) fn allocated(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Role;
    use crate::reactor::handoff::test_handle;

    fn pool(initial: usize, capacity: usize) -> ConnectionPool {
        ConnectionPool::new(initial, capacity, test_handle())
    }

    fn release(pool: &mut ConnectionPool, index: usize) {
        pool.get_mut(index).unwrap().reset();
        pool.release(index);
    }

    #[test]
    fn acquired_connection_starts_open_and_empty() {
        let mut pool = pool(2, 4);
        let conn = pool.acquire().unwrap();

        assert!(!conn.is_closed());
        assert!(conn.input().is_empty());
        assert!(conn.output().is_empty());
    }

    #[test]
    fn grows_up_to_capacity_then_rejects() {
        let mut pool = pool(0, 2);

        pool.acquire().unwrap();
        pool.acquire().unwrap();

        assert_eq!(pool.allocated(), 2);
        assert!(matches!(
            pool.acquire(),
            Err(Error::PoolExhausted { capacity: 2 })
        ));
    }

    #[test]
    fn released_slot_is_reused_with_new_generation() {
        let mut pool = pool(1, 1);

        let first = {
            let conn = pool.acquire().unwrap();
            conn.attach_socket(-1, 0, Role::Server, None);
            conn.write(b"response");
            conn.handle()
        };

        release(&mut pool, first.index);
        assert!(pool.resolve(first).is_none());

        let second = pool.acquire().unwrap().handle();

        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    #[should_panic(expected = "without being reset")]
    fn releasing_dirty_connection_panics() {
        let mut pool = pool(1, 1);
        let index = {
            let conn = pool.acquire().unwrap();
            conn.write(b"left over");
            conn.index()
        };

        pool.release(index);
    }

    #[test]
    fn resolve_finds_live_connection() {
        let mut pool = pool(1, 4);
        let handle = pool.acquire().unwrap().handle();

        assert!(pool.resolve(handle).is_some());
    }
}
