//! Growable byte buffer with position/limit bookmarks.
//!
//! Every [`Connection`](crate::Connection) owns two buffers: an input buffer
//! the worker appends socket bytes to, and an output buffer the protocol
//! appends responses to. The worker checkpoints both around each protocol
//! call and rolls them back when a message turns out to be incomplete.

use crate::reactor::poller::platform::{sys_read, sys_send};

use std::io;
use std::os::fd::RawFd;

/// Growable byte sequence with a read cursor (`position`) and the end of
/// the readable window (`limit`).
///
/// `position <= limit <= len()` holds at all times.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes held, consumed or not.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current read cursor.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the read cursor.
    ///
    /// # Panics
    ///
    /// Panics if `position > limit()`.
    pub fn set_position(&mut self, position: usize) {
        assert!(
            position <= self.limit,
            "position {position} beyond limit {}",
            self.limit
        );
        self.position = position;
    }

    /// End of the readable window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Narrows or widens the readable window.
    ///
    /// # Panics
    ///
    /// Panics if `limit` lies before the cursor or past the end of data.
    pub fn set_limit(&mut self, limit: usize) {
        assert!(
            self.position <= limit && limit <= self.data.len(),
            "limit {limit} outside [{}, {}]",
            self.position,
            self.data.len()
        );
        self.limit = limit;
    }

    /// Bytes between the cursor and the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Returns `true` if unconsumed bytes are left in the window.
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// The unconsumed window `[position, limit)`.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// The whole content, consumed bytes included.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Skips `n` bytes of the window.
    ///
    /// # Panics
    ///
    /// Panics if `n > remaining()`.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past limit");
        self.position += n;
    }

    /// Returns the next `n` bytes and moves the cursor past them, or `None`
    /// (cursor untouched) if fewer than `n` bytes are available.
    pub fn take(&mut self, n: usize) -> Option<&[u8]> {
        if n > self.remaining() {
            return None;
        }

        let start = self.position;
        self.position += n;

        Some(&self.data[start..start + n])
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    /// Returns the byte at `offset` from the cursor without consuming it.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        self.readable().get(offset).copied()
    }

    /// Returns the offset (relative to the cursor) of the first occurrence
    /// of `needle` inside the window.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }

        self.readable()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Appends bytes at the back; the window extends to the new end.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.limit = self.data.len();
    }

    /// Reads once from a non-blocking descriptor through `scratch` and
    /// appends what arrived.
    ///
    /// Returns `Ok(0)` when the peer closed the stream.
    pub(crate) fn append_from(&mut self, fd: RawFd, scratch: &mut [u8]) -> io::Result<usize> {
        let n = sys_read(fd, scratch)?;
        self.append(&scratch[..n]);

        Ok(n)
    }

    /// Flushes as many bytes as the socket accepts, starting at the front.
    ///
    /// Stops at `WouldBlock`. The flushed bytes stay in the buffer; callers
    /// drop them with [`delete_before`](Self::delete_before).
    pub(crate) fn write_to(&self, fd: RawFd) -> io::Result<usize> {
        let mut written = 0;

        while written < self.data.len() {
            match sys_send(fd, &self.data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    /// Drops the first `n` bytes; cursor and limit shift down with the data.
    pub fn delete_before(&mut self, n: usize) {
        let n = n.min(self.data.len());

        self.data.drain(..n);
        self.position = self.position.saturating_sub(n);
        self.limit = self.limit.saturating_sub(n);
    }

    /// Truncates the buffer back to `size` bytes.
    pub fn delete_after(&mut self, size: usize) {
        self.data.truncate(size);
        self.limit = self.limit.min(self.data.len());
        self.position = self.position.min(self.limit);
    }

    /// Restores a saved cursor and limit, clamped to the current contents.
    pub(crate) fn rewind(&mut self, position: usize, limit: usize) {
        self.limit = limit.min(self.data.len());
        self.position = position.min(self.limit);
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
        self.limit = 0;
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
