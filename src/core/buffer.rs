//! # Byte Buffer
//!
//! Growable byte buffer used for connection input and output.
//!
//! The buffer keeps two cursors over one allocation: bytes in
//! `[read_pos, write_pos)` are readable, bytes in `[write_pos, capacity)` are
//! writable. Producers ask for writable space with [`Buffer::get_writable`] and
//! then [`Buffer::commit`] what they filled; consumers look at
//! [`Buffer::readable`] and [`Buffer::consume`] what they used. Switching
//! between producing and consuming therefore never copies.
//!
//! A `Buffer` is owned by exactly one thread at a time (normally the reactor
//! thread owning the connection) and has no internal locking.

/// Growable read/write byte buffer.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Create a buffer with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of readable bytes held.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Whether no readable bytes are held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Total allocated size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Readable bytes (read mode view).
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Mark `n` readable bytes as consumed.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`Buffer::bytes`].
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.bytes(), "consume past end of buffer");
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Free space available for writing without compaction or growth.
    #[inline]
    pub fn free(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Writable tail (write mode view) holding at least `min_free` bytes.
    ///
    /// Compacts in place when the consumed prefix gives enough room,
    /// otherwise grows to the larger of double capacity and exactly enough.
    pub fn get_writable(&mut self, min_free: usize) -> &mut [u8] {
        self.ensure_free(min_free);
        &mut self.data[self.write_pos..]
    }

    /// Mark `n` bytes of the writable tail as filled.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`Buffer::free`].
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.free(), "commit past end of buffer");
        self.write_pos += n;
    }

    /// Append a slice.
    pub fn put(&mut self, src: &[u8]) {
        let dst = self.get_writable(src.len());
        dst[..src.len()].copy_from_slice(src);
        self.commit(src.len());
    }

    /// Drop all held bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Reallocate down to `size` if the buffer is larger and the held bytes fit.
    ///
    /// Returns whether a reallocation happened.
    pub fn shrink(&mut self, size: usize) -> bool {
        if self.capacity() <= size || self.bytes() > size {
            return false;
        }
        let mut data = vec![0; size];
        let held = self.bytes();
        data[..held].copy_from_slice(self.readable());
        self.data = data;
        self.read_pos = 0;
        self.write_pos = held;
        true
    }

    fn ensure_free(&mut self, min_free: usize) {
        if self.free() >= min_free {
            return;
        }
        let held = self.bytes();
        if self.data.len() - held >= min_free {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
        } else {
            let size = (self.data.len() * 2).max(held + min_free);
            let mut data = vec![0; size];
            data[..held].copy_from_slice(self.readable());
            self.data = data;
        }
        self.read_pos = 0;
        self.write_pos = held;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_consume() {
        let mut buf = Buffer::new(4);
        buf.put(b"abc");
        assert_eq!(buf.readable(), b"abc");
        buf.consume(2);
        assert_eq!(buf.readable(), b"c");
        buf.consume(1);
        assert!(buf.is_empty());
        assert_eq!(buf.free(), 4);
    }

    #[test]
    fn test_writable_compacts_before_growing() {
        let mut buf = Buffer::new(8);
        buf.put(b"12345678");
        buf.consume(6);
        let cap = buf.capacity();
        let free = buf.get_writable(5).len();
        assert_eq!(buf.capacity(), cap);
        assert_eq!(free, 6);
        assert_eq!(buf.readable(), b"78");
    }

    #[test]
    fn test_writable_grows_double_or_exact() {
        let mut buf = Buffer::new(8);
        buf.put(b"1234");
        buf.get_writable(6);
        assert_eq!(buf.capacity(), 16);

        let mut buf = Buffer::new(8);
        buf.put(b"1234");
        buf.get_writable(100);
        assert_eq!(buf.capacity(), 104);
        assert_eq!(buf.readable(), b"1234");
    }

    #[test]
    fn test_shrink_is_opportunistic() {
        let mut buf = Buffer::new(1024);
        buf.put(&[7; 100]);
        assert!(!buf.shrink(50));
        assert!(!buf.shrink(2048));
        assert!(buf.shrink(128));
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.readable(), &[7; 100][..]);
    }

    #[test]
    fn test_empty_buffer_grows_from_zero() {
        let mut buf = Buffer::default();
        buf.put(b"x");
        assert_eq!(buf.readable(), b"x");
    }
}
