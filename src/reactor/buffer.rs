//! Read-buffer pool.
//!
//! Every readable event borrows one fixed-size buffer for the duration of a
//! single read syscall and returns it before the handler exits. Buffers are
//! reused through a LIFO free list; the pool grows when the free list runs
//! dry, so `acquire` never fails.

/// Pool of fixed-size scratch buffers with a LIFO free list.
///
/// The in-flight counter tracks acquire/release pairing: it must read zero
/// whenever no read is in progress, which the tests assert after every
/// connection teardown.
pub struct BufferPool {
    /// Actual buffer storage.
    buffers: Vec<Vec<u8>>,
    /// Stack of available buffer indices (LIFO for cache locality).
    free_list: Vec<usize>,
    /// Size of each buffer.
    buffer_size: usize,
    /// Buffers currently handed out.
    in_flight: usize,
}

impl BufferPool {
    /// Create a pool with `count` pre-allocated buffers of `size` bytes each.
    pub fn new(count: usize, size: usize) -> Self {
        let mut buffers = Vec::with_capacity(count);
        let mut free_list = Vec::with_capacity(count);

        for i in 0..count {
            buffers.push(vec![0u8; size]);
            free_list.push(i);
        }

        Self {
            buffers,
            free_list,
            buffer_size: size,
            in_flight: 0,
        }
    }

    /// Borrow a buffer from the pool.
    ///
    /// `size_hint` is advisory and must not exceed the pool's buffer size;
    /// every buffer in the pool shares one size. A fresh buffer is allocated
    /// when the free list is empty.
    pub fn acquire(&mut self, size_hint: usize) -> usize {
        debug_assert!(
            size_hint <= self.buffer_size,
            "size hint exceeds pool buffer size"
        );
        self.in_flight += 1;
        match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.buffers.push(vec![0u8; self.buffer_size]);
                self.buffers.len() - 1
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Each `acquire` must be paired with exactly one `release`.
    pub fn release(&mut self, idx: usize) {
        debug_assert!(idx < self.buffers.len(), "buffer index out of bounds");
        debug_assert!(self.in_flight > 0, "release without matching acquire");
        self.in_flight -= 1;
        self.free_list.push(idx);
    }

    /// Get a mutable reference to a buffer.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn get_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.buffers[idx]
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers, free or in flight.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Number of buffers currently handed out.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_pairing() {
        let mut pool = BufferPool::new(4, 1024);

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.buffer_size(), 1024);

        let b0 = pool.acquire(1024);
        let b1 = pool.acquire(512);
        assert_eq!(pool.in_flight(), 2);

        // Write and read
        pool.get_mut(b0)[0] = 42;
        assert_eq!(pool.get_mut(b0)[0], 42);

        pool.release(b0);
        pool.release(b1);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.capacity(), 4); // no growth needed
    }

    #[test]
    fn lifo_reuse() {
        let mut pool = BufferPool::new(2, 64);

        let b0 = pool.acquire(64);
        pool.release(b0);

        let b1 = pool.acquire(64);
        assert_eq!(b1, b0); // LIFO reuse
        pool.release(b1);
    }

    #[test]
    fn grows_when_exhausted() {
        let mut pool = BufferPool::new(1, 64);

        let b0 = pool.acquire(64);
        let b1 = pool.acquire(64);
        assert_ne!(b0, b1);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.in_flight(), 2);

        pool.release(b1);
        pool.release(b0);
        assert_eq!(pool.in_flight(), 0);
    }
}
