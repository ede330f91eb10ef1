use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

const MAX_CACHED_PER_THREAD: usize = 16;

thread_local! {
    static FREE_LIST: RefCell<Vec<Box<[u8]>>> = const { RefCell::new(Vec::new()) };
}

/// Source of fixed size byte buffers.
///
/// Buffers handed out by [`BufferPool::rent`] must be given back exactly once. Use
/// [`PooledBuffer`] rather than calling [`BufferPool::give_back`] directly.
pub trait BufferPool: Send + Sync + fmt::Debug {
    /// Take a zeroed buffer of at least `size` bytes.
    fn rent(&self, size: usize) -> Box<[u8]>;

    /// Return a buffer previously obtained from [`BufferPool::rent`].
    fn give_back(&self, buffer: Box<[u8]>);
}

/// Process wide pool backed by small per-thread free lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedBufferPool;

impl BufferPool for SharedBufferPool {
    fn rent(&self, size: usize) -> Box<[u8]> {
        let cached = FREE_LIST.with(|list| {
            let mut list = list.borrow_mut();
            let position = list.iter().position(|buffer| buffer.len() >= size)?;
            Some(list.swap_remove(position))
        });
        cached.unwrap_or_else(|| vec![0; size].into_boxed_slice())
    }

    fn give_back(&self, buffer: Box<[u8]>) {
        FREE_LIST.with(|list| {
            let mut list = list.borrow_mut();
            if list.len() < MAX_CACHED_PER_THREAD {
                list.push(buffer);
            }
        });
    }
}

/// A rented buffer that is cleared and returned to its pool on drop.
pub struct PooledBuffer<'a> {
    pool: &'a dyn BufferPool,
    buffer: Option<Box<[u8]>>,
    len: usize,
}

impl<'a> PooledBuffer<'a> {
    /// Rent `size` bytes from `pool`.
    pub fn rent(pool: &'a dyn BufferPool, size: usize) -> Self {
        let buffer = pool.rent(size);
        Self {
            pool,
            buffer: Some(buffer),
            len: size,
        }
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buffer {
            Some(buffer) => &buffer[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buffer {
            Some(buffer) => &mut buffer[..self.len],
            None => &mut [],
        }
    }
}

impl fmt::Debug for PooledBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len).finish()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            // Copied payload must not leak into the next rental.
            buffer.fill(0);
            self.pool.give_back(buffer);
        }
    }
}
