//! # Buffer Pools
//!
//! Fixed-size byte buffers reused on the hot paths:
//!
//! - [`read_buffer`]: 16 KiB chunks read from the pseudo-terminal
//! - [`write_buffer`]: outgoing frames (a read chunk plus frame header)
//! - [`small_buffer`]: inbound messages of at most 256 bytes
//!
//! A checkout is a [`PooledBuf`] that goes back to its pool when dropped, so
//! every exit path of the code holding it returns the buffer, including `?`
//! and early returns.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use crate::protocol::FRAME_OVERHEAD;

/// Size of a chunk read from the terminal.
pub const READ_BUF_SIZE: usize = 16 * 1024;
/// Size of an outgoing frame buffer: one read chunk plus header bytes.
pub const WRITE_BUF_SIZE: usize = READ_BUF_SIZE + FRAME_OVERHEAD;
/// Inbound messages up to this size are decoded into a pooled buffer.
pub const SMALL_BUF_SIZE: usize = 256;

const MAX_IDLE: usize = 64;

static READ_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(READ_BUF_SIZE, MAX_IDLE));
static WRITE_POOL: LazyLock<BufferPool> =
    LazyLock::new(|| BufferPool::new(WRITE_BUF_SIZE, MAX_IDLE));
static SMALL_POOL: LazyLock<BufferPool> =
    LazyLock::new(|| BufferPool::new(SMALL_BUF_SIZE, MAX_IDLE * 4));

pub fn read_buffer() -> PooledBuf {
    READ_POOL.checkout()
}

pub fn write_buffer() -> PooledBuf {
    WRITE_POOL.checkout()
}

pub fn small_buffer() -> PooledBuf {
    SMALL_POOL.checkout()
}

struct PoolInner {
    buf_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
}

/// A pool of equally sized buffers.
///
/// Cloning the pool is cheap; all clones share the same idle list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool handing out `buf_size`-byte buffers and keeping at most
    /// `max_idle` of them around between checkouts.
    pub fn new(buf_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buf_size,
                max_idle,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Takes a buffer out of the pool, allocating when none is idle.
    ///
    /// The returned buffer starts with a length of zero; see
    /// [`PooledBuf::spare_mut`] and [`PooledBuf::set_len`].
    pub fn checkout(&self) -> PooledBuf {
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buf_size].into_boxed_slice());
        PooledBuf {
            buf: Some(buf),
            len: 0,
            pool: self.clone(),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Number of buffers currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    fn release(&self, buf: Box<[u8]>) {
        let mut idle = self.inner.idle.lock();
        if idle.len() < self.inner.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Dereferences to the filled part (`..len`). Returned to the pool on drop.
pub struct PooledBuf {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: BufferPool,
}

impl PooledBuf {
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// The whole backing storage, regardless of the current length.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }

    /// Sets the filled length, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Copies `data` in, replacing the current contents.
    ///
    /// Returns `false` and leaves the buffer untouched if `data` does not fit.
    pub fn fill_from(&mut self, data: &[u8]) -> bool {
        if data.len() > self.capacity() {
            return false;
        }
        self.spare_mut()[..data.len()].copy_from_slice(data);
        self.len = data.len();
        true
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.buf {
            Some(buf) => &mut buf[..len],
            None => &mut [],
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
