use crate::errors::VirtualFileResult;
use crate::resource_pool::ResourcePool;

/// Fixed capacity byte region with a counter of currently valid bytes.
///
/// A buffer always has a single owner: the pool, a download worker or a cache entry.
pub struct Buffer {
    data: Box<[u8]>,
    actual_size: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Buffer {
            data: vec![0; capacity].into_boxed_slice(),
            actual_size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes
    pub fn actual_size(&self) -> usize {
        self.actual_size
    }

    pub fn is_empty(&self) -> bool {
        self.actual_size == 0
    }

    pub fn is_full(&self) -> bool {
        self.actual_size == self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.actual_size
    }

    pub fn clear(&mut self) {
        self.actual_size = 0;
    }

    /// Append as much of `chunk` as fits, returns the number of copied bytes.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        let size_to_copy = self.remaining().min(chunk.len());
        self.data[self.actual_size..self.actual_size + size_to_copy]
            .copy_from_slice(&chunk[..size_to_copy]);
        self.actual_size += size_to_copy;
        size_to_copy
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.actual_size]
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("actual_size", &self.actual_size)
            .finish()
    }
}

/// Bounded set of equally sized buffers, gating the memory of the block cache.
pub struct BufferPool {
    buffers: ResourcePool<Buffer>,
    buffer_size: usize,
}

impl BufferPool {
    /// Buffers are allocated on first use, never more than `count` of them.
    pub fn new(count: usize, buffer_size: usize) -> Self {
        BufferPool {
            buffers: ResourcePool::with_factory(count, move || Buffer::new(buffer_size)),
            buffer_size,
        }
    }

    pub fn acquire(&self) -> VirtualFileResult<Buffer> {
        self.buffers.acquire()
    }

    pub fn release(&self, mut buffer: Buffer) {
        debug_assert_eq!(buffer.capacity(), self.buffer_size);
        buffer.clear();
        self.buffers.release(buffer);
    }

    pub fn close(&self) {
        self.buffers.close();
    }

    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Buffers which can be handed out without waiting
    pub fn available(&self) -> usize {
        self.buffers.available()
    }

    /// Buffers allocated so far, idle or in use
    pub fn allocated(&self) -> usize {
        self.buffers.created()
    }

    pub fn idle(&self) -> usize {
        self.buffers.idle()
    }
}
