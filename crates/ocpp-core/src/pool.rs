//! `BufferPool`: reusable encode buffers.
//!
//! Outbound frames are serialized into a pooled `Vec<u8>` instead of a fresh
//! allocation per message. Free buffers sit in a bounded lock-free queue;
//! when the queue is full, or a buffer grew beyond the retention cap, the
//! buffer is simply dropped.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use serde::Serialize;

pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    /// Initial capacity for newly allocated buffers.
    buffer_size: usize,
    /// Buffers above this capacity are not returned to the pool.
    max_retained: usize,
    allocated: AtomicUsize,
    reused: AtomicUsize,
}

impl BufferPool {
    pub fn new(slots: usize, buffer_size: usize) -> Self {
        Self {
            free: ArrayQueue::new(slots.max(1)),
            buffer_size,
            max_retained: buffer_size * 16,
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = match self.free.pop() {
            Some(buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.buffer_size)
            }
        };
        PooledBuffer { buf, pool: self }
    }

    /// Serialize `value` as JSON into a pooled buffer.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<PooledBuffer<'_>, serde_json::Error> {
        let mut buf = self.acquire();
        serde_json::to_writer(&mut buf.buf, value)?;
        Ok(buf)
    }

    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_retained {
            return;
        }
        buf.clear();
        let _ = self.free.push(buf);
    }

    /// Buffers created because the free list was empty.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Acquisitions served from the free list.
    pub fn reused(&self) -> usize {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256, 1024) // 1 KiB covers most OCPP frames
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl PooledBuffer<'_> {
    /// View as UTF-8. Always succeeds for buffers filled by `encode`.
    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.buf)
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_and_reuse() {
        let pool = BufferPool::new(4, 64);
        {
            let buf = pool.encode(&json!([2, "a", "Heartbeat", {}])).unwrap();
            assert_eq!(buf.as_str().unwrap(), r#"[2,"a","Heartbeat",{}]"#);
        }
        assert_eq!(pool.idle(), 1);
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn test_oversized_buffers_dropped() {
        let pool = BufferPool::new(4, 8);
        {
            let mut buf = pool.acquire();
            buf.as_mut_vec().resize(1024, b'x');
        }
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_full_free_list_drops_extra() {
        let pool = BufferPool::new(1, 16);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }
}
