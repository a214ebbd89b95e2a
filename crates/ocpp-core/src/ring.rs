//! Growable ring buffer queue.
//!
//! Backing storage is a power-of-two slot array (minimum [`MIN_CAPACITY`]),
//! indexed with a mask instead of a modulo.
//!
//! ```text
//!   head                 head+len
//!    │                      │
//!    ▼                      ▼
//! [ . . A B C D E . . . . . ]   slots.len() == capacity (2^k)
//! ```
//!
//! - `push` doubles capacity when full (amortized O(1))
//! - `pop` halves capacity when occupancy drops to 25% and capacity is
//!   above the minimum
//! - `peek`, `len`, `is_empty` take the shared lock; mutations take the
//!   exclusive lock
//!
//! Used for the dispatcher's per-connection call queues and for each
//! reactor's injected-task queue.

use parking_lot::RwLock;

/// Smallest backing array the queue ever uses.
pub const MIN_CAPACITY: usize = 32;

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn push(&mut self, value: T) {
        if self.len == self.capacity() {
            self.resize(self.capacity() * 2);
        }
        let idx = (self.head + self.len) & self.mask();
        self.slots[idx] = Some(value);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) & self.mask();
        self.len -= 1;

        let cap = self.capacity();
        if cap > MIN_CAPACITY && self.len <= cap / 4 {
            self.resize(cap / 2);
        }
        value
    }

    fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// Re-pack live elements at index 0 of a new backing array.
    fn resize(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity.is_power_of_two());
        debug_assert!(new_capacity >= self.len);
        let mask = self.mask();
        let mut slots = Vec::with_capacity(new_capacity);
        for i in 0..self.len {
            slots.push(self.slots[(self.head + i) & mask].take());
        }
        slots.resize_with(new_capacity, || None);
        self.slots = slots;
        self.head = 0;
    }
}

/// FIFO queue over a self-resizing ring, guarded by one RW lock.
pub struct RingQueue<T> {
    inner: RwLock<Ring<T>>,
}

impl<T> RingQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// `capacity` is rounded up to a power of two, at least [`MIN_CAPACITY`].
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            inner: RwLock::new(Ring::with_capacity(capacity)),
        }
    }

    pub fn push(&self, value: T) {
        self.inner.write().push(value);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.write().pop()
    }

    /// Pop the head only if `pred` accepts it. Check and pop happen under
    /// one exclusive lock.
    pub fn pop_if<F>(&self, pred: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut ring = self.inner.write();
        let accept = match ring.peek() {
            Some(head) => pred(head),
            None => false,
        };
        if accept {
            ring.pop()
        } else {
            None
        }
    }

    /// Pop every element in FIFO order under a single lock acquisition.
    pub fn drain(&self) -> Vec<T> {
        let mut ring = self.inner.write();
        let mut out = Vec::with_capacity(ring.len);
        while let Some(v) = ring.pop() {
            out.push(v);
        }
        out
    }

    /// Run `f` on the head without removing it.
    pub fn peek_with<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R,
    {
        self.inner.read().peek().map(f)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().len == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }

    pub fn clear(&self) {
        *self.inner.write() = Ring::with_capacity(MIN_CAPACITY);
    }
}

impl<T: Clone> RingQueue<T> {
    pub fn peek(&self) -> Option<T> {
        self.inner.read().peek().cloned()
    }
}

impl<T> Default for RingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
