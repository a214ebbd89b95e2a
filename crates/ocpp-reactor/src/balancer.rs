//! Round-robin load balancer.
//!
//! Reactors are appended once at startup; after that the list is
//! read-only and `next()` is a single atomic increment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct LoadBalancer<R> {
    members: Vec<Arc<R>>,
    cursor: AtomicUsize,
}

impl<R> LoadBalancer<R> {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Append a member. Startup only.
    pub fn register(&mut self, member: Arc<R>) {
        self.members.push(member);
    }

    /// Next member in round-robin order; `None` when empty.
    pub fn next(&self) -> Option<&Arc<R>> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len();
        self.members.get(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<R>> {
        self.members.get(idx)
    }

    pub fn members(&self) -> &[Arc<R>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<R> Default for LoadBalancer<R> {
    fn default() -> Self {
        Self::new()
    }
}
