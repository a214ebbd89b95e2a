//! Connection registry: identity → connection and fd → connection.
//!
//! Both maps sit under one RW lock so they never disagree. Admission is
//! `insert_if_absent`, which checks and inserts under the same exclusive
//! lock; a duplicate identity can never slip in between the check and
//! the insert.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::RwLock;

/// What the registry needs to know about a connection.
pub trait Session: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn fd(&self) -> RawFd;
}

struct Maps<C> {
    by_id: HashMap<String, Arc<C>>,
    by_fd: HashMap<RawFd, Arc<C>>,
}

pub struct ConnectionRegistry<C> {
    inner: RwLock<Maps<C>>,
}

impl<C: Session> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Maps {
                by_id: HashMap::new(),
                by_fd: HashMap::new(),
            }),
        }
    }

    /// Admit `conn` unless its identity is already live.
    pub fn insert_if_absent(&self, conn: Arc<C>) -> bool {
        let mut maps = self.inner.write();
        if maps.by_id.contains_key(conn.id()) {
            return false;
        }
        maps.by_fd.insert(conn.fd(), Arc::clone(&conn));
        maps.by_id.insert(conn.id().to_string(), conn);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<C>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn by_fd(&self, fd: RawFd) -> Option<Arc<C>> {
        self.inner.read().by_fd.get(&fd).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// Remove `conn`, but only if it is the entry currently registered
    /// under its identity. A stale handle never evicts a newer session.
    pub fn remove(&self, conn: &Arc<C>) -> bool {
        let mut maps = self.inner.write();
        match maps.by_id.get(conn.id()) {
            Some(current) if Arc::ptr_eq(current, conn) => {}
            _ => return false,
        }
        maps.by_id.remove(conn.id());
        if maps
            .by_fd
            .get(&conn.fd())
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            maps.by_fd.remove(&conn.fd());
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    /// Point-in-time copy of every live connection.
    pub fn snapshot(&self) -> Vec<Arc<C>> {
        self.inner.read().by_id.values().cloned().collect()
    }
}

impl<C: Session> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
