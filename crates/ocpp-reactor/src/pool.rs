//! `ReactorPool`: N reactor threads behind a round-robin balancer.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::balancer::LoadBalancer;
use crate::error::{ReactorError, Result};
use crate::reactor::{EventHandler, Reactor};

pub struct ReactorPool {
    balancer: LoadBalancer<Reactor>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ReactorPool {
    /// Start `size` reactors (at least one), each on its own named thread.
    pub fn start(size: usize, handler: Arc<dyn EventHandler>) -> Result<Self> {
        let size = size.max(1);
        let mut balancer = LoadBalancer::new();
        let mut threads = Vec::with_capacity(size);
        for id in 0..size {
            let reactor = Arc::new(Reactor::new(id, Arc::clone(&handler))?);
            let r = Arc::clone(&reactor);
            let spawned = thread::Builder::new()
                .name(format!("ocpp-reactor-{}", id))
                .spawn(move || {
                    if let Err(e) = r.run() {
                        tracing::error!(reactor = r.id(), error = %e, "reactor loop failed");
                    }
                });
            match spawned {
                Ok(handle) => {
                    balancer.register(reactor);
                    threads.push(handle);
                }
                Err(e) => {
                    // Already-started reactors are stopped by Drop.
                    let _ = reactor.stop();
                    drop(Self {
                        balancer,
                        threads: Mutex::new(threads),
                    });
                    return Err(ReactorError::Spawn(e));
                }
            }
        }
        tracing::info!(reactors = size, "reactor pool started");
        Ok(Self {
            balancer,
            threads: Mutex::new(threads),
        })
    }

    /// Next reactor in round-robin order.
    pub fn next(&self) -> Result<Arc<Reactor>> {
        self.balancer.next().cloned().ok_or(ReactorError::Empty)
    }

    /// Register `fd` on the next reactor and return that reactor.
    pub fn assign(&self, fd: RawFd) -> Result<Arc<Reactor>> {
        let reactor = self.next()?;
        reactor.register(fd)?;
        Ok(reactor)
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Reactor>> {
        self.balancer.get(id)
    }

    pub fn len(&self) -> usize {
        self.balancer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancer.is_empty()
    }

    /// Sockets polled across all reactors.
    pub fn registered(&self) -> usize {
        self.balancer.members().iter().map(|r| r.registered()).sum()
    }

    /// Stop every reactor and join its thread. Idempotent.
    pub fn shutdown(&self) {
        for reactor in self.balancer.members() {
            if let Err(e) = reactor.stop() {
                tracing::warn!(reactor = reactor.id(), error = %e, "stop failed");
            }
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
