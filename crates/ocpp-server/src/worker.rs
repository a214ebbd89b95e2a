//! Worker pool
//!
//! Fixed set of OS threads pulling boxed jobs off an unbounded
//! crossbeam channel. Reactors and the dispatcher hand every piece of
//! potentially slow work (decode, handler call, socket write) to this
//! pool so their own loops never block on it.
//!
//! A panicking job is caught and logged; the worker keeps running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Result, ServerError};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    panics: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    pub fn start(size: usize) -> Result<Self> {
        Self::start_named("ocpp-worker", size)
    }

    /// Like [`WorkerPool::start`], with threads named `"<name>-<i>"`.
    pub fn start_named(name: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let panics = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let rx = rx.clone();
            let panics = Arc::clone(&panics);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || worker_loop(id, rx, panics))?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            panics,
            size,
        })
    }

    /// Queue `job`. Never blocks.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock();
        let tx = guard.as_ref().ok_or(ServerError::ShuttingDown)?;
        tx.send(Box::new(job)).map_err(|_| ServerError::ShuttingDown)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs that panicked so far.
    pub fn panics(&self) -> usize {
        self.panics.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, let queued ones finish, join the threads.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            // A job that triggers shutdown cannot join its own thread.
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, rx: Receiver<Job>, panics: Arc<AtomicUsize>) {
    tracing::trace!(worker = id, "worker started");
    for job in rx.iter() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            panics.fetch_add(1, Ordering::Relaxed);
            tracing::error!(worker = id, panic = %panic_message(&*payload), "job panicked");
        }
    }
    tracing::trace!(worker = id, "worker stopped");
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::start(3).unwrap();
        let (tx, rx) = unbounded();
        for i in 0..50 {
            let tx = tx.clone();
            pool.spawn(move || {
                let _ = tx.send(i);
            })
            .unwrap();
        }
        let mut got: Vec<i32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let pool = WorkerPool::start(1).unwrap();
        pool.spawn(|| panic!("boom")).unwrap();
        let (tx, rx) = unbounded();
        pool.spawn(move || {
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pool.panics(), 1);
    }

    #[test]
    fn test_named_threads() {
        let pool = WorkerPool::start_named("ocpp-admit", 1).unwrap();
        let (tx, rx) = unbounded();
        pool.spawn(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        })
        .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("ocpp-admit-0"));
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let pool = WorkerPool::start(2).unwrap();
        pool.shutdown();
        assert!(matches!(pool.spawn(|| {}), Err(ServerError::ShuttingDown)));
    }
}
