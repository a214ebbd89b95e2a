//! # Reactor: one epoll loop per thread
//!
//! ```text
//!   any thread                        reactor thread
//!   ──────────                        ──────────────
//!   trigger(task) ──► tasks.push      epoll_wait(-1)
//!        │                                 │
//!        └─ awake.swap(true)==false ──► waker readable
//!           └─ waker.wake()                ├─ waker.drain(), awake=false
//!                                          ├─ run every queued task
//!                                          └─ socket readable → handler
//! ```
//!
//! Registration and deregistration of sockets run as tasks on the owning
//! thread, so the epoll set and the owned-fd set are only ever mutated by
//! one thread. The loop exits only when a task returns
//! [`Control::Shutdown`]; every fd the reactor still owns is then handed
//! back to the handler as [`Release::Shutdown`].

use std::collections::HashSet;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ocpp_core::RingQueue;

use crate::error::Result;
use crate::poller::{Events, Poller, WAKE_TOKEN};
use crate::waker::Waker;

/// What a task tells the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

/// Why a descriptor left its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Release {
    /// Read path failed or the peer hung up.
    ReadFailed,
    /// The reactor is shutting down.
    Shutdown,
}

/// Connection-side callbacks. Called on the reactor thread.
pub trait EventHandler: Send + Sync + 'static {
    /// `fd` is readable (or hung up). An error drops the descriptor: the
    /// reactor deregisters it and calls [`EventHandler::on_release`].
    fn on_readable(&self, reactor: usize, fd: RawFd) -> std::io::Result<()>;

    /// `fd` is no longer polled by this reactor.
    fn on_release(&self, reactor: usize, fd: RawFd, reason: Release);
}

/// Work injected into a reactor from another thread. `Sync` because the
/// task queue is a shared-read ring.
pub type Task = Box<dyn FnOnce(&mut Registrar<'_>) -> Control + Send + Sync>;

/// Reactor-thread view of the epoll set, handed to tasks.
pub struct Registrar<'a> {
    id: usize,
    poller: &'a Poller,
    owned: &'a mut HashSet<RawFd>,
    count: &'a AtomicUsize,
}

impl Registrar<'_> {
    pub fn reactor_id(&self) -> usize {
        self.id
    }

    /// Start polling `fd` for read readiness.
    pub fn register(&mut self, fd: RawFd) -> Result<()> {
        self.poller.add(fd, fd as u64)?;
        self.owned.insert(fd);
        self.count.store(self.owned.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Stop polling `fd`. Returns whether this reactor owned it.
    pub fn deregister(&mut self, fd: RawFd) -> bool {
        if !self.owned.remove(&fd) {
            return false;
        }
        if let Err(e) = self.poller.delete(fd) {
            tracing::debug!(reactor = self.id, fd, error = %e, "deregister");
        }
        self.count.store(self.owned.len(), Ordering::Relaxed);
        true
    }

    pub fn owns(&self, fd: RawFd) -> bool {
        self.owned.contains(&fd)
    }
}

pub struct Reactor {
    id: usize,
    poller: Poller,
    waker: Waker,
    /// Set while a wake write is outstanding.
    awake: AtomicBool,
    tasks: RingQueue<Task>,
    handler: Arc<dyn EventHandler>,
    /// Number of registered sockets, mirrored for observers.
    registered: AtomicUsize,
    running: AtomicBool,
}

impl Reactor {
    pub fn new(id: usize, handler: Arc<dyn EventHandler>) -> Result<Self> {
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        poller.add(waker.as_raw_fd(), WAKE_TOKEN)?;
        Ok(Self {
            id,
            poller,
            waker,
            awake: AtomicBool::new(false),
            tasks: RingQueue::new(),
            handler,
            registered: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Sockets currently polled by this reactor.
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue `task` for the reactor thread and wake it if it is asleep.
    pub fn trigger(&self, task: Task) -> Result<()> {
        self.tasks.push(task);
        if !self.awake.swap(true, Ordering::AcqRel) {
            self.waker.wake()?;
        }
        Ok(())
    }

    /// Register `fd` on the reactor thread.
    pub fn register(&self, fd: RawFd) -> Result<()> {
        self.trigger(Box::new(move |r: &mut Registrar<'_>| {
            if let Err(e) = r.register(fd) {
                tracing::warn!(reactor = r.reactor_id(), fd, error = %e, "register failed");
            }
            Control::Continue
        }))
    }

    /// Ask the loop to exit after the tasks queued so far.
    pub fn stop(&self) -> Result<()> {
        self.trigger(Box::new(|_: &mut Registrar<'_>| Control::Shutdown))
    }

    /// Run the event loop on the calling thread until a task returns
    /// [`Control::Shutdown`].
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        let mut owned: HashSet<RawFd> = HashSet::new();
        let mut events = Events::with_capacity(256);
        tracing::debug!(reactor = self.id, "reactor started");

        let result = self.run_loop(&mut owned, &mut events);

        // Forced close of everything still owned.
        for fd in owned.drain() {
            let _ = self.poller.delete(fd);
            self.handler.on_release(self.id, fd, Release::Shutdown);
        }
        self.registered.store(0, Ordering::Relaxed);
        // Tasks queued after shutdown never run; dropping them releases
        // whatever they captured.
        drop(self.tasks.drain());
        self.running.store(false, Ordering::Release);
        tracing::debug!(reactor = self.id, "reactor stopped");
        result
    }

    fn run_loop(&self, owned: &mut HashSet<RawFd>, events: &mut Events) -> Result<()> {
        loop {
            self.poller.wait(events, None)?;
            for ev in events.iter() {
                if ev.token == WAKE_TOKEN {
                    self.waker.drain();
                    self.awake.store(false, Ordering::Release);
                    if self.run_tasks(owned) == Control::Shutdown {
                        return Ok(());
                    }
                    continue;
                }

                let fd = ev.token as RawFd;
                // A task earlier in this batch may have deregistered it.
                if !owned.contains(&fd) {
                    continue;
                }
                let failed = match self.handler.on_readable(self.id, fd) {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::debug!(reactor = self.id, fd, error = %e, "read path failed");
                        true
                    }
                };
                if failed {
                    owned.remove(&fd);
                    let _ = self.poller.delete(fd);
                    self.registered.store(owned.len(), Ordering::Relaxed);
                    self.handler.on_release(self.id, fd, Release::ReadFailed);
                }
            }
        }
    }

    fn run_tasks(&self, owned: &mut HashSet<RawFd>) -> Control {
        let mut registrar = Registrar {
            id: self.id,
            poller: &self.poller,
            owned,
            count: &self.registered,
        };
        while let Some(task) = self.tasks.pop() {
            if task(&mut registrar) == Control::Shutdown {
                return Control::Shutdown;
            }
        }
        Control::Continue
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Sender};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    /// Reads from registered sockets; EOF counts as a read failure.
    struct Echo {
        streams: parking_lot::Mutex<std::collections::HashMap<RawFd, UnixStream>>,
        reads: Sender<(RawFd, Vec<u8>)>,
        released: Sender<(RawFd, Release)>,
    }

    impl EventHandler for Echo {
        fn on_readable(&self, _reactor: usize, fd: RawFd) -> std::io::Result<()> {
            let mut streams = self.streams.lock();
            let stream = streams
                .get_mut(&fd)
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            let _ = self.reads.send((fd, buf[..n].to_vec()));
            Ok(())
        }

        fn on_release(&self, _reactor: usize, fd: RawFd, reason: Release) {
            self.streams.lock().remove(&fd);
            let _ = self.released.send((fd, reason));
        }
    }

    fn spawn_reactor(
        handler: Arc<Echo>,
    ) -> (Arc<Reactor>, std::thread::JoinHandle<Result<()>>) {
        let reactor = Arc::new(Reactor::new(0, handler).unwrap());
        let r = Arc::clone(&reactor);
        let join = std::thread::spawn(move || r.run());
        (reactor, join)
    }

    #[test]
    fn test_register_read_and_release_on_eof() {
        let (reads_tx, reads_rx) = unbounded();
        let (rel_tx, rel_rx) = unbounded();
        let handler = Arc::new(Echo {
            streams: Default::default(),
            reads: reads_tx,
            released: rel_tx,
        });
        let (reactor, join) = spawn_reactor(Arc::clone(&handler));

        let (mut client, server) = UnixStream::pair().unwrap();
        let fd = server.as_raw_fd();
        handler.streams.lock().insert(fd, server);
        reactor.register(fd).unwrap();

        client.write_all(b"ping").unwrap();
        let (got_fd, bytes) = reads_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got_fd, fd);
        assert_eq!(bytes, b"ping");
        assert_eq!(reactor.registered(), 1);

        drop(client);
        let (rel_fd, reason) = rel_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((rel_fd, reason), (fd, Release::ReadFailed));

        reactor.stop().unwrap();
        join.join().unwrap().unwrap();
        assert_eq!(reactor.registered(), 0);
    }

    #[test]
    fn test_shutdown_force_closes_owned() {
        let (reads_tx, _reads_rx) = unbounded();
        let (rel_tx, rel_rx) = unbounded();
        let handler = Arc::new(Echo {
            streams: Default::default(),
            reads: reads_tx,
            released: rel_tx,
        });
        let (reactor, join) = spawn_reactor(Arc::clone(&handler));

        let mut clients = Vec::new();
        let mut fds = Vec::new();
        for _ in 0..3 {
            let (client, server) = UnixStream::pair().unwrap();
            let fd = server.as_raw_fd();
            handler.streams.lock().insert(fd, server);
            reactor.register(fd).unwrap();
            clients.push(client);
            fds.push(fd);
        }
        reactor.stop().unwrap();
        join.join().unwrap().unwrap();

        let mut released: Vec<_> = rel_rx.try_iter().collect();
        released.sort();
        fds.sort();
        assert_eq!(
            released,
            fds.iter().map(|&fd| (fd, Release::Shutdown)).collect::<Vec<_>>()
        );
        assert!(handler.streams.lock().is_empty());
        assert!(!reactor.is_running());
    }

    #[test]
    fn test_tasks_run_in_order_on_reactor_thread() {
        let (reads_tx, _r) = unbounded();
        let (rel_tx, _rel) = unbounded();
        let handler = Arc::new(Echo {
            streams: Default::default(),
            reads: reads_tx,
            released: rel_tx,
        });
        let (reactor, join) = spawn_reactor(handler);
        let reactor_thread = join.thread().id();

        let (tx, rx) = unbounded();
        for i in 0..100 {
            let tx = tx.clone();
            reactor
                .trigger(Box::new(move |_r: &mut Registrar<'_>| {
                    let _ = tx.send((i, std::thread::current().id()));
                    Control::Continue
                }))
                .unwrap();
        }
        for i in 0..100 {
            let (got, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got, i);
            assert_eq!(thread, reactor_thread);
        }
        reactor.stop().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_deregister_task() {
        let (reads_tx, reads_rx) = unbounded();
        let (rel_tx, rel_rx) = unbounded();
        let handler = Arc::new(Echo {
            streams: Default::default(),
            reads: reads_tx,
            released: rel_tx,
        });
        let (reactor, join) = spawn_reactor(Arc::clone(&handler));

        let (mut client, server) = UnixStream::pair().unwrap();
        let fd = server.as_raw_fd();
        handler.streams.lock().insert(fd, server);
        reactor.register(fd).unwrap();

        let (done_tx, done_rx) = unbounded();
        reactor
            .trigger(Box::new(move |r: &mut Registrar<'_>| {
                let _ = done_tx.send(r.deregister(fd));
                Control::Continue
            }))
            .unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap());

        client.write_all(b"late").unwrap();
        assert!(reads_rx.recv_timeout(Duration::from_millis(50)).is_err());

        reactor.stop().unwrap();
        join.join().unwrap().unwrap();
        // Deregistered fds are not force-closed again.
        assert!(rel_rx.try_recv().is_err());
    }

    #[test]
    fn test_triggers_coalesce_into_one_wake() {
        let (reads_tx, _reads_rx) = unbounded();
        let (rel_tx, _rel_rx) = unbounded();
        let handler = Arc::new(Echo {
            streams: Default::default(),
            reads: reads_tx,
            released: rel_tx,
        });
        // Not running: nothing drains the eventfd between triggers.
        let reactor = Reactor::new(0, handler).unwrap();
        for _ in 0..16 {
            reactor
                .trigger(Box::new(|_: &mut Registrar<'_>| Control::Continue))
                .unwrap();
        }
        assert_eq!(reactor.waker.drain(), 1);
        assert_eq!(reactor.tasks.len(), 16);

        // Once the loop has cleared the flag, the next trigger writes again.
        reactor.awake.store(false, Ordering::Release);
        reactor
            .trigger(Box::new(|_: &mut Registrar<'_>| Control::Continue))
            .unwrap();
        assert_eq!(reactor.waker.drain(), 1);
    }
}
