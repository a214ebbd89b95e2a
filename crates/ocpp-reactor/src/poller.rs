//! `Poller`: thin wrapper over a Linux epoll instance.
//!
//! Registrations are level-triggered for read readiness plus peer hangup.
//! Each registration carries a `u64` token; the reactor uses the socket
//! fd itself as the token and reserves [`WAKE_TOKEN`] for its waker.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{ReactorError, Result};

/// Token reserved for the reactor's wake descriptor.
pub const WAKE_TOKEN: u64 = u64::MAX;

const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const HANGUP_EVENTS: u32 = (libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP) as u32;

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    /// Peer hung up or the descriptor is in an error state.
    pub hangup: bool,
}

/// Reusable buffer for `epoll_wait` results.
pub struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf[..self.len].iter().map(|ev| {
            let bits = ev.events;
            Event {
                token: ev.u64,
                readable: bits & libc::EPOLLIN as u32 != 0,
                hangup: bits & HANGUP_EVENTS != 0,
            }
        })
    }
}

pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::last_os("epoll_create1"));
        }
        // Safety: fresh descriptor from epoll_create1.
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Watch `fd` for read readiness under `token`.
    pub fn add(&self, fd: RawFd, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, "epoll_ctl(ADD)")
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, "epoll_ctl(DEL)")
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, name: &'static str) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: READ_EVENTS,
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(ReactorError::last_os(name));
        }
        Ok(())
    }

    /// Block until at least one descriptor is ready. `None` waits forever.
    /// An interrupted wait returns with zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.buf.as_mut_ptr(),
                events.buf.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                events.len = 0;
                return Ok(0);
            }
            return Err(ReactorError::Os {
                op: "epoll_wait",
                source: err,
            });
        }
        events.len = n as usize;
        Ok(events.len)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}
