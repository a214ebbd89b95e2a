//! `Waker`: eventfd used to interrupt a reactor's `epoll_wait`.
//!
//! Multiple `wake()` calls before the reactor drains the descriptor
//! coalesce into one readiness event (eventfd counter semantics). The
//! reactor additionally guards writes with an atomic flag so only the
//! asleep → awake transition writes at all.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{ReactorError, Result};

pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    /// Create a nonblocking, close-on-exec eventfd.
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::last_os("eventfd"));
        }
        // Safety: fd was just returned by eventfd and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Increment the counter, making the descriptor readable.
    pub fn wake(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wakeup is already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(ReactorError::Os {
                op: "eventfd write",
                source: err,
            });
        }
        Ok(())
    }

    /// Reset the counter. Returns the number of coalesced wakes.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
