//! Reactor error types.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// A syscall on the poll or wake descriptor failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// The balancer has no reactors registered.
    #[error("no reactors registered")]
    Empty,
    /// Reactor thread could not be spawned.
    #[error("spawn reactor thread: {0}")]
    Spawn(#[source] io::Error),
}

impl ReactorError {
    /// Capture `errno` for a failed libc call.
    pub(crate) fn last_os(op: &'static str) -> Self {
        ReactorError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReactorError>;
