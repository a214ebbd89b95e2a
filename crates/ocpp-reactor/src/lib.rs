//! # ocpp-reactor
//!
//! Connection multiplexer for the OCPP server.
//!
//! - `poller` - epoll wrapper (level-triggered read readiness)
//! - `waker` - eventfd that interrupts a blocking wait
//! - `reactor` - per-thread event loop with an injected-task queue
//! - `balancer` - round-robin assignment of connections to reactors
//! - `pool` - one reactor thread per CPU behind the balancer
//! - `error` - Error types

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod poller;
        pub mod waker;
        pub mod reactor;
        pub mod pool;
    } else {
        compile_error!("ocpp-reactor requires Linux (epoll + eventfd)");
    }
}

pub mod balancer;
pub mod error;

// Re-exports
pub use balancer::LoadBalancer;
pub use error::{ReactorError, Result};
pub use pool::ReactorPool;
pub use reactor::{Control, EventHandler, Reactor, Registrar, Release, Task};

/// Reactor count when none is configured: one per available CPU.
pub fn default_reactor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
