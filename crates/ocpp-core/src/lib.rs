//! # ocpp-core
//!
//! Protocol-level building blocks for an OCPP 1.6-J central system.
//!
//! This crate does no I/O. The reactor and server crates build on it.
//!
//! ## Modules
//!
//! - `envelope` - Call / CallResult / CallError frames and their JSON codec
//! - `error` - OCPP error codes and decode errors
//! - `validate` - Semantic payload constraints (string lengths, ranges)
//! - `registry` - Action name → typed request/response decoders
//! - `actions` - BootNotification, Heartbeat, StatusNotification, Reset
//! - `ring` - Growable RW-locked ring queue
//! - `pool` - Reusable encode buffers
//! - `env` - Environment variable utilities

pub mod actions;
pub mod env;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod registry;
pub mod ring;
pub mod validate;

// Re-exports for convenience
pub use envelope::{check_unique_id, Call, CallError, CallResult, Envelope, MessageType};
pub use error::{DecodeError, ErrorCode};
pub use pool::{BufferPool, PooledBuffer};
pub use registry::{call_for, Action, ActionTrait, Payload, PayloadType, TraitRegistry};
pub use ring::RingQueue;
pub use validate::{Validate, Violation};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_timeout_ms};
