//! # ocpp-server
//!
//! OCPP 1.6-J central system over WebSocket.
//!
//! ## Modules
//!
//! - `config`: listen address, thread counts, timeouts (`OCPP_*` env)
//! - `handshake`: upgrade, `ocpp1.6` subprotocol, charge point identity
//! - `connection`: one WebSocket session on a nonblocking socket
//! - `registry`: identity and fd indexes over live sessions
//! - `dispatcher`: single-flight outbound calls with response timeouts
//! - `handler`: application plugin for requests and responses
//! - `worker`: fixed thread pool for handlers and writes
//! - `server`: accept loop, admission, frame routing, shutdown
//!
//! ## Quick start
//!
//! ```ignore
//! let mut table = HandlerTable::new();
//! table.on_request::<Heartbeat, _>(|_, _, _| Ok(HeartbeatResponse { current_time: Utc::now() }));
//! let server = Server::bind(ServerConfig::from_env()?, Arc::new(TraitRegistry::ocpp16()), Arc::new(table))?;
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod worker;

pub use config::{ServerConfig, SUBPROTOCOL};
pub use connection::Connection;
pub use dispatcher::{DispatchPeer, Dispatcher, PendingRequest};
pub use error::{DispatchError, HandlerError, Result, ServerError};
pub use handler::{Context, HandlerPlugin, HandlerTable, RequestHandler, ResponseHandler};
pub use registry::{ConnectionRegistry, Session};
pub use server::Server;
pub use worker::WorkerPool;
