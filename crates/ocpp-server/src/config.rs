//! Server configuration
//!
//! Every field has a default and an `OCPP_*` environment override:
//!
//! | Variable | Default |
//! |---|---|
//! | `OCPP_LISTEN_ADDR` | `0.0.0.0:8887` |
//! | `OCPP_REACTORS` | available parallelism |
//! | `OCPP_WORKERS` | 2 × parallelism (min 2) |
//! | `OCPP_ADMISSION_WORKERS` | parallelism (min 2) |
//! | `OCPP_CALL_TIMEOUT_MS` | `5000` (negative: never time out) |
//! | `OCPP_READ_TIMEOUT_MS` | `120000` (negative: no idle reaping) |
//! | `OCPP_WRITE_TIMEOUT_MS` | `10000` |
//! | `OCPP_HANDSHAKE_TIMEOUT_MS` | `10000` |
//! | `OCPP_HEARTBEAT_TIMEOUT_S` | `60` |

use std::net::SocketAddr;
use std::time::Duration;

use ocpp_core::env::{env_duration_secs, env_get, env_get_str, env_timeout_ms};
use ocpp_reactor::default_reactor_count;

use crate::error::{Result, ServerError};

/// WebSocket subprotocol the server speaks.
pub const SUBPROTOCOL: &str = "ocpp1.6";

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8887";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// Reactor threads (defaults to CPU count)
    pub reactors: usize,

    /// Worker threads for handlers and writes
    pub workers: usize,

    /// Threads running upgrade handshakes, kept apart from `workers` so
    /// slow or idle handshakes never delay message handling
    pub admission_workers: usize,

    /// Outbound call response timeout; `None` disables it
    pub call_timeout: Option<Duration>,

    /// Idle read deadline, refreshed on every read and ping; `None` disables it
    pub read_timeout: Option<Duration>,

    /// Per-write deadline
    pub write_timeout: Duration,

    /// Upgrade handshake deadline
    pub handshake_timeout: Duration,

    /// Retry hint sent to a charge point rejected as a duplicate
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let cpus = default_reactor_count();
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8887)),
            reactors: cpus,
            workers: (cpus * 2).max(2),
            admission_workers: cpus.max(2),
            call_timeout: Some(Duration::from_millis(5000)),
            read_timeout: Some(Duration::from_millis(120_000)),
            write_timeout: Duration::from_millis(10_000),
            handshake_timeout: Duration::from_millis(10_000),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `OCPP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let addr = env_get_str("OCPP_LISTEN_ADDR", DEFAULT_LISTEN_ADDR);
        let listen_addr = addr
            .parse()
            .map_err(|e| ServerError::Config(format!("OCPP_LISTEN_ADDR '{}': {}", addr, e)))?;
        let config = Self {
            listen_addr,
            reactors: env_get("OCPP_REACTORS", d.reactors),
            workers: env_get("OCPP_WORKERS", d.workers),
            admission_workers: env_get("OCPP_ADMISSION_WORKERS", d.admission_workers),
            call_timeout: env_timeout_ms("OCPP_CALL_TIMEOUT_MS", 5000),
            read_timeout: env_timeout_ms("OCPP_READ_TIMEOUT_MS", 120_000),
            write_timeout: env_timeout_ms("OCPP_WRITE_TIMEOUT_MS", 10_000)
                .unwrap_or(d.write_timeout),
            handshake_timeout: env_timeout_ms("OCPP_HANDSHAKE_TIMEOUT_MS", 10_000)
                .unwrap_or(d.handshake_timeout),
            heartbeat_timeout: env_duration_secs("OCPP_HEARTBEAT_TIMEOUT_S", 60),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn reactors(mut self, n: usize) -> Self {
        self.reactors = n;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn admission_workers(mut self, n: usize) -> Self {
        self.admission_workers = n;
        self
    }

    pub fn call_timeout(mut self, t: Option<Duration>) -> Self {
        self.call_timeout = t;
        self
    }

    pub fn read_timeout(mut self, t: Option<Duration>) -> Self {
        self.read_timeout = t;
        self
    }

    pub fn write_timeout(mut self, t: Duration) -> Self {
        self.write_timeout = t;
        self
    }

    pub fn handshake_timeout(mut self, t: Duration) -> Self {
        self.handshake_timeout = t;
        self
    }

    pub fn heartbeat_timeout(mut self, t: Duration) -> Self {
        self.heartbeat_timeout = t;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.reactors == 0 {
            return Err(ServerError::Config("reactors must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(ServerError::Config("workers must be at least 1".into()));
        }
        if self.admission_workers == 0 {
            return Err(ServerError::Config("admission workers must be at least 1".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(ServerError::Config("write timeout must be positive".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ServerError::Config("handshake timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.call_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.listen_addr.port(), 8887);
        assert!(config.workers >= 2);
    }

    #[test]
    fn test_builder_and_validate() {
        let config = ServerConfig::new().reactors(0);
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
        let config = ServerConfig::new().admission_workers(0);
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
        let config = ServerConfig::new()
            .workers(3)
            .call_timeout(None)
            .heartbeat_timeout(Duration::from_secs(30));
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 3);
        assert!(config.call_timeout.is_none());
    }

    // All env-dependent assertions live in one test so parallel tests
    // never observe each other's variables.
    #[test]
    fn test_from_env() {
        std::env::set_var("OCPP_LISTEN_ADDR", "127.0.0.1:9000");
        std::env::set_var("OCPP_REACTORS", "3");
        std::env::set_var("OCPP_CALL_TIMEOUT_MS", "-1");
        std::env::set_var("OCPP_HEARTBEAT_TIMEOUT_S", "15");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.reactors, 3);
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));

        std::env::set_var("OCPP_LISTEN_ADDR", "not-an-address");
        assert!(matches!(ServerConfig::from_env(), Err(ServerError::Config(_))));

        for key in [
            "OCPP_LISTEN_ADDR",
            "OCPP_REACTORS",
            "OCPP_CALL_TIMEOUT_MS",
            "OCPP_HEARTBEAT_TIMEOUT_S",
        ] {
            std::env::remove_var(key);
        }
    }
}
