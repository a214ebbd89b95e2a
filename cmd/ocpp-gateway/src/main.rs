//! OCPP Gateway
//!
//! Central system for OCPP 1.6-J charge points. Accepts
//! BootNotification, Heartbeat and StatusNotification, and logs replies
//! to server-initiated Reset calls.
//!
//! Usage:
//!     OCPP_LISTEN_ADDR=0.0.0.0:8887 OCPP_LOG=debug ./target/release/ocpp-gateway
//!
//! Charge points connect to `ws://host:8887/ocpp/<name>/<id>` offering the
//! `ocpp1.6` subprotocol. SIGINT or SIGTERM shuts down cleanly.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use nix::sys::signal::{SigSet, Signal};
use ocpp_core::actions::{
    BootNotification, BootNotificationResponse, Heartbeat, HeartbeatResponse,
    RegistrationStatus, Reset, StatusNotification, StatusNotificationResponse,
};
use ocpp_core::TraitRegistry;
use ocpp_server::{HandlerTable, Server, ServerConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn handlers(heartbeat_interval: i32) -> HandlerTable {
    let mut table = HandlerTable::new();
    table
        .on_request::<BootNotification, _>(move |ctx, conn, req| {
            info!(
                connection_id = conn,
                remote = ?ctx.remote_addr,
                vendor = %req.charge_point_vendor,
                model = %req.charge_point_model,
                "boot notification"
            );
            Ok(BootNotificationResponse {
                current_time: Utc::now(),
                interval: heartbeat_interval,
                status: RegistrationStatus::Accepted,
            })
        })
        .on_request::<Heartbeat, _>(|_, conn, _| {
            tracing::debug!(connection_id = conn, "heartbeat");
            Ok(HeartbeatResponse {
                current_time: Utc::now(),
            })
        })
        .on_request::<StatusNotification, _>(|_, conn, req| {
            info!(
                connection_id = conn,
                connector = req.connector_id,
                status = ?req.status,
                error_code = ?req.error_code,
                "status notification"
            );
            Ok(StatusNotificationResponse {})
        })
        .on_response::<Reset, _>(|_, conn, uid, resp| {
            info!(connection_id = conn, unique_id = uid, status = ?resp.status, "reset answered");
            Ok(())
        })
        .on_error::<Reset, _>(|_, conn, err| {
            warn!(
                connection_id = conn,
                unique_id = %err.unique_id,
                code = %err.error_code,
                description = %err.error_description,
                "reset failed"
            );
            Ok(())
        });
    table
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("OCPP_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Block before any thread exists so every thread inherits the mask
    // and the signals are only ever taken by `wait` below.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    if let Err(e) = signals.thread_block() {
        error!("failed to block signals: {}", e);
        return ExitCode::FAILURE;
    }

    let interval = config.heartbeat_timeout.as_secs().min(i32::MAX as u64) as i32;
    let traits = Arc::new(TraitRegistry::ocpp16());
    let server = match Server::bind(config, traits, Arc::new(handlers(interval))) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %server.local_addr(), "ocpp gateway ready");

    match signals.wait() {
        Ok(signal) => info!(?signal, "signal received"),
        Err(e) => error!("signal wait failed: {}", e),
    }
    server.shutdown();
    ExitCode::SUCCESS
}
