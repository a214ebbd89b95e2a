//! WebSocket upgrade, subprotocol negotiation and session identity.
//!
//! A charge point connects to `ws://host/<prefix>/<name>/<id>`; its
//! identity is the last two path segments joined as `"<name>-<id>"`.
//! The upgrade always completes so a rejection can be reported with a
//! protocol-error close frame carrying a readable reason.

use std::net::TcpStream;
use std::time::{Duration, Instant};

use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::WebSocket;

use crate::config::SUBPROTOCOL;
use crate::error::{Result, ServerError};

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// How long a rejected peer gets to answer our close frame.
pub const REJECT_LINGER: Duration = Duration::from_millis(500);

/// What the upgrade request carried.
#[derive(Debug, Clone, Default)]
pub struct Upgrade {
    pub path: String,
    /// Client offered the subprotocol and it was echoed back.
    pub subprotocol: bool,
}

/// Run the server side of the upgrade on a blocking socket bounded by
/// `timeout`.
pub fn accept(stream: TcpStream, timeout: Duration) -> Result<(WebSocket<TcpStream>, Upgrade)> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut upgrade = Upgrade::default();
    let callback = |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
        upgrade.path = req.uri().path().to_string();
        let offered = req
            .headers()
            .get_all(PROTOCOL_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|p| p.trim() == SUBPROTOCOL);
        if offered {
            resp.headers_mut()
                .insert(PROTOCOL_HEADER, HeaderValue::from_static(SUBPROTOCOL));
            upgrade.subprotocol = true;
        }
        Ok(resp)
    };
    let ws = tungstenite::accept_hdr(stream, callback)
        .map_err(|e| ServerError::Handshake(e.to_string()))?;
    Ok((ws, upgrade))
}

/// `"/ocpp/CP/001"` → `"CP-001"`. `None` with fewer than two segments.
pub fn parse_identity(path: &str) -> Option<String> {
    let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
    let id = segments.next()?;
    let name = segments.next()?;
    Some(format!("{}-{}", name, id))
}

/// Close an upgraded socket with a protocol-error frame and wait briefly
/// for the peer's close reply so the frame is not lost to a reset.
pub fn reject(mut ws: WebSocket<TcpStream>, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::Protocol,
        reason: reason.to_string().into(),
    };
    if ws.close(Some(frame)).is_err() {
        return;
    }
    let _ = ws.flush();
    if ws.get_ref().set_read_timeout(Some(REJECT_LINGER)).is_err() {
        return;
    }
    let deadline = Instant::now() + REJECT_LINGER;
    while Instant::now() < deadline && ws.read().is_ok() {}
}

pub fn duplicate_reason(identity: &str, heartbeat: Duration) -> String {
    format!(
        "charge point {} is already connected; retry after {}s",
        identity,
        heartbeat.as_secs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tungstenite::client::IntoClientRequest;

    #[test]
    fn test_parse_identity() {
        assert_eq!(parse_identity("/ocpp/CP/001").as_deref(), Some("CP-001"));
        assert_eq!(parse_identity("/CP/001/").as_deref(), Some("CP-001"));
        assert_eq!(parse_identity("/a/b/c/d").as_deref(), Some("c-d"));
        assert_eq!(parse_identity("/only"), None);
        assert_eq!(parse_identity("/"), None);
    }

    fn handshake(protocol: Option<&'static str>) -> (Upgrade, Option<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut req = format!("ws://{}/ocpp/CP/7", addr).into_client_request().unwrap();
            if let Some(p) = protocol {
                req.headers_mut()
                    .insert(PROTOCOL_HEADER, HeaderValue::from_static(p));
            }
            let stream = TcpStream::connect(addr).unwrap();
            let (_ws, resp) = tungstenite::client(req, stream).unwrap();
            resp.headers()
                .get(PROTOCOL_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
        let (stream, _) = listener.accept().unwrap();
        let (_ws, upgrade) = accept(stream, Duration::from_secs(2)).unwrap();
        (upgrade, client.join().unwrap())
    }

    #[test]
    fn test_subprotocol_echoed() {
        let (upgrade, echoed) = handshake(Some("ocpp1.6"));
        assert!(upgrade.subprotocol);
        assert_eq!(upgrade.path, "/ocpp/CP/7");
        assert_eq!(echoed.as_deref(), Some("ocpp1.6"));
    }

    #[test]
    fn test_missing_subprotocol_flagged() {
        let (upgrade, echoed) = handshake(None);
        assert!(!upgrade.subprotocol);
        assert!(echoed.is_none());
    }

    #[test]
    fn test_reject_waits_briefly_for_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let client = std::thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            let (_ws, _) = tungstenite::client(format!("ws://{}/ocpp/CP/8", addr), stream).unwrap();
            // Hold the socket open without ever reading the close frame.
            let _ = done_rx.recv_timeout(Duration::from_secs(5));
        });
        let (stream, _) = listener.accept().unwrap();
        let (ws, _) = accept(stream, Duration::from_secs(10)).unwrap();

        let started = std::time::Instant::now();
        reject(ws, "go away");
        assert!(started.elapsed() < REJECT_LINGER + Duration::from_millis(500));
        let _ = done_tx.send(());
        client.join().unwrap();
    }

    #[test]
    fn test_duplicate_reason_mentions_retry() {
        let reason = duplicate_reason("X-Y", Duration::from_secs(60));
        assert!(reason.contains("X-Y"));
        assert!(reason.contains("60s"));
    }
}
