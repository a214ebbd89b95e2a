//! Wire-level connection: one authenticated charge-point session.
//!
//! After the upgrade handshake the socket is switched to nonblocking
//! mode. The read path runs on the owning reactor thread and pulls every
//! complete frame out of the socket until `WouldBlock`, so it never
//! parks the reactor. Writes come from worker threads; a write that
//! would block waits for `POLLOUT` up to the write deadline.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use ocpp_reactor::Reactor;
use parking_lot::Mutex;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};

use crate::error::{Result, ServerError};
use crate::registry::Session;

pub struct Connection {
    id: String,
    fd: RawFd,
    remote_addr: Option<SocketAddr>,
    ws: Mutex<WebSocket<TcpStream>>,
    last_read: Mutex<Instant>,
    read_timeout: Option<Duration>,
    write_timeout: Duration,
    closed: AtomicBool,
    reactor: OnceLock<Weak<Reactor>>,
}

impl Connection {
    /// Wrap an upgraded socket and switch it to nonblocking mode.
    pub fn new(
        id: impl Into<String>,
        ws: WebSocket<TcpStream>,
        read_timeout: Option<Duration>,
        write_timeout: Duration,
    ) -> io::Result<Self> {
        let stream = ws.get_ref();
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let remote_addr = stream.peer_addr().ok();
        Ok(Self {
            id: id.into(),
            fd,
            remote_addr,
            ws: Mutex::new(ws),
            last_read: Mutex::new(Instant::now()),
            read_timeout,
            write_timeout,
            closed: AtomicBool::new(false),
            reactor: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remember the reactor polling this socket. First call wins.
    pub fn bind_reactor(&self, reactor: &Arc<Reactor>) {
        let _ = self.reactor.set(Arc::downgrade(reactor));
    }

    pub fn reactor(&self) -> Option<Arc<Reactor>> {
        self.reactor.get().and_then(Weak::upgrade)
    }

    fn touch(&self) {
        *self.last_read.lock() = Instant::now();
    }

    /// Whether the idle read deadline passed at `now`.
    pub fn read_expired(&self, now: Instant) -> bool {
        match self.read_timeout {
            Some(timeout) => now.saturating_duration_since(*self.last_read.lock()) >= timeout,
            None => false,
        }
    }

    /// Drain every readable frame, handing text payloads to `on_text`.
    /// An error means the session is over.
    pub fn read_frames<F>(&self, mut on_text: F) -> io::Result<()>
    where
        F: FnMut(String),
    {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        let mut ws = self.ws.lock();
        loop {
            match ws.read() {
                Ok(Message::Text(text)) => {
                    self.touch();
                    on_text(text.to_string());
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => self.touch(),
                Ok(Message::Binary(_)) => {
                    self.touch();
                    tracing::debug!(connection_id = %self.id, "ignoring binary frame");
                }
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{}: {}", u16::from(f.code), f.reason))
                        .unwrap_or_default();
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        format!("peer closed ({})", reason),
                    ));
                }
                Ok(Message::Frame(_)) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ws_to_io(e)),
            }
        }
        // Pongs queued by `read` go out here.
        match ws.flush() {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(ws_to_io(e)),
        }
    }

    /// Send one text frame, waiting at most the write deadline.
    ///
    /// The frame is queued and flushed under the session lock, but the
    /// wait for `POLLOUT` happens with the lock released so the read path
    /// and `close` never stall behind a slow reader.
    pub fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(ServerError::Closed);
        }
        let deadline = Instant::now() + self.write_timeout;
        {
            let mut ws = self.ws.lock();
            match ws.send(Message::text(text)) {
                Ok(()) => return Ok(()),
                // Frame stays buffered inside the session.
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ServerError::WriteTimeout);
            }
            poll_fd(self.fd, libc::POLLOUT, deadline - now)?;
            if self.is_closed() {
                return Err(ServerError::Closed);
            }
            let mut ws = self.ws.lock();
            match ws.flush() {
                Ok(()) => return Ok(()),
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a close frame and shut the socket down. Returns `false` if
    /// the connection was already closed.
    pub fn close(&self, code: CloseCode, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut ws = self.ws.lock();
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = ws.close(Some(frame));
        let _ = ws.flush();
        let _ = ws.get_ref().shutdown(Shutdown::Both);
        true
    }
}

impl Session for Connection {
    fn id(&self) -> &str {
        &self.id
    }

    fn fd(&self) -> RawFd {
        self.fd
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn ws_to_io(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

/// Wait until `fd` reports `events` or `timeout` passes. `Ok(false)` on
/// timeout or signal interruption.
pub(crate) fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let n = unsafe { libc::poll(&mut pfd, 1, ms) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (Connection, WebSocket<TcpStream>) {
        pair_with_write_timeout(Duration::from_secs(1))
    }

    fn pair_with_write_timeout(write_timeout: Duration) -> (Connection, WebSocket<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            let url = format!("ws://{}/ocpp/CP/1", addr);
            tungstenite::client(url, stream).unwrap().0
        });
        let (stream, _) = listener.accept().unwrap();
        let ws = tungstenite::accept(stream).unwrap();
        let conn = Connection::new("CP-1", ws, Some(Duration::from_millis(100)), write_timeout)
            .unwrap();
        (conn, client.join().unwrap())
    }

    fn read_all(conn: &Connection) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        poll_fd(conn.fd(), libc::POLLIN, Duration::from_secs(2))?;
        // Give the second frame time to land.
        std::thread::sleep(Duration::from_millis(20));
        conn.read_frames(|t| out.push(t))?;
        Ok(out)
    }

    #[test]
    fn test_read_frames_until_would_block() {
        let (conn, mut client) = pair();
        client.send(Message::text("[2,\"a\",\"Heartbeat\",{}]")).unwrap();
        client.send(Message::text("second")).unwrap();
        let frames = read_all(&conn).unwrap();
        assert_eq!(frames, vec!["[2,\"a\",\"Heartbeat\",{}]", "second"]);
        // Nothing more buffered: returns immediately with no frames.
        let mut more = 0;
        conn.read_frames(|_| more += 1).unwrap();
        assert_eq!(more, 0);
    }

    #[test]
    fn test_send_and_close() {
        let (conn, mut client) = pair();
        conn.send_text("[3,\"a\",{}]".to_string()).unwrap();
        match client.read().unwrap() {
            Message::Text(t) => assert_eq!(t.as_str(), "[3,\"a\",{}]"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(conn.close(CloseCode::Protocol, "bye"));
        assert!(!conn.close(CloseCode::Protocol, "again"));
        match client.read().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Protocol);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(conn.send_text("x".into()), Err(ServerError::Closed)));
        assert!(conn.read_frames(|_| {}).is_err());
    }

    #[test]
    fn test_peer_close_ends_read_path() {
        let (conn, mut client) = pair();
        client.close(None).unwrap();
        let _ = client.flush();
        assert!(read_all(&conn).is_err());
    }

    #[test]
    fn test_blocked_writer_does_not_stall_reads() {
        let (conn, _client) = pair_with_write_timeout(Duration::from_secs(3));
        let conn = Arc::new(conn);
        // The client never reads, so the socket buffers fill up and the
        // writer ends up waiting on POLLOUT.
        let writer = {
            let conn = Arc::clone(&conn);
            std::thread::spawn(move || {
                let frame = "x".repeat(1 << 20);
                for _ in 0..64 {
                    if conn.send_text(frame.clone()).is_err() {
                        break;
                    }
                }
            })
        };
        std::thread::sleep(Duration::from_millis(300));

        let reader = {
            let conn = Arc::clone(&conn);
            std::thread::spawn(move || {
                let started = Instant::now();
                let _ = conn.read_frames(|_| {});
                started.elapsed()
            })
        };
        let stalled = reader.join().unwrap();
        assert!(stalled < Duration::from_millis(500), "read path waited {:?}", stalled);

        let started = Instant::now();
        assert!(conn.close(CloseCode::Away, "bye"));
        assert!(started.elapsed() < Duration::from_millis(500));
        writer.join().unwrap();
    }

    #[test]
    fn test_read_deadline() {
        let (conn, _client) = pair();
        assert!(!conn.read_expired(Instant::now()));
        assert!(conn.read_expired(Instant::now() + Duration::from_millis(150)));
    }
}
