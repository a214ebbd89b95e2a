//! # Server: accept, admit, route
//!
//! ```text
//!  accept thread ──► admission: handshake ─► registry.insert_if_absent
//!                                      ─► dispatcher.add_connection
//!                                      ─► balancer.next().trigger(register fd)
//!
//!  reactor thread ─► conn.read_frames ─► worker: decode ─┬─ Call       → request handler → reply
//!                                                        ├─ CallResult → dispatcher.complete → response handler
//!                                                        └─ CallError  → dispatcher.complete → response handler
//!
//!  dispatcher ─► send_call ─► worker: write
//!             ─► deliver_error (timeout) ─► worker: response handler
//! ```
//!
//! Ownership runs one way: `Server` owns the reactor pool; reactors and
//! the dispatcher thread hold `Arc<ServerInner>`; `ServerInner` never
//! holds a reactor (connections keep a `Weak` to theirs).

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use ocpp_core::{BufferPool, Call, CallError, CallResult, Envelope, ErrorCode, TraitRegistry};
use ocpp_reactor::{Control, EventHandler, ReactorPool, Registrar, Release};
use parking_lot::Mutex;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::config::{ServerConfig, SUBPROTOCOL};
use crate::connection::{poll_fd, Connection};
use crate::dispatcher::{DispatchPeer, Dispatcher};
use crate::error::{DispatchError, HandlerError, Result, ServerError};
use crate::handler::{Context, HandlerPlugin};
use crate::handshake;
use crate::registry::ConnectionRegistry;
use crate::worker::WorkerPool;

/// How often the accept loop rechecks the stop flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct Server {
    inner: Arc<ServerInner>,
    reactors: Arc<ReactorPool>,
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    reaper: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl Server {
    /// Bind the listener and start every background thread.
    pub fn bind(
        config: ServerConfig,
        traits: Arc<TraitRegistry>,
        plugin: Arc<dyn HandlerPlugin>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let workers = WorkerPool::start(config.workers)?;
        let admission = WorkerPool::start_named("ocpp-admit", config.admission_workers)?;
        let dispatcher = Dispatcher::new(Arc::clone(&traits), config.call_timeout);
        let inner = Arc::new_cyclic(|me| ServerInner {
            me: me.clone(),
            config: config.clone(),
            traits,
            plugin,
            registry: ConnectionRegistry::new(),
            dispatcher,
            workers,
            admission,
            buffers: BufferPool::default(),
        });

        inner
            .dispatcher
            .start(Arc::clone(&inner) as Arc<dyn DispatchPeer>)?;
        let reactors = match ReactorPool::start(
            config.reactors,
            Arc::clone(&inner) as Arc<dyn EventHandler>,
        ) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                inner.dispatcher.stop();
                inner.admission.shutdown();
                inner.workers.shutdown();
                return Err(e.into());
            }
        };

        let stopping = Arc::new(AtomicBool::new(false));
        let server = Self {
            inner: Arc::clone(&inner),
            reactors: Arc::clone(&reactors),
            local_addr,
            stopping: Arc::clone(&stopping),
            accept_thread: Mutex::new(None),
            reaper: Mutex::new(None),
        };

        let accept = {
            let inner = Arc::clone(&inner);
            let reactors = Arc::clone(&reactors);
            thread::Builder::new()
                .name("ocpp-accept".into())
                .spawn(move || accept_loop(listener, inner, reactors, stopping))?
        };
        *server.accept_thread.lock() = Some(accept);

        if let Some(read_timeout) = config.read_timeout {
            let interval = (read_timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(1));
            let (stop_tx, stop_rx) = bounded::<()>(0);
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name("ocpp-reaper".into())
                .spawn(move || reaper_loop(inner, stop_rx, interval))?;
            *server.reaper.lock() = Some((stop_tx, handle));
        }

        tracing::info!(
            addr = %local_addr,
            reactors = reactors.len(),
            workers = config.workers,
            admission_workers = config.admission_workers,
            call_timeout = ?config.call_timeout,
            "ocpp server listening"
        );
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a server-initiated call on `connection_id`. Validation
    /// failures are returned synchronously; nothing is queued on error.
    pub fn handle_active_call(
        &self,
        ctx: &Context,
        connection_id: &str,
        call: Call,
    ) -> std::result::Result<(), DispatchError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(DispatchError::Stopped);
        }
        tracing::debug!(
            connection_id,
            unique_id = %call.unique_id,
            action = %call.action,
            requested_at = %ctx.received_at,
            "active call"
        );
        self.inner.dispatcher.append_request(connection_id, call)
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.inner.registry.contains(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn traits(&self) -> &TraitRegistry {
        &self.inner.traits
    }

    /// Stop accepting, cancel outstanding timeouts, close every
    /// connection and join all threads. Idempotent.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("ocpp server shutting down");
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        // Handshakes still in flight finish (or time out) before the
        // final sweep below.
        self.inner.admission.shutdown();
        if let Some((stop, handle)) = self.reaper.lock().take() {
            drop(stop);
            let _ = handle.join();
        }
        self.inner.dispatcher.stop();
        self.reactors.shutdown();
        // Admitted but never registered with a reactor.
        for conn in self.inner.registry.snapshot() {
            self.inner
                .teardown(&conn, CloseCode::Away, "server shutting down", false);
        }
        self.inner.workers.shutdown();
        tracing::info!("ocpp server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    inner: Arc<ServerInner>,
    reactors: Arc<ReactorPool>,
    stopping: Arc<AtomicBool>,
) {
    let fd = listener.as_raw_fd();
    while !stopping.load(Ordering::Acquire) {
        match poll_fd(fd, libc::POLLIN, ACCEPT_POLL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(error = %e, "listener poll failed");
                break;
            }
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let inner2 = Arc::clone(&inner);
                    let reactors = Arc::clone(&reactors);
                    let spawned = inner
                        .admission
                        .spawn(move || inner2.admit(stream, peer, &reactors));
                    if spawned.is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

fn reaper_loop(inner: Arc<ServerInner>, stop: Receiver<()>, interval: Duration) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => inner.reap_idle(Instant::now()),
        }
    }
}

pub(crate) struct ServerInner {
    me: Weak<ServerInner>,
    config: ServerConfig,
    traits: Arc<TraitRegistry>,
    plugin: Arc<dyn HandlerPlugin>,
    registry: ConnectionRegistry<Connection>,
    dispatcher: Arc<Dispatcher>,
    /// Frame handling, writes, timeout delivery.
    workers: WorkerPool,
    /// Upgrade handshakes only.
    admission: WorkerPool,
    buffers: BufferPool,
}

impl ServerInner {
    // ── Admission ────────────────────────────────────────────────────

    fn admit(&self, stream: TcpStream, peer: SocketAddr, reactors: &ReactorPool) {
        if let Err(e) = stream.set_nonblocking(false) {
            tracing::debug!(%peer, error = %e, "socket setup failed");
            return;
        }
        let (ws, upgrade) = match handshake::accept(stream, self.config.handshake_timeout) {
            Ok(done) => done,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "handshake failed");
                return;
            }
        };
        if !upgrade.subprotocol {
            tracing::warn!(%peer, path = %upgrade.path, "subprotocol missing");
            handshake::reject(
                ws,
                &format!("unsupported subprotocol; expected {}", SUBPROTOCOL),
            );
            return;
        }
        let Some(identity) = handshake::parse_identity(&upgrade.path) else {
            tracing::warn!(%peer, path = %upgrade.path, "no identity in path");
            handshake::reject(ws, "invalid path; expected /<name>/<id>");
            return;
        };
        let duplicate = handshake::duplicate_reason(&identity, self.config.heartbeat_timeout);
        if self.registry.contains(&identity) {
            tracing::warn!(%peer, connection_id = %identity, "duplicate identity rejected");
            handshake::reject(ws, &duplicate);
            return;
        }

        let conn = match Connection::new(
            identity,
            ws,
            self.config.read_timeout,
            self.config.write_timeout,
        ) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                tracing::warn!(%peer, error = %e, "connection setup failed");
                return;
            }
        };
        if !self.registry.insert_if_absent(Arc::clone(&conn)) {
            tracing::warn!(%peer, connection_id = %conn.id(), "duplicate identity rejected");
            conn.close(CloseCode::Protocol, &duplicate);
            return;
        }
        self.dispatcher.add_connection(conn.id());

        let reactor = match reactors.next() {
            Ok(reactor) => reactor,
            Err(e) => {
                tracing::error!(connection_id = %conn.id(), error = %e, "no reactor");
                self.teardown(&conn, CloseCode::Error, "server unavailable", false);
                return;
            }
        };
        conn.bind_reactor(&reactor);
        let task_conn = Arc::clone(&conn);
        let me = self.me.clone();
        let queued = reactor.trigger(Box::new(move |r: &mut Registrar<'_>| {
            if task_conn.is_closed() {
                return Control::Continue;
            }
            if let Err(e) = r.register(task_conn.fd()) {
                tracing::warn!(connection_id = %task_conn.id(), error = %e, "register failed");
                if let Some(inner) = me.upgrade() {
                    inner.teardown(&task_conn, CloseCode::Error, "server unavailable", false);
                }
            }
            Control::Continue
        }));
        if let Err(e) = queued {
            tracing::error!(connection_id = %conn.id(), error = %e, "reactor wake failed");
            self.teardown(&conn, CloseCode::Error, "server unavailable", false);
            return;
        }
        tracing::info!(
            connection_id = %conn.id(),
            %peer,
            reactor = reactor.id(),
            "charge point connected"
        );
    }

    /// Release every resource tied to `conn`. The registry entry goes
    /// first, so a reconnect with the same identity is admitted only
    /// once the old session is fully detached.
    fn teardown(&self, conn: &Arc<Connection>, code: CloseCode, reason: &str, deregister: bool) {
        let removed = self.registry.remove(conn);
        if removed {
            self.dispatcher.remove_connection(conn.id());
        }
        conn.close(code, reason);
        if deregister {
            if let Some(reactor) = conn.reactor() {
                // The task keeps the socket open until the fd is out of
                // the epoll set, so the number cannot be reused first.
                let held = Arc::clone(conn);
                let _ = reactor.trigger(Box::new(move |r: &mut Registrar<'_>| {
                    r.deregister(held.fd());
                    Control::Continue
                }));
            }
        }
        if removed {
            tracing::info!(connection_id = %conn.id(), reason, "charge point disconnected");
        }
    }

    fn reap_idle(&self, now: Instant) {
        for conn in self.registry.snapshot() {
            if conn.read_expired(now) {
                tracing::info!(connection_id = %conn.id(), "read deadline passed");
                self.teardown(&conn, CloseCode::Away, "read timeout", true);
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────

    fn encode_frame(&self, envelope: &Envelope) -> Result<String> {
        let buf = self.buffers.encode(envelope)?;
        let text = buf
            .as_str()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(text.to_owned())
    }

    fn send_envelope(&self, conn: &Arc<Connection>, envelope: &Envelope) {
        let result = self.encode_frame(envelope).and_then(|text| {
            tracing::trace!(connection_id = %conn.id(), frame = %text, "send");
            conn.send_text(text)
        });
        match result {
            Ok(()) | Err(ServerError::Closed) => {}
            Err(e @ ServerError::Encode(_)) => {
                tracing::error!(connection_id = %conn.id(), error = %e, "encode failed");
            }
            Err(e) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "write failed");
                self.teardown(conn, CloseCode::Error, "write failed", true);
            }
        }
    }

    fn reply_error(&self, conn: &Arc<Connection>, error: CallError) {
        tracing::debug!(
            connection_id = %conn.id(),
            unique_id = %error.unique_id,
            code = %error.error_code,
            description = %error.error_description,
            "replying with CallError"
        );
        self.send_envelope(conn, &Envelope::CallError(error));
    }

    // ── Inbound ──────────────────────────────────────────────────────

    fn handle_frame(&self, ctx: &Context, conn: &Arc<Connection>, text: String) {
        tracing::trace!(connection_id = %conn.id(), frame = %text, "recv");
        match self.traits.decode(&text) {
            Err(e) => self.reply_error(conn, CallError::from_decode(&e)),
            Ok(Envelope::Call(call)) => self.handle_call(ctx, conn, call),
            Ok(Envelope::CallResult(result)) => self.handle_result(ctx, conn, result),
            Ok(Envelope::CallError(error)) => self.handle_peer_error(ctx, conn, error),
        }
    }

    fn handle_call(&self, ctx: &Context, conn: &Arc<Connection>, call: Call) {
        let uid = call.unique_id;
        let Some(entry) = self.traits.lookup(&call.action) else {
            let err = CallError::new(
                uid,
                ErrorCode::NotSupported,
                format!("action '{}' is not supported", call.action),
            );
            return self.reply_error(conn, err);
        };
        let request = match entry.decode_request(call.payload) {
            Ok(request) => request,
            Err(e) => return self.reply_error(conn, CallError::from_decode(&e.with_unique_id(uid.as_str()))),
        };
        let Some(handler) = self.plugin.request_handler(&call.action) else {
            let err = HandlerError::not_implemented(&call.action);
            return self.reply_error(conn, err.to_call_error(&uid));
        };

        let outcome = handler
            .handle(ctx, conn.id(), &uid, request)
            .and_then(|response| {
                response.check()?;
                response
                    .to_value()
                    .map_err(|e| HandlerError::internal(e.to_string()))
            });
        match outcome {
            Ok(payload) => {
                self.send_envelope(conn, &Envelope::CallResult(CallResult::new(uid, payload)))
            }
            Err(e) => {
                tracing::debug!(connection_id = %conn.id(), action = %call.action, error = %e, "handler failed");
                self.reply_error(conn, e.to_call_error(&uid));
            }
        }
    }

    /// The in-flight call this reply answers, completed in the
    /// dispatcher. `None` for stale or unexpected replies.
    fn complete_pending(&self, conn: &Connection, unique_id: &str) -> Option<Call> {
        let call = self
            .dispatcher
            .pending_call(conn.id())
            .filter(|c| c.unique_id == unique_id);
        let Some(call) = call else {
            tracing::warn!(connection_id = %conn.id(), unique_id, "reply to no pending call");
            return None;
        };
        if !self.dispatcher.complete(conn.id(), unique_id) {
            return None;
        }
        Some(call)
    }

    fn handle_result(&self, ctx: &Context, conn: &Arc<Connection>, result: CallResult) {
        let Some(call) = self.complete_pending(conn, &result.unique_id) else {
            return;
        };
        let Some(handler) = self.plugin.response_handler(&call.action) else {
            tracing::debug!(action = %call.action, "no response handler");
            return;
        };
        let Some(entry) = self.traits.lookup(&call.action) else {
            return;
        };
        let outcome = match entry.decode_response(result.payload) {
            Ok(response) => handler.handle_result(ctx, conn.id(), &result.unique_id, response),
            Err(e) => {
                let err = CallError::from_decode(&e.with_unique_id(result.unique_id.as_str()));
                handler.handle_error(ctx, conn.id(), &err)
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(connection_id = %conn.id(), action = %call.action, error = %e, "response handler failed");
        }
    }

    fn handle_peer_error(&self, ctx: &Context, conn: &Arc<Connection>, error: CallError) {
        let Some(call) = self.complete_pending(conn, &error.unique_id) else {
            return;
        };
        tracing::debug!(
            connection_id = %conn.id(),
            unique_id = %error.unique_id,
            code = %error.error_code,
            "peer answered with CallError"
        );
        if let Some(handler) = self.plugin.response_handler(&call.action) {
            if let Err(e) = handler.handle_error(ctx, conn.id(), &error) {
                tracing::warn!(connection_id = %conn.id(), action = %call.action, error = %e, "response handler failed");
            }
        }
    }
}

impl EventHandler for ServerInner {
    fn on_readable(&self, _reactor: usize, fd: RawFd) -> io::Result<()> {
        let conn = self
            .registry
            .by_fd(fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no connection for fd"))?;
        let Some(me) = self.me.upgrade() else {
            return Err(io::Error::other("server dropped"));
        };
        conn.read_frames(|text| {
            let inner = Arc::clone(&me);
            let conn = Arc::clone(&conn);
            let ctx = Context::new(conn.remote_addr());
            let job = move || inner.handle_frame(&ctx, &conn, text);
            if self.workers.spawn(job).is_err() {
                tracing::debug!("worker pool closed; frame dropped");
            }
        })
    }

    fn on_release(&self, _reactor: usize, fd: RawFd, reason: Release) {
        let Some(conn) = self.registry.by_fd(fd) else {
            return;
        };
        match reason {
            Release::ReadFailed => self.teardown(&conn, CloseCode::Normal, "connection lost", false),
            Release::Shutdown => self.teardown(&conn, CloseCode::Away, "server shutting down", false),
        }
    }
}

impl DispatchPeer for ServerInner {
    fn send_call(&self, connection_id: &str, call: Call) {
        let Some(conn) = self.registry.get(connection_id) else {
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let job = move || me.send_envelope(&conn, &Envelope::Call(call));
        if self.workers.spawn(job).is_err() {
            tracing::debug!(connection_id, "worker pool closed; call not sent");
        }
    }

    fn deliver_error(&self, connection_id: &str, action: &str, error: CallError) {
        let Some(handler) = self.plugin.response_handler(action) else {
            return;
        };
        let remote = self
            .registry
            .get(connection_id)
            .and_then(|c| c.remote_addr());
        let connection_id = connection_id.to_string();
        let action = action.to_string();
        let job = move || {
            let ctx = Context::new(remote);
            if let Err(e) = handler.handle_error(&ctx, &connection_id, &error) {
                tracing::warn!(%connection_id, %action, error = %e, "response handler failed");
            }
        };
        if self.workers.spawn(job).is_err() {
            tracing::debug!("worker pool closed; timeout not delivered");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
