//! Application handler plugin.
//!
//! The server never embeds business logic: it decodes, validates and
//! routes. A [`HandlerPlugin`] supplies per-action handlers:
//!
//! - inbound `Call` → [`RequestHandler::handle`] → `CallResult` / `CallError`
//! - reply to our outbound `Call` → [`ResponseHandler::handle_result`]
//! - peer `CallError` or a synthesized timeout → [`ResponseHandler::handle_error`]
//!
//! [`HandlerTable`] is a ready-made plugin with typed registration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ocpp_core::{Action, CallError, Payload};

use crate::error::HandlerError;

/// Per-message context passed to handlers.
#[derive(Debug, Clone)]
pub struct Context {
    pub remote_addr: Option<SocketAddr>,
    pub received_at: DateTime<Utc>,
}

impl Context {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            received_at: Utc::now(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(None)
    }
}

pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &Context,
        connection_id: &str,
        unique_id: &str,
        request: Box<dyn Payload>,
    ) -> Result<Box<dyn Payload>, HandlerError>;
}

pub trait ResponseHandler: Send + Sync {
    fn handle_result(
        &self,
        ctx: &Context,
        connection_id: &str,
        unique_id: &str,
        response: Box<dyn Payload>,
    ) -> Result<(), HandlerError>;

    fn handle_error(
        &self,
        ctx: &Context,
        connection_id: &str,
        error: &CallError,
    ) -> Result<(), HandlerError>;
}

pub trait HandlerPlugin: Send + Sync + 'static {
    fn request_handler(&self, action: &str) -> Option<Arc<dyn RequestHandler>>;
    fn response_handler(&self, action: &str) -> Option<Arc<dyn ResponseHandler>>;
}

// ── Typed adapters ───────────────────────────────────────────────────

type ResultFn =
    Arc<dyn Fn(&Context, &str, &str, Box<dyn Payload>) -> Result<(), HandlerError> + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&Context, &str, &CallError) -> Result<(), HandlerError> + Send + Sync>;

struct TypedRequest<F> {
    action: &'static str,
    f: F,
}

impl<F> RequestHandler for TypedRequest<F>
where
    F: Fn(&Context, &str, &str, Box<dyn Payload>) -> Result<Box<dyn Payload>, HandlerError>
        + Send
        + Sync,
{
    fn handle(
        &self,
        ctx: &Context,
        connection_id: &str,
        unique_id: &str,
        request: Box<dyn Payload>,
    ) -> Result<Box<dyn Payload>, HandlerError> {
        tracing::trace!(action = self.action, connection_id, unique_id, "request handler");
        (self.f)(ctx, connection_id, unique_id, request)
    }
}

#[derive(Default, Clone)]
struct ResponseEntry {
    on_result: Option<ResultFn>,
    on_error: Option<ErrorFn>,
}

impl ResponseHandler for ResponseEntry {
    fn handle_result(
        &self,
        ctx: &Context,
        connection_id: &str,
        unique_id: &str,
        response: Box<dyn Payload>,
    ) -> Result<(), HandlerError> {
        match &self.on_result {
            Some(f) => f(ctx, connection_id, unique_id, response),
            None => Ok(()),
        }
    }

    fn handle_error(
        &self,
        ctx: &Context,
        connection_id: &str,
        error: &CallError,
    ) -> Result<(), HandlerError> {
        match &self.on_error {
            Some(f) => f(ctx, connection_id, error),
            None => Ok(()),
        }
    }
}

fn mismatch(action: &str) -> HandlerError {
    HandlerError::internal(format!("payload type mismatch for action '{}'", action))
}

/// Plugin built from typed closures.
///
/// ```ignore
/// let mut table = HandlerTable::new();
/// table.on_request::<Heartbeat, _>(|_ctx, _id, _req| {
///     Ok(HeartbeatResponse { current_time: Utc::now() })
/// });
/// ```
#[derive(Default)]
pub struct HandlerTable {
    requests: HashMap<&'static str, Arc<dyn RequestHandler>>,
    responses: HashMap<&'static str, ResponseEntry>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle inbound `A` calls.
    pub fn on_request<A, F>(&mut self, f: F) -> &mut Self
    where
        A: Action,
        F: Fn(&Context, &str, A::Request) -> Result<A::Response, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let handler = TypedRequest {
            action: A::NAME,
            f: move |ctx: &Context,
                     conn: &str,
                     _uid: &str,
                     req: Box<dyn Payload>|
                  -> Result<Box<dyn Payload>, HandlerError> {
                let req = req.downcast::<A::Request>().map_err(|_| mismatch(A::NAME))?;
                let resp = f(ctx, conn, *req)?;
                Ok(Box::new(resp) as Box<dyn Payload>)
            },
        };
        self.requests.insert(A::NAME, Arc::new(handler));
        self
    }

    /// Handle results of our outbound `A` calls.
    pub fn on_response<A, F>(&mut self, f: F) -> &mut Self
    where
        A: Action,
        F: Fn(&Context, &str, &str, A::Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let entry = self.responses.entry(A::NAME).or_default();
        entry.on_result = Some(Arc::new(
            move |ctx: &Context,
                  conn: &str,
                  uid: &str,
                  resp: Box<dyn Payload>|
                  -> Result<(), HandlerError> {
                let resp = resp.downcast::<A::Response>().map_err(|_| mismatch(A::NAME))?;
                f(ctx, conn, uid, *resp)
            },
        ));
        self
    }

    /// Handle error replies (peer or timeout) to our outbound `A` calls.
    pub fn on_error<A, F>(&mut self, f: F) -> &mut Self
    where
        A: Action,
        F: Fn(&Context, &str, &CallError) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let entry = self.responses.entry(A::NAME).or_default();
        entry.on_error = Some(Arc::new(f));
        self
    }
}

impl HandlerPlugin for HandlerTable {
    fn request_handler(&self, action: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests.get(action).cloned()
    }

    fn response_handler(&self, action: &str) -> Option<Arc<dyn ResponseHandler>> {
        let entry = self.responses.get(action)?;
        Some(Arc::new(entry.clone()))
    }
}
