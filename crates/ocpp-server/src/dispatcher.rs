//! # Dispatcher: single-flight outbound calls
//!
//! One thread owns every per-connection timeout context and decides when
//! a connection may send its next queued call. Everything else talks to
//! it through a channel:
//!
//! ```text
//!  append_request ─► queue.push ─► Enqueued(id) ─┐
//!  reply observed ─► request_done ─► Ready(id) ──┤     ┌─────────────┐
//!  teardown ───────► purge ───────► Cancelled(id)├────►│ event loop  │──► peer.send_call
//!  stop() ─────────────────────────► Stop ───────┘     │ + timer heap│──► peer.deliver_error
//!                                                      └─────────────┘
//! ```
//!
//! Per connection the loop sees one of three states:
//!
//! - **Idle**: no entry in `active`; the queue head may be dispatched
//! - **Active**: one call in flight, with a deadline in the timer heap
//! - **Draining**: queue and pending slot already purged; the pending
//!   `Cancelled` event drops the timeout context
//!
//! The queue head is only popped by [`Dispatcher::request_done`], and
//! only when its uniqueId matches the completing one. Timer entries are
//! invalidated lazily: a popped entry whose sequence number no longer
//! matches the connection's active call is skipped.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use ocpp_core::{Call, CallError, ErrorCode, RingQueue, TraitRegistry};
use parking_lot::{Mutex, RwLock};

use crate::error::{DispatchError, ServerError};
use crate::worker::panic_message;

/// The dispatcher's narrow view of the server.
pub trait DispatchPeer: Send + Sync + 'static {
    /// Write `call` to the connection. Must not block the caller.
    fn send_call(&self, connection_id: &str, call: Call);

    /// Deliver a synthesized error reply to the local response handler.
    fn deliver_error(&self, connection_id: &str, action: &str, error: CallError);
}

/// The in-flight call for one connection, if any.
#[derive(Debug, Clone, Default)]
pub struct PendingRequest {
    pub call: Option<Call>,
    pub sent_at: Option<Instant>,
}

#[derive(Debug)]
enum Event {
    Enqueued(String),
    Ready { id: String, unique_id: String },
    Cancelled(String),
    Stop,
}

pub struct Dispatcher {
    traits: Arc<TraitRegistry>,
    queues: RwLock<HashMap<String, Arc<RingQueue<Call>>>>,
    pending: RwLock<HashMap<String, PendingRequest>>,
    timeout: Option<Duration>,
    events: Sender<Event>,
    receiver: Mutex<Option<Receiver<Event>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Dispatcher {
    /// `timeout: None` disables response timeouts entirely.
    pub fn new(traits: Arc<TraitRegistry>, timeout: Option<Duration>) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            traits,
            queues: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            timeout,
            events: tx,
            receiver: Mutex::new(Some(rx)),
            thread: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Spawn the event loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>, peer: Arc<dyn DispatchPeer>) -> Result<(), ServerError> {
        let Some(rx) = self.receiver.lock().take() else {
            return Ok(());
        };
        install_panic_hook();
        self.running.store(true, Ordering::Release);
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("ocpp-dispatcher".into())
            .spawn(move || me.run(rx, peer))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the loop, cancelling every timeout context, and join it.
    pub fn stop(&self) {
        let _ = self.events.send(Event::Stop);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::Release);
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Create the queue and empty pending slot for an admitted connection.
    pub fn add_connection(&self, id: &str) {
        self.queues
            .write()
            .insert(id.to_string(), Arc::new(RingQueue::new()));
        self.pending
            .write()
            .insert(id.to_string(), PendingRequest::default());
    }

    /// Purge queue and pending state. Calls in flight complete neither
    /// way from the application's point of view.
    pub fn remove_connection(&self, id: &str) {
        let dropped = self
            .queues
            .write()
            .remove(id)
            .map(|q| q.len())
            .unwrap_or(0);
        self.pending.write().remove(id);
        if dropped > 0 {
            tracing::debug!(connection_id = id, dropped, "purged queued calls");
        }
        let _ = self.events.send(Event::Cancelled(id.to_string()));
    }

    pub fn has_connection(&self, id: &str) -> bool {
        self.queues.read().contains_key(id)
    }

    // ── Outbound calls ───────────────────────────────────────────────

    /// Validate `call` and queue it for `id`. Nothing is queued on error.
    pub fn append_request(&self, id: &str, call: Call) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Stopped);
        }
        self.traits.validate_call(&call)?;
        let queue = self
            .queues
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownConnection(id.to_string()))?;
        tracing::debug!(
            connection_id = id,
            unique_id = %call.unique_id,
            action = %call.action,
            "call queued"
        );
        queue.push(call);
        self.events
            .send(Event::Enqueued(id.to_string()))
            .map_err(|_| DispatchError::Stopped)
    }

    /// The call currently in flight on `id`.
    pub fn pending_call(&self, id: &str) -> Option<Call> {
        self.pending.read().get(id).and_then(|p| p.call.clone())
    }

    /// How long the in-flight call on `id` has been waiting for a reply.
    pub fn pending_age(&self, id: &str) -> Option<Duration> {
        self.pending
            .read()
            .get(id)
            .and_then(|p| p.sent_at)
            .map(|sent| sent.elapsed())
    }

    pub fn queue_len(&self, id: &str) -> usize {
        self.queues.read().get(id).map(|q| q.len()).unwrap_or(0)
    }

    /// Pop the queue head iff its uniqueId is `unique_id`, and clear the
    /// pending slot. Returns `false` (queue untouched) on mismatch.
    pub fn request_done(&self, id: &str, unique_id: &str) -> bool {
        let Some(queue) = self.queues.read().get(id).cloned() else {
            return false;
        };
        if queue.pop_if(|head| head.unique_id == unique_id).is_none() {
            let head = queue.peek_with(|c| c.unique_id.clone());
            tracing::warn!(
                connection_id = id,
                unique_id,
                head = ?head,
                "completion does not match queue head"
            );
            return false;
        }
        if let Some(slot) = self.pending.write().get_mut(id) {
            if slot
                .call
                .as_ref()
                .is_some_and(|c| c.unique_id == unique_id)
            {
                *slot = PendingRequest::default();
            }
        }
        true
    }

    /// A reply for `unique_id` arrived: complete it and let the loop
    /// dispatch the next call. Returns whether the reply matched.
    pub fn complete(&self, id: &str, unique_id: &str) -> bool {
        if !self.request_done(id, unique_id) {
            return false;
        }
        let _ = self.events.send(Event::Ready {
            id: id.to_string(),
            unique_id: unique_id.to_string(),
        });
        true
    }

    // ── Event loop ───────────────────────────────────────────────────

    fn run(self: Arc<Self>, rx: Receiver<Event>, peer: Arc<dyn DispatchPeer>) {
        tracing::debug!(timeout = ?self.timeout, "dispatcher started");
        let mut state = LoopState::default();
        CAPTURE_PANICS.with(|c| c.set(true));
        let outcome = catch_unwind(AssertUnwindSafe(|| self.event_loop(&rx, &*peer, &mut state)));
        if let Err(payload) = outcome {
            let backtrace = take_panic_trace().unwrap_or_else(|| "unavailable".to_string());
            tracing::error!(
                panic = %panic_message(&*payload),
                %backtrace,
                "dispatcher loop panicked; exiting"
            );
        }
        self.running.store(false, Ordering::Release);
        tracing::debug!("dispatcher stopped");
    }

    fn event_loop(&self, rx: &Receiver<Event>, peer: &dyn DispatchPeer, state: &mut LoopState) {
        loop {
            let event = match state.next_deadline() {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => return,
                },
            };

            match event {
                Some(Event::Enqueued(id)) => {
                    if !state.active.contains_key(&id) {
                        self.dispatch_next(&id, peer, state);
                    }
                }
                Some(Event::Ready { id, unique_id }) => {
                    let matches = state
                        .active
                        .get(&id)
                        .is_some_and(|a| a.unique_id == unique_id);
                    if matches {
                        state.active.remove(&id);
                        self.dispatch_next(&id, peer, state);
                    }
                }
                Some(Event::Cancelled(id)) => {
                    state.active.remove(&id);
                }
                Some(Event::Stop) => {
                    let cancelled = state.active.len();
                    state.active.clear();
                    state.timers.clear();
                    tracing::debug!(cancelled, "dispatcher stopping");
                    return;
                }
                None => {}
            }

            self.fire_expired(peer, state);
        }
    }

    /// Send the queue head for `id` if the connection is idle.
    fn dispatch_next(&self, id: &str, peer: &dyn DispatchPeer, state: &mut LoopState) {
        let Some(queue) = self.queues.read().get(id).cloned() else {
            return;
        };
        let Some(call) = queue.peek() else {
            return;
        };
        let now = Instant::now();
        {
            let mut pending = self.pending.write();
            let Some(slot) = pending.get_mut(id) else {
                return;
            };
            if let Some(busy) = &slot.call {
                tracing::error!(
                    connection_id = id,
                    in_flight = %busy.unique_id,
                    next = %call.unique_id,
                    "pending slot occupied; dispatch aborted"
                );
                return;
            }
            slot.call = Some(call.clone());
            slot.sent_at = Some(now);
        }

        state.seq += 1;
        let seq = state.seq;
        state.active.insert(
            id.to_string(),
            ActiveCall {
                unique_id: call.unique_id.clone(),
                action: call.action.clone(),
                seq,
            },
        );
        if let Some(timeout) = self.timeout {
            state.timers.push(Reverse(TimerEntry {
                deadline: now + timeout,
                seq,
                id: id.to_string(),
            }));
        }
        tracing::debug!(
            connection_id = id,
            unique_id = %call.unique_id,
            action = %call.action,
            "dispatching call"
        );
        peer.send_call(id, call);
    }

    fn fire_expired(&self, peer: &dyn DispatchPeer, state: &mut LoopState) {
        let now = Instant::now();
        while let Some(Reverse(top)) = state.timers.peek() {
            if top.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = state.timers.pop() else {
                break;
            };
            let live = state
                .active
                .get(&entry.id)
                .is_some_and(|a| a.seq == entry.seq);
            if !live {
                continue;
            }
            let Some(active) = state.active.remove(&entry.id) else {
                continue;
            };
            let waited = self.pending_age(&entry.id);
            // A reply that raced the timer already completed the call.
            if self.request_done(&entry.id, &active.unique_id) {
                tracing::warn!(
                    connection_id = %entry.id,
                    unique_id = %active.unique_id,
                    action = %active.action,
                    waited = ?waited,
                    "call timed out"
                );
                let error = CallError::new(
                    active.unique_id.as_str(),
                    ErrorCode::InternalError,
                    format!("timeout waiting for response to {}", active.unique_id),
                );
                peer.deliver_error(&entry.id, &active.action, error);
            }
            self.dispatch_next(&entry.id, peer, state);
        }
    }
}

// ── Panic capture ────────────────────────────────────────────────────

thread_local! {
    static CAPTURE_PANICS: Cell<bool> = const { Cell::new(false) };
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that records the backtrace at the panic site for threads
/// that opted in. `catch_unwind` only sees the stack after unwinding.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURE_PANICS.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                PANIC_TRACE.with(|t| *t.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|t| t.borrow_mut().take())
}

struct ActiveCall {
    unique_id: String,
    action: String,
    seq: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: String,
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct LoopState {
    active: HashMap<String, ActiveCall>,
    /// Min-heap by deadline.
    timers: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

impl LoopState {
    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(t)| t.deadline)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use ocpp_core::actions::{Reset, ResetRequest, ResetType};
    use ocpp_core::call_for;
    use serde_json::json;

    #[derive(Debug)]
    enum Seen {
        Sent(String, String),
        Error(String, String, CallError),
    }

    struct Recorder {
        tx: Sender<Seen>,
    }

    impl DispatchPeer for Recorder {
        fn send_call(&self, connection_id: &str, call: Call) {
            let _ = self
                .tx
                .send(Seen::Sent(connection_id.to_string(), call.unique_id));
        }

        fn deliver_error(&self, connection_id: &str, action: &str, error: CallError) {
            let _ = self.tx.send(Seen::Error(
                connection_id.to_string(),
                action.to_string(),
                error,
            ));
        }
    }

    fn reset(uid: &str) -> Call {
        call_for::<Reset>(uid, &ResetRequest { kind: ResetType::Soft }).unwrap()
    }

    fn start(timeout: Option<Duration>) -> (Arc<Dispatcher>, Receiver<Seen>) {
        let dispatcher = Dispatcher::new(Arc::new(TraitRegistry::ocpp16()), timeout);
        let (tx, rx) = unbounded();
        dispatcher.start(Arc::new(Recorder { tx })).unwrap();
        (dispatcher, rx)
    }

    fn sent(rx: &Receiver<Seen>) -> (String, String) {
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Seen::Sent(id, uid) => (id, uid),
            other => panic!("expected send, got {:?}", other),
        }
    }

    #[test]
    fn test_single_flight() {
        let (d, rx) = start(None);
        d.add_connection("CP-1");
        for uid in ["a", "b", "c"] {
            d.append_request("CP-1", reset(uid)).unwrap();
        }
        assert_eq!(sent(&rx), ("CP-1".into(), "a".into()));
        // Nothing else goes out while "a" is in flight.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(d.pending_call("CP-1").unwrap().unique_id, "a");
        assert_eq!(d.queue_len("CP-1"), 3);

        assert!(d.complete("CP-1", "a"));
        assert_eq!(sent(&rx).1, "b");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(d.complete("CP-1", "b"));
        assert_eq!(sent(&rx).1, "c");
        assert!(d.complete("CP-1", "c"));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(d.queue_len("CP-1"), 0);
        d.stop();
    }

    #[test]
    fn test_connections_are_independent() {
        let (d, rx) = start(None);
        d.add_connection("A-1");
        d.add_connection("B-1");
        d.append_request("A-1", reset("a1")).unwrap();
        d.append_request("B-1", reset("b1")).unwrap();
        let mut got = vec![sent(&rx), sent(&rx)];
        got.sort();
        assert_eq!(
            got,
            vec![("A-1".into(), "a1".into()), ("B-1".into(), "b1".into())]
        );
        d.stop();
    }

    #[test]
    fn test_request_done_requires_matching_head() {
        let (d, rx) = start(None);
        d.add_connection("CP-1");
        d.append_request("CP-1", reset("a")).unwrap();
        d.append_request("CP-1", reset("b")).unwrap();
        sent(&rx);

        assert!(!d.request_done("CP-1", "b"));
        assert!(!d.request_done("CP-1", "zzz"));
        assert_eq!(d.queue_len("CP-1"), 2);
        assert!(d.request_done("CP-1", "a"));
        assert_eq!(d.queue_len("CP-1"), 1);
        assert!(d.pending_call("CP-1").is_none());
        assert!(!d.request_done("unknown", "a"));
        d.stop();
    }

    #[test]
    fn test_timeout_synthesizes_one_error_and_recovers() {
        let (d, rx) = start(Some(Duration::from_millis(50)));
        d.add_connection("CP-1");
        d.append_request("CP-1", reset("t1")).unwrap();
        d.append_request("CP-1", reset("t2")).unwrap();
        let started = Instant::now();
        assert_eq!(sent(&rx).1, "t1");

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Seen::Error(id, action, err) => {
                assert!(started.elapsed() >= Duration::from_millis(45));
                assert_eq!(id, "CP-1");
                assert_eq!(action, "Reset");
                assert_eq!(err.unique_id, "t1");
                assert_eq!(err.error_code, ErrorCode::InternalError);
                assert!(err.error_description.contains("t1"));
            }
            other => panic!("expected timeout error, got {:?}", other),
        }
        // Connection went back to idle and the next call went out.
        assert_eq!(sent(&rx).1, "t2");
        assert!(d.complete("CP-1", "t2"));
        // No second error for t1, none for the completed t2.
        assert!(rx.recv_timeout(Duration::from_millis(120)).is_err());
        d.stop();
    }

    #[test]
    fn test_late_reply_after_timeout_is_ignored() {
        let (d, rx) = start(Some(Duration::from_millis(30)));
        d.add_connection("CP-1");
        d.append_request("CP-1", reset("x")).unwrap();
        sent(&rx);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Seen::Error(..)
        ));
        assert!(!d.complete("CP-1", "x"));
        d.stop();
    }

    #[test]
    fn test_cancel_is_idempotent_and_silent() {
        let (d, rx) = start(Some(Duration::from_millis(30)));
        d.add_connection("CP-1");
        d.append_request("CP-1", reset("c1")).unwrap();
        sent(&rx);
        d.remove_connection("CP-1");
        d.remove_connection("CP-1");
        // Teardown fires neither a result nor a timeout error.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!d.has_connection("CP-1"));
        assert!(d.is_running());

        // Re-admission starts from a clean slate.
        d.add_connection("CP-1");
        d.append_request("CP-1", reset("c2")).unwrap();
        assert_eq!(sent(&rx).1, "c2");
        d.stop();
    }

    #[test]
    fn test_append_request_rejections() {
        let (d, _rx) = start(None);
        d.add_connection("CP-1");

        let err = d
            .append_request("CP-1", Call::new("", "Reset", json!({"type": "Soft"})))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Invalid(ref e) if e.code == ErrorCode::PropertyConstraintViolation));

        let err = d
            .append_request("CP-1", Call::new("u", "DataTransfer", json!({})))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Invalid(ref e) if e.code == ErrorCode::NotSupported));

        let err = d
            .append_request("CP-1", Call::new("u", "Reset", json!({"type": "Warm"})))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Invalid(_)));

        let err = d.append_request("nobody", reset("u")).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownConnection(_)));
        assert_eq!(d.queue_len("CP-1"), 0);

        d.stop();
        assert!(matches!(
            d.append_request("CP-1", reset("late")),
            Err(DispatchError::Stopped)
        ));
    }

    #[test]
    fn test_stop_cancels_pending_timeouts() {
        let (d, rx) = start(Some(Duration::from_millis(40)));
        d.add_connection("CP-1");
        d.append_request("CP-1", reset("s1")).unwrap();
        sent(&rx);
        d.stop();
        assert!(!d.is_running());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_occupied_pending_slot_aborts_dispatch() {
        let (d, rx) = start(None);
        d.add_connection("CP-1");
        if let Some(slot) = d.pending.write().get_mut("CP-1") {
            slot.call = Some(reset("stray"));
        }
        d.append_request("CP-1", reset("next")).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(d.pending_call("CP-1").unwrap().unique_id, "stray");
        assert_eq!(d.queue_len("CP-1"), 1);
        d.stop();
    }

    #[test]
    fn test_pending_age_tracks_in_flight_call() {
        let (d, rx) = start(None);
        d.add_connection("CP-1");
        assert!(d.pending_age("CP-1").is_none());
        d.append_request("CP-1", reset("a")).unwrap();
        sent(&rx);
        thread::sleep(Duration::from_millis(20));
        assert!(d.pending_age("CP-1").unwrap() >= Duration::from_millis(20));
        assert!(d.complete("CP-1", "a"));
        assert!(d.pending_age("CP-1").is_none());
        d.stop();
    }

    #[test]
    fn test_panic_trace_recorded_by_hook() {
        install_panic_hook();
        CAPTURE_PANICS.with(|c| c.set(true));
        let outcome = catch_unwind(|| panic!("inside the loop"));
        CAPTURE_PANICS.with(|c| c.set(false));
        assert!(outcome.is_err());
        let trace = take_panic_trace().unwrap();
        assert!(!trace.is_empty());
        assert!(take_panic_trace().is_none());
    }

    #[test]
    fn test_panicking_peer_stops_loop() {
        struct Explodes;
        impl DispatchPeer for Explodes {
            fn send_call(&self, _: &str, _: Call) {
                panic!("peer exploded");
            }
            fn deliver_error(&self, _: &str, _: &str, _: CallError) {}
        }
        let d = Dispatcher::new(Arc::new(TraitRegistry::ocpp16()), None);
        d.start(Arc::new(Explodes)).unwrap();
        d.add_connection("CP-1");
        d.append_request("CP-1", reset("p")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while d.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!d.is_running());
        d.stop();
    }
}
