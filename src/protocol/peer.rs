//! Agent Protocol RPC peer.
//!
//! Speaks the asymmetric JSON-RPC dialect with one agent child: requests
//! `{id, method, params?}`, responses `{id, result|error}`, notifications
//! `{method, params?}`, and reverse (server→client) requests carrying both
//! `id` and `method`.
//!
//! One writer task owns stdin; one reader task owns stdout. Application code
//! interacts only through [`RpcPeer::request`], [`RpcPeer::notify`], and
//! [`RpcPeer::subscribe`], which serialize through the writer channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::FrameCodec;
use crate::{AppError, Result};

/// Reverse-request methods the peer answers automatically.
pub const APPROVAL_METHODS: &[&str] = &[
    "item/commandExecution/requestApproval",
    "item/fileChange/requestApproval",
];

/// Decision returned for auto-answered approval requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Approve the requested action.
    #[default]
    Accept,
    /// Reject the requested action.
    Decline,
}

impl ApprovalDecision {
    /// Wire token for the decision.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

/// Peer construction options.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Client name sent in the `initialize` handshake.
    pub client_name: String,
    /// Client version sent in the `initialize` handshake.
    pub client_version: String,
    /// Decision applied to approval reverse requests.
    pub approval_decision: ApprovalDecision,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            client_name: "flint-gateway".to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            approval_decision: ApprovalDecision::Accept,
        }
    }
}

/// One inbound notification fanned out to subscribers.
#[derive(Debug, Clone)]
pub struct AgentNotification {
    /// Notification method.
    pub method: String,
    /// Method-specific payload; `Null` when absent.
    pub params: Value,
}

type PendingSender = oneshot::Sender<Result<Value>>;

struct PeerShared {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingSender>>,
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<AgentNotification>>>,
    next_listener_id: AtomicU64,
    out_tx: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    approval_decision: ApprovalDecision,
}

/// A live Agent Protocol peer.
#[derive(Clone)]
pub struct RpcPeer {
    shared: Arc<PeerShared>,
}

impl RpcPeer {
    /// Start the writer and reader tasks over the given stdio streams.
    ///
    /// The peer is not ready for turns until [`initialize`](Self::initialize)
    /// completes.
    pub fn start<W, R>(writer: W, reader: R, options: &PeerOptions) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
        let cancel = CancellationToken::new();

        let shared = Arc::new(PeerShared {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            out_tx,
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            approval_decision: options.approval_decision,
        });

        tokio::spawn(run_writer(writer, out_rx, cancel.clone()));
        tokio::spawn(run_reader(reader, Arc::clone(&shared), cancel));

        Self { shared }
    }

    /// Perform the startup handshake: `initialize` then `initialized`.
    ///
    /// # Errors
    ///
    /// Returns the underlying request error if the agent rejects or times
    /// out the `initialize` request.
    pub async fn initialize(&self, options: &PeerOptions) -> Result<Value> {
        let info = self
            .request(
                "initialize",
                json!({
                    "clientInfo": {
                        "name": options.client_name,
                        "version": options.client_version,
                    }
                }),
            )
            .await?;
        self.notify("initialized", Value::Null)?;
        Ok(info)
    }

    /// Send a request and await its response.
    ///
    /// Ids are monotonic integers. The per-call timeout is method-specific;
    /// on timeout the pending entry is removed and a late response from the
    /// child is dropped.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`]`("client closed")` — the peer was closed.
    /// - [`AppError::Protocol`]`("request … timed out …")` — no response.
    /// - [`AppError::Agent`] — the agent answered with an error object, or
    ///   exited while the call was pending (the message carries the exit
    ///   code and stderr tail).
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Register before sending so an immediate response cannot be lost.
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, tx);
        }

        let mut frame = json!({ "id": id, "method": method });
        if !params.is_null() {
            frame["params"] = params;
        }

        if self.shared.out_tx.send(frame).is_err() {
            self.remove_pending(id);
            return Err(self.closed_error());
        }

        let timeout = timeout_for(method);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_elapsed) => {
                self.remove_pending(id);
                Err(AppError::Protocol(format!(
                    "request `{method}` timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`]`("client closed")` when the writer is
    /// gone.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        let mut frame = json!({ "method": method });
        if !params.is_null() {
            frame["params"] = params;
        }
        self.shared
            .out_tx
            .send(frame)
            .map_err(|_| self.closed_error())
    }

    /// Subscribe to inbound notifications.
    ///
    /// Notifications are delivered in the order the child emits them; every
    /// subscriber observes the same order. Dropping the stream removes the
    /// listener.
    #[must_use]
    pub fn subscribe(&self) -> NotificationStream {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.insert(id, tx);
        }
        NotificationStream {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether the peer has been closed or the child has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the peer: stop the stream tasks and reject all pending calls.
    ///
    /// Idempotent. The child itself is owned by the exit monitor, which
    /// reacts to the cancellation by killing the process.
    pub fn close(&self) {
        self.shutdown("client closed");
    }

    /// Mark the peer failed with `reason`, rejecting all pending calls.
    ///
    /// Used by the exit monitor when the child dies underneath us.
    pub fn shutdown(&self, reason: &str) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut stored) = self.shared.close_reason.lock() {
            stored.get_or_insert_with(|| reason.to_owned());
        }
        self.shared.cancel.cancel();

        let drained: Vec<PendingSender> = self
            .shared
            .pending
            .lock()
            .map(|mut pending| pending.drain().map(|(_, tx)| tx).collect())
            .unwrap_or_default();
        for tx in drained {
            let _ = tx.send(Err(AppError::Agent(reason.to_owned())));
        }

        // Dropping the senders ends every subscriber stream.
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.clear();
        }
    }

    /// Cancellation token tied to the peer's stream tasks.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    fn closed_error(&self) -> AppError {
        let reason = self
            .shared
            .close_reason
            .lock()
            .ok()
            .and_then(|stored| stored.clone())
            .unwrap_or_else(|| "client closed".to_owned());
        if reason == "client closed" {
            AppError::Protocol(reason)
        } else {
            AppError::Agent(reason)
        }
    }

    fn remove_pending(&self, id: i64) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&id);
        }
    }
}

/// Subscriber handle over the peer's notification fan-out.
///
/// The stream ends (`recv` returns `None`) when the peer closes or the
/// child exits.
pub struct NotificationStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<AgentNotification>,
    shared: Weak<PeerShared>,
}

impl NotificationStream {
    /// Receive the next notification, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<AgentNotification> {
        self.rx.recv().await
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Ok(mut listeners) = shared.listeners.lock() {
                listeners.remove(&self.id);
            }
        }
    }
}

// ── Per-method timeouts ───────────────────────────────────────────────────────

/// Request timeout for `method`.
fn timeout_for(method: &str) -> Duration {
    match method {
        "initialize" => Duration::from_secs(10),
        "thread/start" | "thread/resume" => Duration::from_secs(20),
        "turn/start" => Duration::from_secs(15),
        "turn/interrupt" => Duration::from_secs(10),
        _ => Duration::from_secs(30),
    }
}

// ── Stream tasks ──────────────────────────────────────────────────────────────

/// Writer task: serialise queued frames and write them to the child's stdin.
async fn run_writer<W>(
    writer: W,
    mut out_rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = FramedWrite::new(writer, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc writer: cancellation received, stopping");
                break;
            }

            frame = out_rx.recv() => {
                let Some(value) = frame else {
                    debug!("rpc writer: outbound channel closed, stopping");
                    break;
                };
                let line = value.to_string();
                if let Err(e) = framed.send(line).await {
                    warn!(error = %e, "rpc writer: write to agent stdin failed");
                    break;
                }
            }
        }
    }
}

/// Reader task: decode inbound frames and classify them.
///
/// A frame with both `id` and `method` is a reverse request; with `id` only
/// it is a response; with `method` only it is a notification. Anything else
/// is logged and dropped.
async fn run_reader<R>(reader: R, shared: Arc<PeerShared>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framed = FramedRead::new(reader, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("rpc reader: EOF on agent stdout");
                        break;
                    }
                    Some(Err(AppError::Protocol(msg))) => {
                        warn!(error = %msg, "rpc reader: framing error, skipping frame");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "rpc reader: stream error, stopping");
                        break;
                    }
                    Some(Ok(line)) => {
                        match serde_json::from_str::<Value>(&line) {
                            Ok(frame) => classify_frame(&shared, frame),
                            Err(e) => {
                                warn!(error = %e, "rpc reader: malformed json frame, skipping");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Route one inbound frame to pending calls, approvals, or listeners.
fn classify_frame(shared: &Arc<PeerShared>, frame: Value) {
    let has_id = frame.get("id").is_some();
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match (has_id, method) {
        (true, Some(method)) => handle_reverse_request(shared, &method, &frame),
        (true, None) => handle_response(shared, &frame),
        (false, Some(method)) => {
            let params = frame.get("params").cloned().unwrap_or(Value::Null);
            fan_out(shared, AgentNotification { method, params });
        }
        (false, None) => {
            warn!("rpc reader: frame with neither id nor method, dropping");
        }
    }
}

/// Resolve a pending call from a response frame.
fn handle_response(shared: &Arc<PeerShared>, frame: &Value) {
    let Some(id) = frame.get("id").and_then(Value::as_i64) else {
        warn!("rpc reader: response with non-integer id, dropping");
        return;
    };

    let tx = shared
        .pending
        .lock()
        .ok()
        .and_then(|mut pending| pending.remove(&id));

    let Some(tx) = tx else {
        // Late response after a timeout; §4.2 says drop it.
        debug!(id, "rpc reader: no pending call for response");
        return;
    };

    let outcome = if let Some(error) = frame.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown agent error");
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        Err(AppError::Agent(format!(
            "agent error {code}: {message}"
        )))
    } else {
        Ok(frame.get("result").cloned().unwrap_or(Value::Null))
    };

    let _ = tx.send(outcome);
}

/// Answer a server→client request and surface it as an activity beat.
///
/// Known approval methods get the configured decision; everything else is
/// answered with a "method not supported" error. The peer always responds.
fn handle_reverse_request(shared: &Arc<PeerShared>, method: &str, frame: &Value) {
    let id = frame.get("id").cloned().unwrap_or(Value::Null);

    if APPROVAL_METHODS.contains(&method) {
        let response = json!({
            "id": id,
            "result": { "decision": shared.approval_decision.as_str() }
        });
        if shared.out_tx.send(response).is_err() {
            warn!(method, "rpc reader: failed to queue approval response");
        }
        // Forward the request to listeners so the inactivity watchdog sees
        // the approval round-trip as activity.
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        fan_out(
            shared,
            AgentNotification {
                method: method.to_owned(),
                params,
            },
        );
        return;
    }

    debug!(method, "rpc reader: unsupported reverse request");
    let response = json!({
        "id": id,
        "error": { "code": -32601, "message": "method not supported" }
    });
    if shared.out_tx.send(response).is_err() {
        warn!(method, "rpc reader: failed to queue error response");
    }
}

/// Deliver a notification to every registered listener, in order.
fn fan_out(shared: &Arc<PeerShared>, notification: AgentNotification) {
    let Ok(listeners) = shared.listeners.lock() else {
        return;
    };
    for tx in listeners.values() {
        let _ = tx.send(notification.clone());
    }
}
