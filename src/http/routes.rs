//! Route handlers for the gateway HTTP API.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::channels::WebhookOutcome;
use crate::gateway::{GatewayEngine, TurnReply};
use crate::models::event::AgentEvent;
use crate::models::message::InboundMessage;
use crate::{AppError, Result};

type Engine = Arc<GatewayEngine>;

/// Body accepted by `POST /v1/threads/{id}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContinueBody {
    text: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

// ── Read routes ───────────────────────────────────────────────────────────────

/// `GET /v1/health`
pub async fn health(State(engine): State<Engine>) -> Response {
    let options = engine.options();
    Json(json!({
        "ok": true,
        "provider": options.provider.hint(),
        "defaultRoutingMode": options.routing_mode.as_str(),
    }))
    .into_response()
}

/// `GET /v1/threads`
pub async fn list_threads(State(engine): State<Engine>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&engine, &headers) {
        return denied;
    }
    let data: Vec<_> = engine
        .store()
        .list()
        .await
        .iter()
        .map(crate::models::thread::ThreadRecord::public)
        .collect();
    Json(json!({ "data": data })).into_response()
}

/// `GET /v1/threads/{id}`
pub async fn get_thread(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&engine, &headers) {
        return denied;
    }
    match engine.store().get(&id).await {
        Some(record) => Json(json!({ "data": record.public() })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Thread not found." })),
        )
            .into_response(),
    }
}

// ── Turn routes ───────────────────────────────────────────────────────────────

/// `POST /v1/threads`
pub async fn create_thread(
    State(engine): State<Engine>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = authorize(&engine, &headers) {
        return denied;
    }

    let message: InboundMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => return bad_request(&format!("invalid request body: {e}")),
    };
    if let Err(e) = message.normalized() {
        let (status, payload) = error_payload(&e);
        return (status, Json(payload)).into_response();
    }

    if wants_sse(&headers) {
        let engine = Arc::clone(&engine);
        return stream_turn(move |tx| {
            tokio::spawn(async move { engine.handle_message(&message, Some(tx)).await })
        });
    }

    let key = idempotency_key(&headers, message.idempotency_key.as_deref());
    let fingerprint = String::from_utf8_lossy(&body).into_owned();
    let engine_for_task = Arc::clone(&engine);
    let run = async move {
        reply_to_stored(engine_for_task.handle_message(&message, None).await)
    };

    match key {
        Some(key) => replay_or_run(&engine, &key, &fingerprint, run).await,
        None => stored_to_response(run.await, None, false),
    }
}

/// `POST /v1/threads/{id}`
pub async fn continue_thread(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = authorize(&engine, &headers) {
        return denied;
    }

    let parsed: ContinueBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => return bad_request(&format!("invalid request body: {e}")),
    };
    if engine.store().get(&id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Thread not found." })),
        )
            .into_response();
    }

    if wants_sse(&headers) {
        let engine = Arc::clone(&engine);
        return stream_turn(move |tx| {
            tokio::spawn(async move { engine.handle_existing(&id, &parsed.text, Some(tx)).await })
        });
    }

    let key = idempotency_key(&headers, parsed.idempotency_key.as_deref());
    let fingerprint = format!("{id}:{}", String::from_utf8_lossy(&body));
    let engine_for_task = Arc::clone(&engine);
    let run = async move {
        reply_to_stored(engine_for_task.handle_existing(&id, &parsed.text, None).await)
    };

    match key {
        Some(key) => replay_or_run(&engine, &key, &fingerprint, run).await,
        None => stored_to_response(run.await, None, false),
    }
}

/// `POST /v1/threads/{id}/interrupt`
pub async fn interrupt_thread(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&engine, &headers) {
        return denied;
    }

    if engine.interrupt_thread(&id).await {
        return Json(json!({ "ok": true, "threadId": id, "interrupted": true })).into_response();
    }

    if engine.store().get(&id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Thread not found." })),
        )
            .into_response();
    }

    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "No active runtime for this thread." })),
    )
        .into_response()
}

// ── Webhooks ──────────────────────────────────────────────────────────────────

/// `POST /webhooks/{name}`
pub async fn webhook(
    State(engine): State<Engine>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(adapter) = engine.adapter(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Unknown webhook." })),
        )
            .into_response();
    };

    if !adapter.verify_request(&headers, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Signature verification failed." })),
        )
            .into_response();
    }

    match adapter.parse_webhook(&body, &headers) {
        Ok(WebhookOutcome::Challenge { response }) => response.into_response(),
        Ok(WebhookOutcome::Ignore) => Json(json!({ "ok": true })).into_response(),
        Ok(WebhookOutcome::Message {
            message,
            meta,
            event_id,
        }) => {
            if let Some(ref event_id) = event_id {
                if engine.webhook_duplicate(event_id) {
                    return Json(json!({ "ok": true, "duplicate": true })).into_response();
                }
            }
            tokio::spawn(Arc::clone(&engine).process_webhook(adapter, *message, meta));
            Json(json!({ "ok": true })).into_response()
        }
        Err(e) => bad_request(&e.to_string()),
    }
}

// ── SSE streaming ─────────────────────────────────────────────────────────────

/// States of one SSE turn stream.
enum SseState {
    Streaming(mpsc::Receiver<AgentEvent>, JoinHandle<Result<TurnReply>>),
    Finished,
}

/// Run a turn and stream its events as SSE.
///
/// Events are emitted as they arrive; the turn's final reply is appended as
/// an `event: result` frame, or `event: error` when the turn failed.
fn stream_turn<F>(start: F) -> Response
where
    F: FnOnce(mpsc::Sender<AgentEvent>) -> JoinHandle<Result<TurnReply>>,
{
    let (tx, rx) = mpsc::channel::<AgentEvent>(32);
    let handle = start(tx);

    let stream = sse_stream(rx, handle);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Unfold the event channel plus the pending turn into SSE frames.
fn sse_stream(
    rx: mpsc::Receiver<AgentEvent>,
    handle: JoinHandle<Result<TurnReply>>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    futures_util::stream::unfold(SseState::Streaming(rx, handle), |state| async move {
        match state {
            SseState::Streaming(mut rx, handle) => {
                if let Some(event) = rx.recv().await {
                    let frame = Event::default()
                        .event(event.kind())
                        .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".into()));
                    return Some((Ok(frame), SseState::Streaming(rx, handle)));
                }

                // Producer finished; surface the final reply.
                let frame = match handle.await {
                    Ok(Ok(reply)) => Event::default().event("result").data(
                        serde_json::to_string(&reply).unwrap_or_else(|_| "{}".into()),
                    ),
                    Ok(Err(e)) => error_frame(&e.to_string()),
                    Err(join_err) => {
                        warn!(error = %join_err, "turn task aborted mid-stream");
                        error_frame("turn task aborted")
                    }
                };
                Some((Ok(frame), SseState::Finished))
            }
            SseState::Finished => None,
        }
    })
}

/// `event: error` frame with a structured payload.
fn error_frame(message: &str) -> Event {
    Event::default().event("error").data(
        serde_json::to_string(&json!({ "type": "error", "message": message }))
            .unwrap_or_else(|_| "{}".into()),
    )
}

// ── Idempotent execution ──────────────────────────────────────────────────────

/// Stored-result shape kept in the idempotency cache.
fn reply_to_stored(result: Result<TurnReply>) -> Value {
    match result {
        Ok(reply) => json!({
            "status": 200,
            "body": serde_json::to_value(&reply).unwrap_or_else(|_| json!({})),
        }),
        Err(e) => {
            let (status, body) = error_payload(&e);
            json!({ "status": status.as_u16(), "body": body })
        }
    }
}

/// Run `task` under the idempotency store and shape the HTTP response.
async fn replay_or_run<F>(engine: &Engine, key: &str, fingerprint: &str, task: F) -> Response
where
    F: std::future::Future<Output = Value>,
{
    let outcome = engine.idempotency().execute(key, fingerprint, task).await;
    if outcome.conflict {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Idempotency key conflict.", "cached": true })),
        )
            .into_response();
    }
    stored_to_response(outcome.result, Some(key), outcome.cached)
}

/// Convert a stored `{status, body}` value back into a response.
fn stored_to_response(stored: Value, key: Option<&str>, cached: bool) -> Response {
    let status = stored
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = stored.get("body").cloned().unwrap_or_else(|| json!({}));

    if cached {
        if let Value::Object(ref mut map) = body {
            map.insert("cached".into(), Value::Bool(true));
            if let Some(key) = key {
                map.insert("idempotencyKey".into(), Value::String(key.to_owned()));
            }
        }
    }

    (status, Json(body)).into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Enforce the optional bearer token on `/v1/*` routes.
fn authorize(engine: &Engine, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let Some(ref token) = engine.options().api_token else {
        return Ok(());
    };
    let expected = format!("Bearer {token}");
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if supplied == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized." })),
        )
            .into_response())
    }
}

/// Whether the caller asked for an SSE stream.
fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// `Idempotency-Key` header wins over the body field.
fn idempotency_key(headers: &HeaderMap, body_key: Option<&str>) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .or_else(|| body_key.map(str::to_owned))
}

/// 400 with a human-readable reason.
fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

/// Map an [`AppError`] onto a status and JSON body.
fn error_payload(error: &AppError) -> (StatusCode, Value) {
    match error {
        AppError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
        AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
        AppError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "Agent turn failed.", "details": other.to_string() }),
        ),
    }
}
