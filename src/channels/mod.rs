//! Channel adapter contract.
//!
//! Adapters plug concrete channels (Slack webhooks, and so on) into the
//! gateway by name under `/webhooks/{name}`. The gateway verifies, parses,
//! deduplicates, acknowledges, processes, and finally delivers the reply
//! through the adapter. Adapter implementations live outside the core; the
//! gateway depends only on this trait.

use std::future::Future;
use std::pin::Pin;

use axum::http::HeaderMap;
use serde_json::Value;

use crate::models::event::AgentEvent;
use crate::models::message::InboundMessage;
use crate::Result;

/// Boxed future alias in the adapter contract.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of parsing one webhook delivery.
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    /// Endpoint verification challenge; respond with `response` verbatim.
    Challenge {
        /// Body to echo back to the channel.
        response: String,
    },
    /// A user message to route through the gateway.
    Message {
        /// Parsed inbound message.
        message: Box<InboundMessage>,
        /// Opaque adapter context threaded through acknowledge/deliver.
        meta: Value,
        /// Channel-side event id for the 5-minute dedup window.
        event_id: Option<String>,
    },
    /// Delivery carries nothing actionable (bot echoes, edits, …).
    Ignore,
}

/// Contract between the gateway and one named channel adapter.
pub trait ChannelAdapter: Send + Sync {
    /// Name the adapter is registered under (`/webhooks/{name}`).
    fn name(&self) -> &str;

    /// Authenticate the delivery (signature check). `false` rejects with 401.
    fn verify_request(&self, headers: &HeaderMap, raw_body: &[u8]) -> bool;

    /// Parse the raw delivery into a [`WebhookOutcome`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`](crate::AppError::Validation) for
    /// bodies the channel should never have sent.
    fn parse_webhook(&self, raw_body: &[u8], headers: &HeaderMap) -> Result<WebhookOutcome>;

    /// Acknowledge receipt before processing (typing indicator, 200 early).
    fn acknowledge<'a>(&'a self, meta: &'a Value) -> BoxFuture<'a, ()>;

    /// Observe translated agent events for live status updates.
    ///
    /// Default implementation ignores events.
    fn on_agent_event<'a>(&'a self, _meta: &'a Value, _event: &'a AgentEvent) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Deliver the gateway reply (or a formatted error) to the channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel rejects the delivery; the gateway
    /// logs and drops it.
    fn deliver_reply<'a>(&'a self, meta: &'a Value, reply: &'a str) -> BoxFuture<'a, Result<()>>;
}
