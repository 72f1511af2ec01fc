//! Thread record model and timestamp helpers.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::message::{ChatType, RoutingMode};

/// Persisted record for one thread identity.
///
/// A record exists iff at least one turn has successfully created an agent
/// session for its `thread_id`. `provider_thread_id` is the agent's own
/// session identifier and is never exposed to external callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    /// Stable thread identity (pure function of the routing fields).
    pub thread_id: String,
    /// Routing mode the thread was created under.
    pub routing_mode: RoutingMode,
    /// Provider driving the thread.
    pub provider: String,
    /// Agent-side session identifier; opaque, internal only.
    pub provider_thread_id: String,
    /// Model override, when one was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// MCP profile ids attached to the thread.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_profile_ids: Vec<String>,
    /// Source channel token.
    pub channel: String,
    /// User that opened the thread.
    pub user_id: String,
    /// Conversation shape.
    pub chat_type: ChatType,
    /// Peer token.
    pub peer_id: String,
    /// Account token, when not `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Canonical identity, when one was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    /// Channel-native thread identifier, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_thread_id: Option<String>,
    /// Creation instant, fixed-width ISO-8601 UTC.
    pub created_at: String,
    /// Last-completed-turn instant; `updated_at >= created_at`.
    pub updated_at: String,
}

impl ThreadRecord {
    /// Public projection of the record, without `provider_thread_id`.
    #[must_use]
    pub fn public(&self) -> PublicThreadRecord {
        PublicThreadRecord {
            thread_id: self.thread_id.clone(),
            routing_mode: self.routing_mode,
            provider: self.provider.clone(),
            model: self.model.clone(),
            mcp_profile_ids: self.mcp_profile_ids.clone(),
            channel: self.channel.clone(),
            user_id: self.user_id.clone(),
            chat_type: self.chat_type,
            peer_id: self.peer_id.clone(),
            account_id: self.account_id.clone(),
            identity_id: self.identity_id.clone(),
            channel_thread_id: self.channel_thread_id.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Externally visible thread record. Excludes the agent-side session id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicThreadRecord {
    /// Stable thread identity.
    pub thread_id: String,
    /// Routing mode the thread was created under.
    pub routing_mode: RoutingMode,
    /// Provider driving the thread.
    pub provider: String,
    /// Model override, when one was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// MCP profile ids attached to the thread.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_profile_ids: Vec<String>,
    /// Source channel token.
    pub channel: String,
    /// User that opened the thread.
    pub user_id: String,
    /// Conversation shape.
    pub chat_type: ChatType,
    /// Peer token.
    pub peer_id: String,
    /// Account token, when not `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Canonical identity, when one was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    /// Channel-native thread identifier, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_thread_id: Option<String>,
    /// Creation instant.
    pub created_at: String,
    /// Last-completed-turn instant.
    pub updated_at: String,
}

/// Current instant as a fixed-width ISO-8601 UTC string.
///
/// Millisecond precision with a trailing `Z`, so timestamps sort
/// lexicographically in chronological order.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored ISO-8601 timestamp into epoch milliseconds.
///
/// Returns `None` for strings that do not parse; callers treat such records
/// as never expiring rather than failing the request.
#[must_use]
pub fn parse_iso_ms(ts: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
