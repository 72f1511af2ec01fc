//! Inbound message model and normalization.
//!
//! Every channel (HTTP clients, webhook adapters) produces an
//! [`InboundMessage`]. Validation and token normalization happen once, up
//! front, so the rest of the gateway operates on well-formed input.

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Conversation shape of the inbound message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-on-one conversation.
    #[default]
    Direct,
    /// Multi-party group conversation.
    Group,
    /// Broadcast channel.
    Channel,
}

impl ChatType {
    /// Wire token for the chat type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }
}

/// How inbound messages map to thread identities.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// Everything collapses onto a single main thread.
    Main,
    /// One thread per principal, across channels.
    #[default]
    PerPeer,
    /// One thread per (channel, principal) pair.
    PerChannelPeer,
    /// One thread per (channel, account, principal) triple.
    PerAccountChannelPeer,
}

impl RoutingMode {
    /// Parse a wire token into a routing mode.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] for unknown tokens.
    pub fn parse(token: &str) -> Result<Self> {
        match token.trim().to_lowercase().as_str() {
            "main" => Ok(Self::Main),
            "per-peer" => Ok(Self::PerPeer),
            "per-channel-peer" => Ok(Self::PerChannelPeer),
            "per-account-channel-peer" => Ok(Self::PerAccountChannelPeer),
            other => Err(AppError::Validation(format!(
                "unknown routing mode `{other}`"
            ))),
        }
    }

    /// Wire token for the routing mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::PerPeer => "per-peer",
            Self::PerChannelPeer => "per-channel-peer",
            Self::PerAccountChannelPeer => "per-account-channel-peer",
        }
    }
}

/// Inbound message as received from a channel, prior to normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Source channel token (e.g. `telegram`, `slack`, `http`).
    pub channel: String,
    /// Free-form user identifier from the channel.
    pub user_id: String,
    /// Message text; must be non-empty after trimming.
    pub text: String,
    /// Optional provider override (`claude`, `codex`, `pi`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Conversation shape; defaults to `direct`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<ChatType>,
    /// Peer identifier; falls back to `userId` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Account the channel connection belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Pre-resolved canonical identity, bypassing identity links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    /// Channel-native thread identifier (e.g. a Slack thread ts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_thread_id: Option<String>,
    /// Ordered MCP profile ids to attach to the thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_profile_ids: Option<Vec<String>>,
    /// Routing mode override for this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_mode: Option<RoutingMode>,
    /// Caller-supplied idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Raw MCP server configs are not accepted inbound; profiles only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<serde_json::Value>,
}

impl InboundMessage {
    /// Validate and normalize the message.
    ///
    /// Tokens (`channel`, `accountId`, `peerId`, `identityId`) are lowercased
    /// and trimmed; `mcpProfileIds` are deduplicated preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] naming the offending field when a
    /// required field is missing or an explicitly rejected field is present.
    pub fn normalized(&self) -> Result<NormalizedMessage> {
        if self.mcp_servers.is_some() {
            return Err(AppError::Validation(
                "field `mcpServers` is not accepted; use `mcpProfileIds`".into(),
            ));
        }

        let channel = normalize_token(&self.channel);
        if channel.is_empty() {
            return Err(AppError::Validation("field `channel` is required".into()));
        }

        let user_id = self.user_id.trim().to_owned();
        if user_id.is_empty() {
            return Err(AppError::Validation("field `userId` is required".into()));
        }

        let text = self.text.trim().to_owned();
        if text.is_empty() {
            return Err(AppError::Validation(
                "field `text` must not be blank".into(),
            ));
        }

        if let Some(ref ids) = self.mcp_profile_ids {
            if ids.is_empty() {
                return Err(AppError::Validation(
                    "field `mcpProfileIds` must be a non-empty array when present".into(),
                ));
            }
        }

        Ok(NormalizedMessage {
            channel,
            user_id: user_id.clone(),
            text,
            provider: self.provider.as_deref().map(normalize_token),
            chat_type: self.chat_type.unwrap_or_default(),
            peer_id: match self.peer_id.as_deref().map(normalize_token) {
                Some(p) if !p.is_empty() => p,
                _ => {
                    let fallback = normalize_token(&user_id);
                    if fallback.is_empty() {
                        "unknown".to_owned()
                    } else {
                        fallback
                    }
                }
            },
            account_id: match self.account_id.as_deref().map(normalize_token) {
                Some(a) if !a.is_empty() => a,
                _ => "default".to_owned(),
            },
            identity_id: self
                .identity_id
                .as_deref()
                .map(normalize_token)
                .filter(|s| !s.is_empty()),
            channel_thread_id: self
                .channel_thread_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            mcp_profile_ids: self.mcp_profile_ids.as_deref().map(dedup_ordered),
            routing_mode: self.routing_mode,
            idempotency_key: self
                .idempotency_key
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
        })
    }
}

/// Inbound message after validation and token normalization.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    /// Lowercased channel token.
    pub channel: String,
    /// Trimmed user identifier (original casing preserved).
    pub user_id: String,
    /// Trimmed message text, guaranteed non-empty.
    pub text: String,
    /// Lowercased provider token, if any.
    pub provider: Option<String>,
    /// Conversation shape.
    pub chat_type: ChatType,
    /// Lowercased peer token with `userId`/`"unknown"` fallback applied.
    pub peer_id: String,
    /// Lowercased account token, `"default"` when absent.
    pub account_id: String,
    /// Lowercased canonical identity, if supplied.
    pub identity_id: Option<String>,
    /// Channel-native thread identifier, if supplied.
    pub channel_thread_id: Option<String>,
    /// Ordered, deduplicated MCP profile ids.
    pub mcp_profile_ids: Option<Vec<String>>,
    /// Routing mode override for this message.
    pub routing_mode: Option<RoutingMode>,
    /// Caller-supplied idempotency key.
    pub idempotency_key: Option<String>,
}

/// Lowercase and trim a channel/account/peer/identity token.
fn normalize_token(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Deduplicate a list of ids preserving first-occurrence order.
fn dedup_ordered(ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
