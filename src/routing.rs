//! Deterministic thread identity resolution.
//!
//! `resolve_thread_id` is a pure function of the normalized routing fields:
//! equal inputs always produce equal thread ids, so a thread's identity
//! survives restarts and is independent of request interleaving.
//!
//! Identity links collapse the same human across channels: each link maps a
//! canonical id to a set of tokens matched against `peerId` and
//! `channel:peerId`. Link order is configuration insertion order, so
//! resolution is deterministic for a given configuration.

use crate::models::message::{ChatType, NormalizedMessage, RoutingMode};

/// One identity link: a canonical id plus the tokens that map to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityLink {
    /// Canonical principal id used in thread identities.
    pub canonical: String,
    /// Tokens matched against `peerId` and `channel:peerId`.
    pub tokens: Vec<String>,
}

/// Resolve the stable thread id for a normalized message.
///
/// Group and channel chats ignore the routing mode and always key on
/// `(channel, chatType, peerId)`, extended with the channel-native thread id
/// when present. Direct chats key on the principal according to the routing
/// mode.
#[must_use]
pub fn resolve_thread_id(
    msg: &NormalizedMessage,
    routing_mode: RoutingMode,
    identity_links: &[IdentityLink],
) -> String {
    let channel = &msg.channel;
    let peer = &msg.peer_id;

    if matches!(msg.chat_type, ChatType::Group | ChatType::Channel) {
        let mut id = format!("agent:main:{channel}:{}:{peer}", msg.chat_type.as_str());
        if let Some(ref ts) = msg.channel_thread_id {
            id.push_str(":thread:");
            id.push_str(ts);
        }
        return id;
    }

    let principal = msg
        .identity_id
        .clone()
        .or_else(|| match_identity_link(identity_links, channel, peer))
        .unwrap_or_else(|| peer.clone());

    let mut id = match routing_mode {
        RoutingMode::Main => return "agent:main:main".to_owned(),
        RoutingMode::PerPeer => format!("agent:main:direct:{principal}"),
        RoutingMode::PerChannelPeer => format!("agent:main:{channel}:direct:{principal}"),
        RoutingMode::PerAccountChannelPeer => {
            format!("agent:main:{channel}:{}:direct:{principal}", msg.account_id)
        }
    };

    if !matches!(routing_mode, RoutingMode::PerPeer) {
        if let Some(ref ts) = msg.channel_thread_id {
            id.push_str(":thread:");
            id.push_str(ts);
        }
    }

    id
}

/// Find the first identity link whose token set matches the peer.
///
/// Tokens are compared against both the bare `peerId` and the qualified
/// `channel:peerId` form. The first matching link wins.
#[must_use]
pub fn match_identity_link(
    links: &[IdentityLink],
    channel: &str,
    peer_id: &str,
) -> Option<String> {
    let qualified = format!("{channel}:{peer_id}");
    links
        .iter()
        .find(|link| {
            link.tokens
                .iter()
                .any(|t| t == peer_id || *t == qualified)
        })
        .map(|link| link.canonical.clone())
}
