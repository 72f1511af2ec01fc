//! Uniform agent event stream type.
//!
//! Every Agent Protocol notification the gateway understands is translated
//! into one of these variants before reaching callers (reply accumulation,
//! SSE streams, channel adapters).

use serde::{Deserialize, Serialize};

/// One event on a turn's translated stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant text delta.
    Text {
        /// Appended text fragment.
        delta: String,
    },
    /// Reasoning text delta.
    Reasoning {
        /// Appended reasoning fragment.
        delta: String,
    },
    /// A tool invocation started.
    #[serde(rename_all = "camelCase")]
    ToolStart {
        /// Item identifier, when the agent supplied one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Tool name (`Bash`, `Write`, `Edit`, or the MCP tool name).
        name: String,
        /// Tool input payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
    },
    /// A tool invocation completed.
    #[serde(rename_all = "camelCase")]
    ToolEnd {
        /// Item identifier, when the agent supplied one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Tool output payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// Whether the tool reported failure.
        is_error: bool,
    },
    /// Liveness beat with no payload (approval round-trips and the like).
    Activity,
    /// Turn completed successfully.
    Done {
        /// Token usage reported by the agent, when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<serde_json::Value>,
    },
    /// Turn failed.
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

impl AgentEvent {
    /// SSE event name for this variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Activity => "activity",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event terminates the turn stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
