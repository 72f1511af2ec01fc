//! Agent Protocol notifications → [`AgentEvent`] translation.
//!
//! The translator is stateful only with respect to the current turn id and
//! is re-created per turn.
//!
//! # Known notifications
//!
//! | Method                          | Maps to                              |
//! |---------------------------------|--------------------------------------|
//! | `item/agentMessage/delta`       | [`AgentEvent::Text`]                 |
//! | `item/reasoning/textDelta`      | [`AgentEvent::Reasoning`]            |
//! | `item/started`                  | [`AgentEvent::ToolStart`] (by item)  |
//! | `item/completed`                | [`AgentEvent::ToolEnd`] (by item)    |
//! | `turn/started`                  | records the turn id, emits nothing   |
//! | `turn/completed`                | [`AgentEvent::Done`] / [`AgentEvent::Error`] |
//! | `item/*/requestApproval`        | [`AgentEvent::Activity`]             |
//! | `item/*/outputDelta`            | ignored                              |

use serde_json::Value;

use crate::models::event::AgentEvent;
use crate::protocol::peer::AgentNotification;

/// Per-turn notification translator.
#[derive(Debug, Default)]
pub struct EventTranslator {
    current_turn_id: Option<String>,
}

impl EventTranslator {
    /// Fresh translator with no turn recorded yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn id recorded from the last `turn/started` notification.
    #[must_use]
    pub fn current_turn_id(&self) -> Option<&str> {
        self.current_turn_id.as_deref()
    }

    /// Translate one notification; `None` when it carries no event.
    pub fn translate(&mut self, notification: &AgentNotification) -> Option<AgentEvent> {
        let params = &notification.params;

        match notification.method.as_str() {
            "item/agentMessage/delta" => Some(AgentEvent::Text {
                delta: str_field(params, "delta")?.to_owned(),
            }),
            "item/reasoning/textDelta" => Some(AgentEvent::Reasoning {
                delta: str_field(params, "delta")?.to_owned(),
            }),
            "item/started" => translate_item_started(params.get("item")?),
            "item/completed" => translate_item_completed(params.get("item")?),
            "turn/started" => {
                self.current_turn_id = params
                    .get("turn")
                    .and_then(|t| t.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                None
            }
            "turn/completed" => Some(translate_turn_completed(params)),
            method if method.ends_with("/requestApproval") => Some(AgentEvent::Activity),
            method if method.ends_with("/outputDelta") => None,
            _ => None,
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Translate an `item/started` notification by item type.
fn translate_item_started(item: &Value) -> Option<AgentEvent> {
    let id = str_field(item, "id").map(str::to_owned);

    match str_field(item, "type")? {
        "commandExecution" => Some(AgentEvent::ToolStart {
            id,
            name: "Bash".to_owned(),
            input: Some(serde_json::json!({
                "command": item.get("command").cloned().unwrap_or(Value::Null),
                "cwd": item.get("cwd").cloned().unwrap_or(Value::Null),
            })),
        }),
        "fileChange" => {
            let changes = item.get("changes").and_then(Value::as_array);
            let first = changes.and_then(|c| c.first());
            let name = if first.and_then(|c| str_field(c, "kind")) == Some("add") {
                "Write"
            } else {
                "Edit"
            };
            let file_path = first
                .and_then(|c| c.get("path"))
                .cloned()
                .unwrap_or(Value::Null);
            Some(AgentEvent::ToolStart {
                id,
                name: name.to_owned(),
                input: Some(serde_json::json!({ "file_path": file_path })),
            })
        }
        "mcpToolCall" => Some(AgentEvent::ToolStart {
            id,
            name: str_field(item, "tool").unwrap_or("mcp").to_owned(),
            input: item.get("arguments").cloned(),
        }),
        _ => None,
    }
}

/// Translate an `item/completed` notification by item type.
fn translate_item_completed(item: &Value) -> Option<AgentEvent> {
    let id = str_field(item, "id").map(str::to_owned);

    match str_field(item, "type")? {
        "commandExecution" => {
            let exit_code = item.get("exitCode").and_then(Value::as_i64).unwrap_or(0);
            Some(AgentEvent::ToolEnd {
                id,
                result: item.get("aggregatedOutput").cloned(),
                is_error: exit_code != 0,
            })
        }
        "fileChange" => Some(AgentEvent::ToolEnd {
            id,
            result: None,
            is_error: false,
        }),
        "mcpToolCall" => Some(AgentEvent::ToolEnd {
            id,
            result: item.get("result").cloned(),
            is_error: false,
        }),
        _ => None,
    }
}

/// Translate `turn/completed` into `Done` or `Error` by status.
fn translate_turn_completed(params: &Value) -> AgentEvent {
    let turn = params.get("turn");
    let status = turn
        .and_then(|t| t.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("completed");

    if status == "failed" {
        let message = turn
            .and_then(|t| t.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("turn failed")
            .to_owned();
        AgentEvent::Error { message }
    } else {
        AgentEvent::Done {
            usage: turn.and_then(|t| t.get("usage")).cloned(),
        }
    }
}

/// String field accessor on a JSON object.
fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
