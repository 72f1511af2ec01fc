//! Unit tests for the notification → `AgentEvent` translator.

use flint_gateway::models::event::AgentEvent;
use flint_gateway::protocol::peer::AgentNotification;
use flint_gateway::protocol::translator::EventTranslator;
use serde_json::json;

fn note(method: &str, params: serde_json::Value) -> AgentNotification {
    AgentNotification {
        method: method.to_owned(),
        params,
    }
}

#[test]
fn agent_message_delta_becomes_text() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note("item/agentMessage/delta", json!({ "delta": "hel" })));
    assert_eq!(event, Some(AgentEvent::Text { delta: "hel".into() }));
}

#[test]
fn reasoning_delta_becomes_reasoning() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note("item/reasoning/textDelta", json!({ "delta": "thinking" })));
    assert_eq!(
        event,
        Some(AgentEvent::Reasoning {
            delta: "thinking".into()
        })
    );
}

#[test]
fn command_execution_start_maps_to_bash() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note(
        "item/started",
        json!({ "item": {
            "id": "it-1",
            "type": "commandExecution",
            "command": "ls -la",
            "cwd": "/tmp",
        }}),
    ));
    let Some(AgentEvent::ToolStart { id, name, input }) = event else {
        panic!("expected ToolStart, got {event:?}");
    };
    assert_eq!(id.as_deref(), Some("it-1"));
    assert_eq!(name, "Bash");
    let input = input.expect("input present");
    assert_eq!(input["command"], "ls -la");
    assert_eq!(input["cwd"], "/tmp");
}

#[test]
fn file_change_add_maps_to_write() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note(
        "item/started",
        json!({ "item": {
            "type": "fileChange",
            "changes": [{ "kind": "add", "path": "src/new.rs" }],
        }}),
    ));
    let Some(AgentEvent::ToolStart { name, input, .. }) = event else {
        panic!("expected ToolStart, got {event:?}");
    };
    assert_eq!(name, "Write");
    assert_eq!(input.expect("input")["file_path"], "src/new.rs");
}

#[test]
fn file_change_update_maps_to_edit() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note(
        "item/started",
        json!({ "item": {
            "type": "fileChange",
            "changes": [{ "kind": "update", "path": "src/lib.rs" }],
        }}),
    ));
    let Some(AgentEvent::ToolStart { name, .. }) = event else {
        panic!("expected ToolStart, got {event:?}");
    };
    assert_eq!(name, "Edit");
}

#[test]
fn mcp_tool_call_uses_tool_name_and_arguments() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note(
        "item/started",
        json!({ "item": {
            "type": "mcpToolCall",
            "tool": "memory_search",
            "arguments": { "query": "gateway" },
        }}),
    ));
    let Some(AgentEvent::ToolStart { name, input, .. }) = event else {
        panic!("expected ToolStart, got {event:?}");
    };
    assert_eq!(name, "memory_search");
    assert_eq!(input.expect("input")["query"], "gateway");
}

#[test]
fn command_execution_completion_reports_exit_status() {
    let mut tr = EventTranslator::new();

    let failed = tr.translate(&note(
        "item/completed",
        json!({ "item": {
            "type": "commandExecution",
            "exitCode": 2,
            "aggregatedOutput": "boom",
        }}),
    ));
    let Some(AgentEvent::ToolEnd { result, is_error, .. }) = failed else {
        panic!("expected ToolEnd, got {failed:?}");
    };
    assert!(is_error);
    assert_eq!(result, Some(json!("boom")));

    let ok = tr.translate(&note(
        "item/completed",
        json!({ "item": { "type": "commandExecution", "exitCode": 0 }}),
    ));
    let Some(AgentEvent::ToolEnd { is_error, .. }) = ok else {
        panic!("expected ToolEnd, got {ok:?}");
    };
    assert!(!is_error);
}

#[test]
fn file_change_completion_is_never_an_error() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note(
        "item/completed",
        json!({ "item": { "type": "fileChange" }}),
    ));
    assert_eq!(
        event,
        Some(AgentEvent::ToolEnd {
            id: None,
            result: None,
            is_error: false
        })
    );
}

#[test]
fn mcp_tool_completion_carries_result() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note(
        "item/completed",
        json!({ "item": {
            "type": "mcpToolCall",
            "result": { "hits": 3 },
        }}),
    ));
    let Some(AgentEvent::ToolEnd { result, is_error, .. }) = event else {
        panic!("expected ToolEnd, got {event:?}");
    };
    assert!(!is_error);
    assert_eq!(result, Some(json!({ "hits": 3 })));
}

#[test]
fn turn_started_records_the_turn_id() {
    let mut tr = EventTranslator::new();
    let event = tr.translate(&note(
        "turn/started",
        json!({ "turn": { "id": "turn-9" }}),
    ));
    assert!(event.is_none(), "turn/started emits no event");
    assert_eq!(tr.current_turn_id(), Some("turn-9"));
}

#[test]
fn turn_completed_maps_status() {
    let mut tr = EventTranslator::new();

    let done = tr.translate(&note(
        "turn/completed",
        json!({ "turn": { "status": "completed", "usage": { "inputTokens": 12 }}}),
    ));
    assert_eq!(
        done,
        Some(AgentEvent::Done {
            usage: Some(json!({ "inputTokens": 12 }))
        })
    );

    let failed = tr.translate(&note(
        "turn/completed",
        json!({ "turn": { "status": "failed", "error": { "message": "model exploded" }}}),
    ));
    assert_eq!(
        failed,
        Some(AgentEvent::Error {
            message: "model exploded".into()
        })
    );
}

#[test]
fn approval_requests_become_activity_beats() {
    let mut tr = EventTranslator::new();
    for method in [
        "item/commandExecution/requestApproval",
        "item/fileChange/requestApproval",
    ] {
        assert_eq!(
            tr.translate(&note(method, json!({}))),
            Some(AgentEvent::Activity)
        );
    }
}

#[test]
fn output_deltas_and_unknown_methods_are_ignored() {
    let mut tr = EventTranslator::new();
    assert!(tr
        .translate(&note("item/commandExecution/outputDelta", json!({ "delta": "…" })))
        .is_none());
    assert!(tr.translate(&note("something/else", json!({}))).is_none());
}

#[test]
fn events_serialize_with_snake_case_tags() {
    let event = AgentEvent::ToolEnd {
        id: Some("it-1".into()),
        result: None,
        is_error: true,
    };
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["type"], "tool_end");
    assert_eq!(value["isError"], true);
    assert_eq!(AgentEvent::Activity.kind(), "activity");
}
