//! Unit tests for MCP profile composition.

use flint_gateway::config::Settings;
use flint_gateway::profiles::{compose, memory_server_config, merge_memory_server};
use flint_gateway::AppError;
use serde_json::json;

fn settings(profiles_json: serde_json::Value) -> Settings {
    let raw = json!({ "mcpProfiles": profiles_json }).to_string();
    Settings::from_json_str(&raw).expect("settings must parse")
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

#[test]
fn single_profile_composes_its_servers() {
    let settings = settings(json!({
        "tools": { "servers": { "files": { "command": "files-mcp" } } },
    }));

    let composed = compose(&ids(&["tools"]), &settings).expect("compose");
    assert_eq!(composed.len(), 1);
    assert_eq!(composed["files"]["command"], "files-mcp");
}

#[test]
fn referenced_profiles_expand_depth_first() {
    let settings = settings(json!({
        "base": { "servers": { "files": { "command": "files-mcp" } } },
        "full": {
            "profiles": ["base"],
            "servers": { "search": { "url": "https://mcp.example.com" } },
        },
    }));

    let composed = compose(&ids(&["full"]), &settings).expect("compose");
    let aliases: Vec<&String> = composed.keys().collect();
    assert_eq!(aliases, ["files", "search"], "referenced servers come first");
}

#[test]
fn diamond_references_expand_once() {
    let settings = settings(json!({
        "base": { "servers": { "files": {} } },
        "left": { "profiles": ["base"] },
        "right": { "profiles": ["base"] },
        "top": { "profiles": ["left", "right"] },
    }));

    let composed = compose(&ids(&["top"]), &settings).expect("compose");
    assert_eq!(composed.len(), 1, "shared base must not collide with itself");
}

#[test]
fn duplicate_alias_across_profiles_is_a_collision() {
    let settings = settings(json!({
        "a": { "servers": { "files": { "command": "one" } } },
        "b": { "servers": { "files": { "command": "two" } } },
    }));

    match compose(&ids(&["a", "b"]), &settings) {
        Err(AppError::Config(msg)) => assert!(msg.contains("collision"), "got: {msg}"),
        other => panic!("expected collision error, got {other:?}"),
    }
}

#[test]
fn reference_cycles_are_rejected() {
    let settings = settings(json!({
        "a": { "profiles": ["b"] },
        "b": { "profiles": ["a"] },
    }));

    match compose(&ids(&["a"]), &settings) {
        Err(AppError::Config(msg)) => assert!(msg.contains("cycle"), "got: {msg}"),
        other => panic!("expected cycle error, got {other:?}"),
    }
}

#[test]
fn unknown_profile_id_is_an_error() {
    let settings = settings(json!({}));
    match compose(&ids(&["ghost"]), &settings) {
        Err(AppError::Config(msg)) => assert!(msg.contains("ghost"), "got: {msg}"),
        other => panic!("expected unknown-profile error, got {other:?}"),
    }
}

#[test]
fn empty_composition_is_empty() {
    let settings = settings(json!({}));
    let composed = compose(&[], &settings).expect("compose");
    assert!(composed.is_empty());
}

// ── Memory server merge ───────────────────────────────────────────────────────

#[test]
fn memory_merges_under_its_own_alias_when_free() {
    let mut servers = serde_json::Map::new();
    let alias = merge_memory_server(&mut servers, memory_server_config());
    assert_eq!(alias, "memory");
    assert!(servers.contains_key("memory"));
}

#[test]
fn memory_never_replaces_a_user_alias() {
    let mut servers = serde_json::Map::new();
    servers.insert("memory".to_owned(), json!({ "command": "user-memory" }));
    servers.insert("memory_1".to_owned(), json!({ "command": "another" }));

    let alias = merge_memory_server(&mut servers, memory_server_config());
    assert_eq!(alias, "memory_2");
    assert_eq!(servers["memory"]["command"], "user-memory");
    assert_eq!(servers["memory_2"]["command"], "flint-memory");
}
