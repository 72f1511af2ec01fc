//! Unit tests for provider matching and wire-parameter mapping.

use flint_gateway::protocol::provider::{
    thread_resume_params, thread_start_params, turn_start_params, Provider, ThreadStartOptions,
};
use serde_json::{json, Map, Value};

fn servers(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(alias, config)| ((*alias).to_owned(), config.clone()))
        .collect()
}

// ── Hint matching ─────────────────────────────────────────────────────────────

#[test]
fn exact_hints_match_case_insensitively() {
    assert_eq!(Provider::match_hint("claude"), Some(Provider::Claude));
    assert_eq!(Provider::match_hint("CODEX"), Some(Provider::Codex));
    assert_eq!(Provider::match_hint("Pi"), Some(Provider::Pi));
}

#[test]
fn unique_prefixes_match() {
    assert_eq!(Provider::match_hint("cl"), Some(Provider::Claude));
    assert_eq!(Provider::match_hint("co"), Some(Provider::Codex));
}

#[test]
fn ambiguous_or_unknown_prefixes_do_not_match() {
    assert_eq!(Provider::match_hint("c"), None, "claude/codex share `c`");
    assert_eq!(Provider::match_hint("gemini"), None);
    assert_eq!(Provider::match_hint(""), None);
}

#[test]
fn parse_rejects_unknown_tokens() {
    assert!(Provider::parse("claude").is_ok());
    assert!(Provider::parse("acme").is_err());
}

// ── Codex wire mapping ────────────────────────────────────────────────────────

/// Codex flattens MCP servers into dotted `config` keys and
/// never sends `mcpServers`.
#[test]
fn codex_flattens_servers_into_dotted_config() {
    let options = ThreadStartOptions {
        model: Some("gpt-5".to_owned()),
        mcp_servers: servers(&[(
            "files",
            json!({ "command": "files-mcp", "args": ["--root", "/tmp"], "env": {} }),
        )]),
        approval_policy: Some("on-request".to_owned()),
        sandbox_mode: Some("workspace-write".to_owned()),
        ..ThreadStartOptions::default()
    };

    let params = thread_start_params(Provider::Codex, &options);

    assert!(params.get("mcpServers").is_none(), "no mcpServers for codex");
    let config = params.get("config").expect("config map present");
    assert_eq!(config["mcp_servers.files.command"], "files-mcp");
    assert_eq!(config["mcp_servers.files.args"], json!(["--root", "/tmp"]));
    assert_eq!(params["approvalPolicy"], "on-request");
    assert_eq!(params["sandbox"], "workspace-write");
    assert_eq!(params["model"], "gpt-5");
}

#[test]
fn codex_renames_http_server_fields() {
    let options = ThreadStartOptions {
        mcp_servers: servers(&[(
            "search",
            json!({
                "url": "https://mcp.example.com",
                "headers": { "X-Org": "flint" },
                "envHeaders": { "X-Token": "TOKEN_VAR" },
                "bearerTokenEnvVar": "SEARCH_TOKEN",
            }),
        )]),
        ..ThreadStartOptions::default()
    };

    let params = thread_start_params(Provider::Codex, &options);
    let config = params.get("config").expect("config map present");

    assert_eq!(config["mcp_servers.search.url"], "https://mcp.example.com");
    assert_eq!(config["mcp_servers.search.http_headers"]["X-Org"], "flint");
    assert_eq!(
        config["mcp_servers.search.env_http_headers"]["X-Token"],
        "TOKEN_VAR"
    );
    assert_eq!(
        config["mcp_servers.search.bearer_token_env_var"],
        "SEARCH_TOKEN"
    );
    assert!(
        config.get("mcp_servers.search.headers").is_none(),
        "camelCase field must be renamed, not duplicated"
    );
}

#[test]
fn codex_stdio_servers_keep_only_process_fields() {
    let options = ThreadStartOptions {
        mcp_servers: servers(&[(
            "local",
            json!({ "command": "tool", "cwd": "/srv", "unrelated": true }),
        )]),
        ..ThreadStartOptions::default()
    };

    let params = thread_start_params(Provider::Codex, &options);
    let config = params.get("config").expect("config map present");

    assert_eq!(config["mcp_servers.local.command"], "tool");
    assert_eq!(config["mcp_servers.local.cwd"], "/srv");
    assert!(config.get("mcp_servers.local.unrelated").is_none());
}

#[test]
fn codex_maps_system_prompts_to_instruction_fields() {
    let options = ThreadStartOptions {
        system_prompt: Some("base".to_owned()),
        system_prompt_append: Some("extra".to_owned()),
        ..ThreadStartOptions::default()
    };

    let params = thread_start_params(Provider::Codex, &options);
    assert_eq!(params["baseInstructions"], "base");
    assert_eq!(params["developerInstructions"], "extra");
    assert!(params.get("systemPromptAppend").is_none());
}

// ── Non-Codex wire mapping ────────────────────────────────────────────────────

/// `approvalPolicy`/`sandbox` never reach non-Codex providers.
#[test]
fn claude_passes_servers_through_and_drops_codex_fields() {
    let options = ThreadStartOptions {
        system_prompt_append: Some("extra".to_owned()),
        mcp_servers: servers(&[("files", json!({ "command": "files-mcp" }))]),
        approval_policy: Some("on-request".to_owned()),
        sandbox_mode: Some("workspace-write".to_owned()),
        ..ThreadStartOptions::default()
    };

    let params = thread_start_params(Provider::Claude, &options);

    assert!(params.get("approvalPolicy").is_none());
    assert!(params.get("sandbox").is_none());
    assert!(params.get("config").is_none());
    assert_eq!(params["systemPromptAppend"], "extra");
    assert_eq!(params["mcpServers"]["files"]["command"], "files-mcp");
}

#[test]
fn pi_forwards_the_opaque_config_map() {
    let options = ThreadStartOptions {
        config: Some(json!({ "temperature": 0.2 })),
        ..ThreadStartOptions::default()
    };

    let pi = thread_start_params(Provider::Pi, &options);
    assert_eq!(pi["config"]["temperature"], 0.2);

    let claude = thread_start_params(Provider::Claude, &options);
    assert!(claude.get("config").is_none());
}

// ── Resume and turn params ────────────────────────────────────────────────────

#[test]
fn resume_params_add_the_agent_thread_id() {
    let options = ThreadStartOptions::default();
    let params = thread_resume_params(Provider::Claude, "sess-42", &options);
    assert_eq!(params["threadId"], "sess-42");
}

#[test]
fn turn_start_params_carry_text_input() {
    let params = turn_start_params("sess-42", "hello", Some("sonnet"));
    assert_eq!(params["threadId"], "sess-42");
    assert_eq!(params["input"][0]["type"], "text");
    assert_eq!(params["input"][0]["text"], "hello");
    assert_eq!(params["model"], "sonnet");

    let no_model = turn_start_params("sess-42", "hello", None);
    assert!(no_model.get("model").is_none());
}
