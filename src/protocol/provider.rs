//! Provider enumeration and wire-parameter mapping.
//!
//! Providers are a closed enum plus a per-variant strategy for mapping
//! thread options onto Agent Protocol wire fields. The Codex-shaped
//! provider flattens MCP server configs into dotted `config` keys and is
//! the only provider that accepts `approvalPolicy`/`sandbox`.

use std::fmt::{Display, Formatter};

use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// Supported agent providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Claude-family agent.
    #[default]
    Claude,
    /// Codex-shaped agent (dotted-config MCP wiring, approval policy).
    Codex,
    /// Pi agent (accepts a pass-through `config` map on turns).
    Pi,
}

impl Provider {
    /// All providers, in hint-matching order.
    pub const ALL: &'static [Self] = &[Self::Claude, Self::Codex, Self::Pi];

    /// Lowercase hint token for the provider.
    #[must_use]
    pub fn hint(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Pi => "pi",
        }
    }

    /// Default executable launched for this provider.
    #[must_use]
    pub fn default_command(self) -> &'static str {
        match self {
            Self::Claude => "claude-agent",
            Self::Codex => "codex-agent",
            Self::Pi => "pi-agent",
        }
    }

    /// Parse an exact (case-insensitive) provider token.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] for unknown tokens.
    pub fn parse(token: &str) -> Result<Self> {
        let lowered = token.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.hint() == lowered)
            .ok_or_else(|| AppError::Validation(format!("unknown provider `{token}`")))
    }

    /// Match a token by equality or unique case-insensitive prefix.
    ///
    /// Used by reset-command parsing: `/new cla` matches `claude` because no
    /// other hint starts with `cla`; an ambiguous prefix matches nothing.
    #[must_use]
    pub fn match_hint(token: &str) -> Option<Self> {
        let lowered = token.trim().to_lowercase();
        if lowered.is_empty() {
            return None;
        }
        if let Some(exact) = Self::ALL.iter().copied().find(|p| p.hint() == lowered) {
            return Some(exact);
        }
        let mut matches = Self::ALL
            .iter()
            .copied()
            .filter(|p| p.hint().starts_with(&lowered));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.hint())
    }
}

/// Options carried into `thread/start` / `thread/resume`.
#[derive(Debug, Clone, Default)]
pub struct ThreadStartOptions {
    /// Model to start the thread with; provider default when absent.
    pub model: Option<String>,
    /// Working directory for the agent session.
    pub cwd: Option<String>,
    /// Full system prompt replacement.
    pub system_prompt: Option<String>,
    /// Text appended to the provider's own system prompt.
    pub system_prompt_append: Option<String>,
    /// Composed MCP server configs, alias → config object.
    pub mcp_servers: Map<String, Value>,
    /// Codex approval policy; rejected for other providers.
    pub approval_policy: Option<String>,
    /// Codex sandbox mode; rejected for other providers.
    pub sandbox_mode: Option<String>,
    /// Opaque pass-through config map (Pi only).
    pub config: Option<Value>,
}

/// Build `thread/start` params for `provider`.
#[must_use]
pub fn thread_start_params(provider: Provider, options: &ThreadStartOptions) -> Value {
    let mut params = Map::new();

    if let Some(ref model) = options.model {
        params.insert("model".into(), Value::String(model.clone()));
    }
    if let Some(ref cwd) = options.cwd {
        params.insert("cwd".into(), Value::String(cwd.clone()));
    }

    match provider {
        Provider::Codex => {
            if let Some(ref prompt) = options.system_prompt {
                params.insert("baseInstructions".into(), Value::String(prompt.clone()));
            }
            if let Some(ref append) = options.system_prompt_append {
                params.insert(
                    "developerInstructions".into(),
                    Value::String(append.clone()),
                );
            }
            if !options.mcp_servers.is_empty() {
                params.insert(
                    "config".into(),
                    Value::Object(flatten_codex_servers(&options.mcp_servers)),
                );
            }
            if let Some(ref policy) = options.approval_policy {
                params.insert("approvalPolicy".into(), Value::String(policy.clone()));
            }
            if let Some(ref sandbox) = options.sandbox_mode {
                params.insert("sandbox".into(), Value::String(sandbox.clone()));
            }
        }
        Provider::Claude | Provider::Pi => {
            if let Some(ref prompt) = options.system_prompt {
                params.insert("systemPrompt".into(), Value::String(prompt.clone()));
            }
            if let Some(ref append) = options.system_prompt_append {
                params.insert("systemPromptAppend".into(), Value::String(append.clone()));
            }
            if !options.mcp_servers.is_empty() {
                params.insert(
                    "mcpServers".into(),
                    Value::Object(options.mcp_servers.clone()),
                );
            }
            if provider == Provider::Pi {
                if let Some(ref config) = options.config {
                    params.insert("config".into(), config.clone());
                }
            }
        }
    }

    Value::Object(params)
}

/// Build `thread/resume` params for `provider`.
///
/// Same field mapping as [`thread_start_params`] plus the agent-side
/// `threadId` to resume.
#[must_use]
pub fn thread_resume_params(
    provider: Provider,
    provider_thread_id: &str,
    options: &ThreadStartOptions,
) -> Value {
    let mut params = thread_start_params(provider, options);
    if let Value::Object(ref mut map) = params {
        map.insert(
            "threadId".into(),
            Value::String(provider_thread_id.to_owned()),
        );
    }
    params
}

// ── Codex mapping ─────────────────────────────────────────────────────────────

/// Flatten MCP server configs into dotted `config` keys.
///
/// Each server contributes keys of the form `mcp_servers.{alias}.{field}`.
/// HTTP-kind servers (those with a `url`) rename `headers`, `envHeaders`,
/// and `bearerTokenEnvVar` to their snake_case wire forms; stdio-kind
/// servers keep `command`/`args`/`env`/`cwd`.
fn flatten_codex_servers(servers: &Map<String, Value>) -> Map<String, Value> {
    let mut config = Map::new();

    for (alias, server) in servers {
        let Value::Object(fields) = server else {
            continue;
        };
        let is_http = fields.contains_key("url");

        for (key, value) in fields {
            let wire_key = if is_http {
                match key.as_str() {
                    "headers" => "http_headers",
                    "envHeaders" => "env_http_headers",
                    "bearerTokenEnvVar" => "bearer_token_env_var",
                    other => other,
                }
            } else {
                match key.as_str() {
                    "command" | "args" | "env" | "cwd" | "url" | "type" => key.as_str(),
                    _ => continue,
                }
            };
            config.insert(
                format!("mcp_servers.{alias}.{wire_key}"),
                value.clone(),
            );
        }
    }

    config
}

/// Build `turn/start` params.
#[must_use]
pub fn turn_start_params(
    provider_thread_id: &str,
    text: &str,
    model: Option<&str>,
) -> Value {
    let mut params = json!({
        "threadId": provider_thread_id,
        "input": [{ "type": "text", "text": text }],
    });
    if let Some(model) = model {
        params["model"] = Value::String(model.to_owned());
    }
    params
}
