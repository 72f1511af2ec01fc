//! Settings file parsing, env-var substitution, and gateway options.
//!
//! Settings come from a JSON file (default `~/.flint/settings.json`) plus
//! `FLINT_GATEWAY_*` environment variables. String values support
//! `${NAME}` substitution (`[A-Z_][A-Z0-9_]*`), escaped as `$${NAME}`.
//! A missing variable inside an MCP server config drops only that server
//! with a warning; anywhere else it aborts the load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::gateway::lifecycle::{ResetPolicy, SessionType, DEFAULT_DAILY_HOUR, DEFAULT_GREETING, DEFAULT_TRIGGERS};
use crate::models::message::RoutingMode;
use crate::protocol::peer::ApprovalDecision;
use crate::protocol::provider::Provider;
use crate::protocol::spawner::AgentCommand;
use crate::routing::IdentityLink;
use crate::{AppError, Result};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8788;

/// Known Codex approval policies.
const CODEX_APPROVAL_POLICIES: &[&str] = &["untrusted", "on-failure", "on-request", "never"];

/// Known Codex sandbox modes.
const CODEX_SANDBOX_MODES: &[&str] = &["read-only", "workspace-write", "danger-full-access"];

// ── Settings file shape ───────────────────────────────────────────────────────

/// One entry in `mcpProfiles`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct McpProfile {
    /// Ids of profiles composed before this one's own servers.
    pub profiles: Vec<String>,
    /// Server alias → opaque config object.
    pub servers: serde_json::Map<String, Value>,
}

/// Reset policy spec as written in settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResetSpec {
    /// `daily`, `idle`, or `off`.
    pub mode: Option<String>,
    /// Local hour for daily resets.
    pub at_hour: Option<u32>,
    /// Idle window in minutes.
    pub idle_minutes: Option<u64>,
}

impl ResetSpec {
    /// Resolve the spec into a policy.
    #[must_use]
    pub fn to_policy(&self) -> ResetPolicy {
        match self.mode.as_deref() {
            Some("off") => ResetPolicy::default(),
            Some("daily") => ResetPolicy {
                daily_at_hour: Some(self.at_hour.unwrap_or(DEFAULT_DAILY_HOUR)),
                idle_minutes: None,
            },
            Some("idle") => ResetPolicy {
                daily_at_hour: None,
                idle_minutes: self.idle_minutes,
            },
            _ => ResetPolicy {
                daily_at_hour: self.at_hour,
                idle_minutes: self.idle_minutes,
            },
        }
    }
}

/// `session.*` settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Base reset policy.
    pub reset: Option<ResetSpec>,
    /// Overrides keyed by session type (`direct`, `group`, `thread`).
    pub reset_by_type: HashMap<String, ResetSpec>,
    /// Overrides keyed by channel; highest precedence.
    pub reset_by_channel: HashMap<String, ResetSpec>,
    /// Slash commands that trigger a session reset.
    pub reset_triggers: Option<Vec<String>>,
    /// Prompt used when a trigger carries no trailing text.
    pub greeting_prompt: Option<String>,
}

/// `codex.*` settings, applied to Codex threads only.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CodexSettings {
    /// Default approval policy for Codex threads.
    pub approval_policy: Option<String>,
    /// Default sandbox mode for Codex threads.
    pub sandbox_mode: Option<String>,
}

/// `agents.{provider}` spawn configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Executable override for the provider.
    pub command: Option<String>,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory for spawned children.
    pub cwd: Option<PathBuf>,
}

/// Parsed settings file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Profile list applied when an inbound request omits `mcpProfileIds`.
    pub default_mcp_profile_ids: Vec<String>,
    /// Named MCP profiles.
    pub mcp_profiles: HashMap<String, McpProfile>,
    /// Session lifecycle settings.
    pub session: SessionSettings,
    /// Codex thread defaults.
    pub codex: CodexSettings,
    /// Per-provider agent spawn configuration.
    pub agents: HashMap<String, AgentSettings>,
    /// Legacy top-level idle window, minutes.
    pub idle_minutes: Option<u64>,
}

impl Settings {
    /// Load settings from `path`, applying env substitution.
    ///
    /// A missing file yields default settings; everything else must parse.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] on unreadable files, invalid JSON, or
    /// missing env vars outside MCP server configs.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(AppError::Config(format!(
                    "cannot read settings file '{}': {e}",
                    path.display()
                )))
            }
        };
        Self::from_json_str(&raw)
    }

    /// Parse settings from a JSON string, applying env substitution.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] on invalid JSON or missing env vars
    /// outside MCP server configs.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("invalid settings json: {e}")))?;
        apply_env_substitution(&mut value)?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Config(format!("invalid settings: {e}")))
    }
}

// ── Env substitution ──────────────────────────────────────────────────────────

#[allow(clippy::unwrap_used)] // Pattern is a compile-time constant.
fn escaped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\$\{([A-Z_][A-Z0-9_]*)\}").unwrap())
}

#[allow(clippy::unwrap_used)] // Pattern is a compile-time constant.
fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap())
}

/// Expand `${NAME}` references in one string.
///
/// `$${NAME}` escapes to a literal `${NAME}`. Names of variables that are
/// unset or empty are appended to `missing` and replaced with an empty
/// string.
#[must_use]
pub fn substitute_env_str(input: &str, missing: &mut Vec<String>) -> String {
    // Two-pass scanner: mask escapes, expand, unmask.
    const MASK_OPEN: &str = "\u{1}";
    const MASK_CLOSE: &str = "\u{2}";

    let masked = escaped_re().replace_all(input, format!("{MASK_OPEN}$1{MASK_CLOSE}"));

    let expanded = var_re().replace_all(&masked, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => {
                missing.push(name.to_owned());
                String::new()
            }
        }
    });

    expanded
        .replace(MASK_OPEN, "${")
        .replace(MASK_CLOSE, "}")
}

/// Expand env references in every string of a JSON subtree.
pub fn substitute_subtree(value: &mut Value, missing: &mut Vec<String>) {
    match value {
        Value::String(s) => *s = substitute_env_str(s, missing),
        Value::Array(items) => {
            for item in items {
                substitute_subtree(item, missing);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_subtree(item, missing);
            }
        }
        _ => {}
    }
}

/// Apply env substitution over the whole settings tree.
///
/// MCP server configs get lenient handling: a server whose config references
/// a missing variable is dropped with a warning. All other strings are
/// strict and abort the load.
fn apply_env_substitution(root: &mut Value) -> Result<()> {
    let profiles = root
        .as_object_mut()
        .and_then(|map| map.remove("mcpProfiles"));

    let mut missing = Vec::new();
    substitute_subtree(root, &mut missing);
    if !missing.is_empty() {
        return Err(AppError::Config(format!(
            "missing environment variable(s) in settings: {}",
            missing.join(", ")
        )));
    }

    if let Some(mut profiles_value) = profiles {
        if let Some(profile_map) = profiles_value.as_object_mut() {
            for (profile_id, profile) in profile_map.iter_mut() {
                substitute_profile(profile_id, profile)?;
            }
        }
        if let Some(map) = root.as_object_mut() {
            map.insert("mcpProfiles".to_owned(), profiles_value);
        }
    }

    Ok(())
}

/// Substitute one profile: strict outside `servers`, lenient per server.
fn substitute_profile(profile_id: &str, profile: &mut Value) -> Result<()> {
    let Some(fields) = profile.as_object_mut() else {
        return Ok(());
    };

    let servers = fields.remove("servers");

    let mut missing = Vec::new();
    for (_, field) in fields.iter_mut() {
        substitute_subtree(field, &mut missing);
    }
    if !missing.is_empty() {
        return Err(AppError::Config(format!(
            "missing environment variable(s) in profile `{profile_id}`: {}",
            missing.join(", ")
        )));
    }

    if let Some(mut servers_value) = servers {
        if let Some(server_map) = servers_value.as_object_mut() {
            let mut dropped = Vec::new();
            for (alias, config) in server_map.iter_mut() {
                let mut server_missing = Vec::new();
                substitute_subtree(config, &mut server_missing);
                if !server_missing.is_empty() {
                    warn!(
                        profile = profile_id,
                        server = alias.as_str(),
                        missing = server_missing.join(", "),
                        "dropping MCP server: unresolved environment variable(s)"
                    );
                    dropped.push(alias.clone());
                }
            }
            for alias in dropped {
                server_map.remove(&alias);
            }
        }
        fields.insert("servers".to_owned(), servers_value);
    }

    Ok(())
}

// ── Gateway options ───────────────────────────────────────────────────────────

/// CLI overrides applied on top of settings and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Settings file path override.
    pub settings_path: Option<PathBuf>,
    /// HTTP port override.
    pub port: Option<u16>,
    /// Thread store path override.
    pub store_path: Option<PathBuf>,
}

/// Fully resolved gateway configuration, injected everywhere.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Default provider for new threads.
    pub provider: Provider,
    /// Default model; provider default when absent.
    pub model: Option<String>,
    /// Default routing mode for direct chats.
    pub routing_mode: RoutingMode,
    /// HTTP listen port.
    pub port: u16,
    /// Thread store file path.
    pub store_path: PathBuf,
    /// Idempotency replay window.
    pub idempotency_ttl: Duration,
    /// Cross-channel identity links, insertion-ordered.
    pub identity_links: Vec<IdentityLink>,
    /// Whether the built-in memory server is merged into compositions.
    pub memory_enabled: bool,
    /// Optional bearer token required on `/v1/*`.
    pub api_token: Option<String>,
    /// Decision for auto-answered approval requests.
    pub approval_decision: ApprovalDecision,
    /// Idle window (minutes) from `FLINT_GATEWAY_IDLE_TIMEOUT_SECONDS`.
    pub idle_override_minutes: Option<u64>,
    /// Parsed settings file.
    pub settings: Settings,
    /// Deferred Codex configuration error; fails Codex turns when set.
    pub codex_config_error: Option<String>,
}

impl GatewayOptions {
    /// Resolve options from settings, environment, and CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] on unparseable settings or env values.
    pub fn load(overrides: &CliOverrides) -> Result<Self> {
        let settings_path = overrides
            .settings_path
            .clone()
            .or_else(|| env_path("FLINT_GATEWAY_USER_SETTINGS_PATH"))
            .unwrap_or_else(|| home_dir().join(".flint").join("settings.json"));
        let settings = Settings::load_from_path(&settings_path)?;

        let provider = match env_string("FLINT_GATEWAY_PROVIDER") {
            Some(token) => Provider::parse(&token)
                .map_err(|e| AppError::Config(format!("FLINT_GATEWAY_PROVIDER: {e}")))?,
            None => Provider::default(),
        };

        let routing_mode = match env_string("FLINT_GATEWAY_ROUTING_MODE") {
            Some(token) => RoutingMode::parse(&token)
                .map_err(|e| AppError::Config(format!("FLINT_GATEWAY_ROUTING_MODE: {e}")))?,
            None => RoutingMode::default(),
        };

        let port = match overrides.port {
            Some(port) => port,
            None => match env_string("PORT") {
                Some(raw) => raw
                    .parse::<u16>()
                    .map_err(|e| AppError::Config(format!("invalid PORT: {e}")))?,
                None => DEFAULT_PORT,
            },
        };

        let store_path = overrides
            .store_path
            .clone()
            .or_else(|| env_path("FLINT_GATEWAY_STORE_PATH"))
            .unwrap_or_else(|| {
                home_dir()
                    .join(".flint")
                    .join("gateway")
                    .join("threads.json")
            });

        let idempotency_ttl = match env_string("FLINT_GATEWAY_IDEMPOTENCY_TTL_MS") {
            Some(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|e| {
                AppError::Config(format!("invalid FLINT_GATEWAY_IDEMPOTENCY_TTL_MS: {e}"))
            })?),
            None => crate::gateway::idempotency::DEFAULT_TTL,
        };

        let identity_links = match env_string("FLINT_GATEWAY_IDENTITY_LINKS") {
            Some(raw) => parse_identity_links(&raw)?,
            None => Vec::new(),
        };

        let idle_override_minutes = match env_string("FLINT_GATEWAY_IDLE_TIMEOUT_SECONDS") {
            Some(raw) => {
                let seconds = raw.parse::<u64>().map_err(|e| {
                    AppError::Config(format!("invalid FLINT_GATEWAY_IDLE_TIMEOUT_SECONDS: {e}"))
                })?;
                Some(seconds.div_ceil(60).max(1))
            }
            None => None,
        };

        let codex_config_error = validate_codex(&settings.codex).err().map(|e| e.to_string());
        if let Some(ref msg) = codex_config_error {
            warn!(error = msg.as_str(), "codex configuration invalid; codex turns will fail");
        }

        Ok(Self {
            provider,
            model: env_string("FLINT_GATEWAY_MODEL"),
            routing_mode,
            port,
            store_path,
            idempotency_ttl,
            identity_links,
            memory_enabled: env_truthy("FLINT_GATEWAY_MEMORY_ENABLED"),
            api_token: env_string("FLINT_GATEWAY_API_TOKEN"),
            approval_decision: if env_string("FLINT_GATEWAY_APPROVAL_DECISION").as_deref()
                == Some("decline")
            {
                ApprovalDecision::Decline
            } else {
                ApprovalDecision::Accept
            },
            idle_override_minutes,
            settings,
            codex_config_error,
        })
    }

    /// Configured reset trigger commands.
    #[must_use]
    pub fn reset_triggers(&self) -> Vec<String> {
        self.settings
            .session
            .reset_triggers
            .clone()
            .unwrap_or_else(|| DEFAULT_TRIGGERS.iter().map(|s| (*s).to_owned()).collect())
    }

    /// Greeting prompt used for bare reset triggers.
    #[must_use]
    pub fn greeting(&self) -> String {
        self.settings
            .session
            .greeting_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_GREETING.to_owned())
    }

    /// Resolve the reset policy for one request.
    ///
    /// Precedence: channel override, then session-type override, then the
    /// base policy. With no configured policy at all, a top-level legacy
    /// `idleMinutes` (or the env idle override) yields an idle-only policy;
    /// otherwise the default is a daily reset at hour 4.
    #[must_use]
    pub fn resolve_policy(&self, channel: &str, session_type: SessionType) -> ResetPolicy {
        let session = &self.settings.session;
        if let Some(spec) = session.reset_by_channel.get(channel) {
            return spec.to_policy();
        }
        if let Some(spec) = session.reset_by_type.get(session_type.as_str()) {
            return spec.to_policy();
        }
        if let Some(ref spec) = session.reset {
            return spec.to_policy();
        }
        if let Some(minutes) = self.settings.idle_minutes.or(self.idle_override_minutes) {
            return ResetPolicy {
                daily_at_hour: None,
                idle_minutes: Some(minutes),
            };
        }
        ResetPolicy {
            daily_at_hour: Some(DEFAULT_DAILY_HOUR),
            idle_minutes: None,
        }
    }

    /// Spawn command for a provider's agent child.
    #[must_use]
    pub fn agent_command(&self, provider: Provider) -> AgentCommand {
        let configured = self.settings.agents.get(provider.hint());
        AgentCommand {
            program: configured
                .and_then(|a| a.command.clone())
                .unwrap_or_else(|| provider.default_command().to_owned()),
            args: configured.map(|a| a.args.clone()).unwrap_or_default(),
            cwd: configured.and_then(|a| a.cwd.clone()),
        }
    }
}

/// Validate Codex settings against the known token sets.
fn validate_codex(codex: &CodexSettings) -> Result<()> {
    if let Some(ref policy) = codex.approval_policy {
        if !CODEX_APPROVAL_POLICIES.contains(&policy.as_str()) {
            return Err(AppError::Config(format!(
                "unknown codex approval policy `{policy}`"
            )));
        }
    }
    if let Some(ref sandbox) = codex.sandbox_mode {
        if !CODEX_SANDBOX_MODES.contains(&sandbox.as_str()) {
            return Err(AppError::Config(format!(
                "unknown codex sandbox mode `{sandbox}`"
            )));
        }
    }
    Ok(())
}

/// Parse `FLINT_GATEWAY_IDENTITY_LINKS`: a JSON map of canonical → tokens.
///
/// Map insertion order is preserved, so link matching stays deterministic
/// for a given configuration.
fn parse_identity_links(raw: &str) -> Result<Vec<IdentityLink>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AppError::Config(format!("invalid FLINT_GATEWAY_IDENTITY_LINKS: {e}")))?;
    let Value::Object(map) = value else {
        return Err(AppError::Config(
            "FLINT_GATEWAY_IDENTITY_LINKS must be a JSON object".into(),
        ));
    };

    let mut links = Vec::with_capacity(map.len());
    for (canonical, tokens) in map {
        let Value::Array(items) = tokens else {
            return Err(AppError::Config(format!(
                "identity link `{canonical}` must map to an array of tokens"
            )));
        };
        let tokens = items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_lowercase()),
                _ => None,
            })
            .collect();
        links.push(IdentityLink {
            canonical: canonical.trim().to_lowercase(),
            tokens,
        });
    }
    Ok(links)
}

// ── Env helpers ───────────────────────────────────────────────────────────────

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_string(name).map(PathBuf::from)
}

fn env_truthy(name: &str) -> bool {
    matches!(
        env_string(name).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn home_dir() -> PathBuf {
    env_string("HOME")
        .or_else(|| env_string("USERPROFILE"))
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
}
