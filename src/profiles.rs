//! MCP profile composition.
//!
//! Settings declare named profiles, each of which may reference other
//! profiles and declare a map of server aliases. Composing a list of
//! profile ids produces a single alias → config map by depth-first
//! expansion. Duplicate aliases from distinct declarations are collisions;
//! reference cycles are rejected; a profile reached twice through different
//! paths is expanded once.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::config::Settings;
use crate::{AppError, Result};

/// Alias the built-in memory server prefers.
pub const MEMORY_ALIAS: &str = "memory";

/// Compose the servers of `ids` into one alias → config map.
///
/// # Errors
///
/// - [`AppError::Config`]`("unknown MCP profile …")` — an id has no
///   declaration.
/// - [`AppError::Config`]`("MCP profile cycle …")` — the reference graph
///   has a cycle.
/// - [`AppError::Config`]`("MCP server alias collision …")` — two distinct
///   declarations use the same alias.
pub fn compose(ids: &[String], settings: &Settings) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    let mut visiting = Vec::new();
    let mut expanded = HashSet::new();

    for id in ids {
        expand(id, settings, &mut out, &mut visiting, &mut expanded)?;
    }

    Ok(out)
}

/// Depth-first expansion of one profile id.
fn expand(
    id: &str,
    settings: &Settings,
    out: &mut Map<String, Value>,
    visiting: &mut Vec<String>,
    expanded: &mut HashSet<String>,
) -> Result<()> {
    if expanded.contains(id) {
        return Ok(());
    }
    if visiting.iter().any(|v| v == id) {
        return Err(AppError::Config(format!(
            "MCP profile cycle: {} -> {id}",
            visiting.join(" -> ")
        )));
    }

    let profile = settings
        .mcp_profiles
        .get(id)
        .ok_or_else(|| AppError::Config(format!("unknown MCP profile `{id}`")))?;

    visiting.push(id.to_owned());
    for referenced in &profile.profiles {
        expand(referenced, settings, out, visiting, expanded)?;
    }
    visiting.pop();

    for (alias, config) in &profile.servers {
        if out.contains_key(alias) {
            return Err(AppError::Config(format!(
                "MCP server alias collision: `{alias}` declared again by profile `{id}`"
            )));
        }
        out.insert(alias.clone(), config.clone());
    }

    expanded.insert(id.to_owned());
    Ok(())
}

/// Merge the built-in memory server into a composed map.
///
/// Never replaces a user-declared alias: when `memory` is taken the alias
/// is suffixed `_1`, `_2`, … until free. Returns the alias used.
pub fn merge_memory_server(servers: &mut Map<String, Value>, config: Value) -> String {
    let mut alias = MEMORY_ALIAS.to_owned();
    let mut n = 0usize;
    while servers.contains_key(&alias) {
        n += 1;
        alias = format!("{MEMORY_ALIAS}_{n}");
    }
    servers.insert(alias.clone(), config);
    alias
}

/// Config object for the built-in memory server child.
#[must_use]
pub fn memory_server_config() -> Value {
    serde_json::json!({
        "type": "stdio",
        "command": "flint-memory",
        "args": [],
    })
}
