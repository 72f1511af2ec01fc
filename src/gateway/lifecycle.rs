//! Session lifecycle: reset policies and in-band reset commands.
//!
//! A thread's agent session expires on a daily boundary, after an idle
//! window, or when the user sends a reset trigger (`/new`, `/reset`). The
//! `/new` trigger additionally accepts a provider/model retarget token.

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};

use crate::models::message::{ChatType, NormalizedMessage};
use crate::protocol::provider::Provider;

/// Default daily reset hour (local time) when no policy is configured.
pub const DEFAULT_DAILY_HOUR: u32 = 4;

/// Default reset trigger commands.
pub const DEFAULT_TRIGGERS: &[&str] = &["/new", "/reset"];

/// Prompt sent to the agent when a trigger carries no trailing text.
pub const DEFAULT_GREETING: &str = "New session started. Give a one-line greeting.";

/// Resolved reset policy. Both fields absent means "off".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetPolicy {
    /// Reset at this local hour every day.
    pub daily_at_hour: Option<u32>,
    /// Reset after this many idle minutes.
    pub idle_minutes: Option<u64>,
}

impl ResetPolicy {
    /// Whether the policy never expires sessions.
    #[must_use]
    pub fn is_off(&self) -> bool {
        self.daily_at_hour.is_none() && self.idle_minutes.is_none()
    }
}

/// Session type used for per-type policy overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// Direct chat with no channel-native thread.
    Direct,
    /// Group or channel chat with no channel-native thread.
    Group,
    /// Any chat inside a channel-native thread.
    Thread,
}

impl SessionType {
    /// Config key for the session type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Thread => "thread",
        }
    }

    /// Classify a normalized message.
    #[must_use]
    pub fn of(msg: &NormalizedMessage) -> Self {
        if msg.channel_thread_id.is_some() {
            Self::Thread
        } else if matches!(msg.chat_type, ChatType::Direct) {
            Self::Direct
        } else {
            Self::Group
        }
    }
}

/// Why an existing session expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The daily boundary passed since the last turn.
    Daily,
    /// The idle window elapsed.
    Idle,
}

impl ExpiryReason {
    /// Short reason token (`daily` / `idle`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Idle => "idle",
        }
    }
}

/// Evaluate whether a session last updated at `updated_at_ms` has expired.
///
/// Daily wins over idle when both match. Evaluation is monotone in
/// `updated_at_ms`: a newer timestamp is never more likely to expire.
#[must_use]
pub fn evaluate_expiry(
    updated_at_ms: i64,
    now: DateTime<Utc>,
    policy: &ResetPolicy,
) -> Option<ExpiryReason> {
    if let Some(hour) = policy.daily_at_hour {
        if let Some(boundary) = daily_boundary(now, hour) {
            if updated_at_ms < boundary.timestamp_millis() {
                return Some(ExpiryReason::Daily);
            }
        }
    }

    if let Some(minutes) = policy.idle_minutes {
        let window_ms = i64::try_from(minutes).unwrap_or(i64::MAX / 60_000) * 60_000;
        if updated_at_ms < now.timestamp_millis() - window_ms {
            return Some(ExpiryReason::Idle);
        }
    }

    None
}

/// Most recent local instant at `hour:00:00.000` not after `now`.
fn daily_boundary(now: DateTime<Utc>, hour: u32) -> Option<DateTime<Utc>> {
    let local_now = now.with_timezone(&Local);
    let today = local_now.date_naive().and_hms_opt(hour, 0, 0)?;
    let today_boundary = Local.from_local_datetime(&today).earliest()?;

    let boundary = if local_now >= today_boundary {
        today_boundary
    } else {
        let yesterday = (local_now.date_naive() - ChronoDuration::days(1)).and_hms_opt(hour, 0, 0)?;
        Local.from_local_datetime(&yesterday).earliest()?
    };

    Some(boundary.with_timezone(&Utc))
}

// ── Reset command parsing ─────────────────────────────────────────────────────

/// Parsed reset trigger with optional retarget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetDirective {
    /// The trigger token that fired (e.g. `/new`).
    pub trigger: String,
    /// Provider to retarget the fresh session to.
    pub provider_override: Option<Provider>,
    /// Model to retarget the fresh session to.
    pub model_override: Option<String>,
    /// Prompt to run on the fresh session; the configured greeting when the
    /// trigger carried no trailing text.
    pub next_text: String,
}

/// Parse a reset command from normalized trimmed text.
///
/// Returns `None` when the first token is not one of `triggers`. Only the
/// `/new` trigger accepts a retarget token; see `parse_target` for the
/// provider/model grammar.
#[must_use]
pub fn parse_reset_command(
    text: &str,
    triggers: &[String],
    greeting: &str,
) -> Option<ResetDirective> {
    let trimmed = text.trim();
    let (first, rest) = split_first_token(trimmed);
    if first.is_empty() || !triggers.iter().any(|t| t == first) {
        return None;
    }

    let mut provider_override = None;
    let mut model_override = None;
    let mut remainder = rest;

    if first == "/new" {
        let (token, tail) = split_first_token(rest);
        if !token.is_empty() {
            if let Some(target) = parse_target(token) {
                provider_override = target.provider;
                model_override = target.model;
                remainder = tail;
            }
        }
    }

    let next_text = if remainder.trim().is_empty() {
        greeting.to_owned()
    } else {
        remainder.trim().to_owned()
    };

    Some(ResetDirective {
        trigger: first.to_owned(),
        provider_override,
        model_override,
        next_text,
    })
}

/// Parsed retarget token.
struct Target {
    provider: Option<Provider>,
    model: Option<String>,
}

/// Interpret a `/new` retarget token.
///
/// Grammar, in order:
/// 1. `provider/model` — left side matched against provider hints (equality
///    or unique case-insensitive prefix); a non-matching left side makes the
///    whole token a model.
/// 2. Bare provider hint.
/// 3. Bare model, accepted only when the token "looks model-like"
///    (contains a digit or any of `-_:./`); otherwise nothing is consumed
///    and the token stays in the prompt text.
fn parse_target(token: &str) -> Option<Target> {
    if let Some((left, right)) = token.split_once('/') {
        if let Some(provider) = Provider::match_hint(left) {
            return Some(Target {
                provider: Some(provider),
                model: if right.is_empty() {
                    None
                } else {
                    Some(right.to_owned())
                },
            });
        }
        return Some(Target {
            provider: None,
            model: Some(token.to_owned()),
        });
    }

    if let Some(provider) = Provider::match_hint(token) {
        return Some(Target {
            provider: Some(provider),
            model: None,
        });
    }

    if looks_model_like(token) {
        return Some(Target {
            provider: None,
            model: Some(token.to_owned()),
        });
    }

    None
}

/// Whether a bare token plausibly names a model.
fn looks_model_like(token: &str) -> bool {
    token
        .chars()
        .any(|c| c.is_ascii_digit() || matches!(c, '-' | '_' | ':' | '.' | '/'))
}

/// Split leading non-whitespace token from the rest.
fn split_first_token(text: &str) -> (&str, &str) {
    let trimmed = text.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim_start()),
        None => (trimmed, ""),
    }
}
