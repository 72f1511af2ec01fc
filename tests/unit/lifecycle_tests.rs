//! Unit tests for reset-policy evaluation and reset-command parsing.

use chrono::{Duration, Local, Timelike, Utc};
use flint_gateway::gateway::lifecycle::{
    evaluate_expiry, parse_reset_command, ExpiryReason, ResetPolicy, DEFAULT_GREETING,
};
use flint_gateway::protocol::provider::Provider;

fn triggers() -> Vec<String> {
    vec!["/new".to_owned(), "/reset".to_owned()]
}

// ── Expiry evaluation ─────────────────────────────────────────────────────────

/// A session last touched well before today's boundary expires with
/// reason `daily` (expressed in the host's local time).
#[test]
fn daily_expiry_fires_after_boundary() {
    let now = Utc::now();
    let policy = ResetPolicy {
        daily_at_hour: Some(now.with_timezone(&Local).hour()),
        idle_minutes: None,
    };
    // Two hours before now is strictly before today's boundary, which is
    // at most one hour old.
    let updated = (now - Duration::hours(2)).timestamp_millis();
    assert_eq!(
        evaluate_expiry(updated, now, &policy),
        Some(ExpiryReason::Daily)
    );
}

#[test]
fn daily_expiry_spares_recent_sessions() {
    let now = Utc::now();
    let policy = ResetPolicy {
        daily_at_hour: Some(now.with_timezone(&Local).hour()),
        idle_minutes: None,
    };
    // A timestamp equal to `now` is never before the boundary.
    assert_eq!(evaluate_expiry(now.timestamp_millis(), now, &policy), None);
}

#[test]
fn idle_expiry_fires_past_the_window() {
    let now = Utc::now();
    let policy = ResetPolicy {
        daily_at_hour: None,
        idle_minutes: Some(10),
    };
    let stale = (now - Duration::minutes(11)).timestamp_millis();
    let fresh = (now - Duration::minutes(5)).timestamp_millis();
    assert_eq!(evaluate_expiry(stale, now, &policy), Some(ExpiryReason::Idle));
    assert_eq!(evaluate_expiry(fresh, now, &policy), None);
}

#[test]
fn daily_wins_when_both_policies_match() {
    let now = Utc::now();
    let policy = ResetPolicy {
        daily_at_hour: Some(now.with_timezone(&Local).hour()),
        idle_minutes: Some(1),
    };
    let updated = (now - Duration::hours(3)).timestamp_millis();
    assert_eq!(
        evaluate_expiry(updated, now, &policy),
        Some(ExpiryReason::Daily)
    );
}

#[test]
fn off_policy_never_expires() {
    let now = Utc::now();
    let policy = ResetPolicy::default();
    assert!(policy.is_off());
    let ancient = (now - Duration::days(365)).timestamp_millis();
    assert_eq!(evaluate_expiry(ancient, now, &policy), None);
}

/// Newer timestamps are never more likely to expire.
#[test]
fn expiry_is_monotone_in_updated_at() {
    let now = Utc::now();
    let policy = ResetPolicy {
        daily_at_hour: Some(now.with_timezone(&Local).hour()),
        idle_minutes: Some(30),
    };

    let mut last_expired = true;
    for minutes_ago in [10_000, 1_000, 120, 45, 20, 5, 0] {
        let ts = (now - Duration::minutes(minutes_ago)).timestamp_millis();
        let expired = evaluate_expiry(ts, now, &policy).is_some();
        assert!(
            expired <= last_expired,
            "a newer timestamp ({minutes_ago}m ago) must not expire when an older one did not"
        );
        last_expired = expired;
    }
}

// ── Reset command parsing ─────────────────────────────────────────────────────

/// `/new provider/model prompt` retargets and keeps the prompt.
#[test]
fn new_with_provider_model_and_prompt() {
    let parsed = parse_reset_command("/new claude/sonnet keep going", &triggers(), DEFAULT_GREETING)
        .expect("trigger must fire");
    assert_eq!(parsed.trigger, "/new");
    assert_eq!(parsed.provider_override, Some(Provider::Claude));
    assert_eq!(parsed.model_override.as_deref(), Some("sonnet"));
    assert_eq!(parsed.next_text, "keep going");
}

#[test]
fn non_trigger_text_is_ignored() {
    assert!(parse_reset_command("hello /new", &triggers(), DEFAULT_GREETING).is_none());
    assert!(parse_reset_command("", &triggers(), DEFAULT_GREETING).is_none());
}

#[test]
fn bare_trigger_uses_greeting() {
    let parsed =
        parse_reset_command("/new", &triggers(), "hi there").expect("trigger must fire");
    assert_eq!(parsed.next_text, "hi there");
    assert!(parsed.provider_override.is_none());
    assert!(parsed.model_override.is_none());
}

#[test]
fn reset_trigger_takes_no_target() {
    let parsed = parse_reset_command("/reset codex please", &triggers(), DEFAULT_GREETING)
        .expect("trigger must fire");
    assert!(parsed.provider_override.is_none());
    assert_eq!(parsed.next_text, "codex please");
}

#[test]
fn bare_provider_token_retargets() {
    let parsed =
        parse_reset_command("/new codex", &triggers(), DEFAULT_GREETING).expect("trigger");
    assert_eq!(parsed.provider_override, Some(Provider::Codex));
    assert!(parsed.model_override.is_none());
    assert_eq!(parsed.next_text, DEFAULT_GREETING);
}

#[test]
fn unique_prefix_matches_provider() {
    let parsed =
        parse_reset_command("/new cla", &triggers(), DEFAULT_GREETING).expect("trigger");
    assert_eq!(parsed.provider_override, Some(Provider::Claude));
}

#[test]
fn ambiguous_prefix_consumes_nothing() {
    // `c` prefixes both `claude` and `codex`, and is not model-like.
    let parsed =
        parse_reset_command("/new c keep going", &triggers(), DEFAULT_GREETING).expect("trigger");
    assert!(parsed.provider_override.is_none());
    assert!(parsed.model_override.is_none());
    assert_eq!(parsed.next_text, "c keep going");
}

#[test]
fn model_like_token_is_consumed_as_model() {
    let parsed =
        parse_reset_command("/new gpt-5 do it", &triggers(), DEFAULT_GREETING).expect("trigger");
    assert!(parsed.provider_override.is_none());
    assert_eq!(parsed.model_override.as_deref(), Some("gpt-5"));
    assert_eq!(parsed.next_text, "do it");
}

#[test]
fn plain_word_stays_in_the_prompt() {
    let parsed =
        parse_reset_command("/new hello world", &triggers(), DEFAULT_GREETING).expect("trigger");
    assert!(parsed.model_override.is_none());
    assert_eq!(parsed.next_text, "hello world");
}

#[test]
fn unknown_provider_slash_model_is_a_model() {
    let parsed = parse_reset_command("/new acme/model2", &triggers(), DEFAULT_GREETING)
        .expect("trigger");
    assert!(parsed.provider_override.is_none());
    assert_eq!(parsed.model_override.as_deref(), Some("acme/model2"));
}

#[test]
fn custom_triggers_are_honored() {
    let custom = vec!["/wipe".to_owned()];
    assert!(parse_reset_command("/new hi", &custom, DEFAULT_GREETING).is_none());
    let parsed = parse_reset_command("/wipe", &custom, DEFAULT_GREETING).expect("trigger");
    assert_eq!(parsed.trigger, "/wipe");
}
