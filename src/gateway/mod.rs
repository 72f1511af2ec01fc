//! Gateway engine: the `handle_message` pipeline.
//!
//! Composes thread identity, the per-thread queue, session lifecycle, the
//! runtime registry, and the thread store. For a single thread id, reset
//! evaluation, runtime creation, turn execution, and the record upsert are
//! atomic from the caller's perspective because everything runs inside the
//! thread's queue drain.

pub mod idempotency;
pub mod lifecycle;
pub mod queue;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::channels::ChannelAdapter;
use crate::config::GatewayOptions;
use crate::models::event::AgentEvent;
use crate::models::message::{InboundMessage, NormalizedMessage, RoutingMode};
use crate::models::thread::{now_iso, parse_iso_ms, ThreadRecord};
use crate::persistence::thread_store::ThreadStore;
use crate::protocol::provider::Provider;
use crate::routing::resolve_thread_id;
use crate::{AppError, Result};

use self::idempotency::IdempotencyStore;
use self::lifecycle::{parse_reset_command, ResetDirective, SessionType};
use self::queue::ThreadQueues;
use self::registry::{DesiredRuntime, RuntimeRegistry};

/// Webhook event-id dedup window.
const WEBHOOK_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Marker phrases that qualify an error for model fallback.
const MODEL_FALLBACK_MARKERS: &[&str] = &[
    "unknown model",
    "invalid model",
    "not supported",
    "unsupported",
];

/// Reply for one completed turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    /// Thread the turn ran on.
    pub thread_id: String,
    /// Routing mode that produced the thread id.
    pub routing_mode: RoutingMode,
    /// Provider that served the turn.
    pub provider: String,
    /// Concatenated assistant text.
    pub reply: String,
    /// Wall-clock duration of the turn pipeline.
    pub duration_ms: u64,
    /// Why the session was reset before this turn, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_reason: Option<String>,
}

/// The gateway core, shared behind an `Arc` by every surface.
pub struct GatewayEngine {
    options: Arc<GatewayOptions>,
    store: ThreadStore,
    registry: RuntimeRegistry,
    queues: ThreadQueues,
    idempotency: IdempotencyStore,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    webhook_seen: std::sync::Mutex<HashMap<String, Instant>>,
}

impl GatewayEngine {
    /// Build the engine and initialize the thread store.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] when the store path cannot be prepared.
    pub async fn start(
        options: GatewayOptions,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> Result<Arc<Self>> {
        let options = Arc::new(options);
        let store = ThreadStore::new(options.store_path.clone());
        store.init().await?;

        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.name().to_owned(), adapter))
            .collect();

        Ok(Arc::new(Self {
            registry: RuntimeRegistry::new(Arc::clone(&options)),
            idempotency: IdempotencyStore::new(options.idempotency_ttl),
            queues: ThreadQueues::new(),
            adapters,
            webhook_seen: std::sync::Mutex::new(HashMap::new()),
            store,
            options,
        }))
    }

    /// Gateway options.
    #[must_use]
    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Thread store (read paths for the HTTP surface).
    #[must_use]
    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    /// Idempotency store.
    #[must_use]
    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Adapter registered under `name`, if any.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Handle one inbound message end to end.
    ///
    /// Resolves the thread identity, enqueues the turn on the thread's FIFO
    /// queue, and awaits its completion. Events are forwarded to `on_event`
    /// as the agent produces them.
    ///
    /// # Errors
    ///
    /// Validation errors surface before anything is enqueued; agent and
    /// store failures surface from the queued turn.
    pub async fn handle_message(
        self: &Arc<Self>,
        message: &InboundMessage,
        on_event: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<TurnReply> {
        let normalized = message.normalized()?;
        if let Some(ref token) = normalized.provider {
            // Fail unknown providers before touching the queue.
            Provider::parse(token)?;
        }

        let routing_mode = normalized.routing_mode.unwrap_or(self.options.routing_mode);
        let thread_id = resolve_thread_id(&normalized, routing_mode, &self.options.identity_links);

        self.enqueue_turn(thread_id, normalized, routing_mode, on_event)
            .await
    }

    /// Handle a follow-up message addressed to an existing thread id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for unknown thread ids and
    /// [`AppError::Validation`] for blank text.
    pub async fn handle_existing(
        self: &Arc<Self>,
        thread_id: &str,
        text: &str,
        on_event: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<TurnReply> {
        let record = self
            .store
            .get(thread_id)
            .await
            .ok_or_else(|| AppError::NotFound("Thread not found.".into()))?;

        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation(
                "field `text` must not be blank".into(),
            ));
        }

        let normalized = NormalizedMessage {
            channel: record.channel.clone(),
            user_id: record.user_id.clone(),
            text: text.to_owned(),
            provider: None,
            chat_type: record.chat_type,
            peer_id: record.peer_id.clone(),
            account_id: record.account_id.clone().unwrap_or_else(|| "default".into()),
            identity_id: record.identity_id.clone(),
            channel_thread_id: record.channel_thread_id.clone(),
            mcp_profile_ids: None,
            routing_mode: Some(record.routing_mode),
            idempotency_key: None,
        };

        self.enqueue_turn(
            thread_id.to_owned(),
            normalized,
            record.routing_mode,
            on_event,
        )
        .await
    }

    /// Interrupt the active turn on a thread, best-effort.
    pub async fn interrupt_thread(&self, thread_id: &str) -> bool {
        self.registry.interrupt(thread_id).await
    }

    /// Graceful shutdown: close every runtime.
    pub async fn shutdown(&self) {
        info!("closing agent runtimes");
        self.registry.close_all().await;
    }

    // ── Webhook support ──────────────────────────────────────────────────────

    /// Record a channel event id; `true` when it was seen within the window.
    #[must_use]
    pub fn webhook_duplicate(&self, event_id: &str) -> bool {
        let Ok(mut seen) = self.webhook_seen.lock() else {
            return false;
        };
        seen.retain(|_, at| at.elapsed() < WEBHOOK_DEDUP_WINDOW);
        if seen.contains_key(event_id) {
            return true;
        }
        seen.insert(event_id.to_owned(), Instant::now());
        false
    }

    /// Process one parsed webhook message through the gateway.
    ///
    /// Acknowledges first, streams agent events into the adapter, and
    /// delivers the reply (or a formatted error) when the turn completes.
    pub async fn process_webhook(
        self: Arc<Self>,
        adapter: Arc<dyn ChannelAdapter>,
        message: InboundMessage,
        meta: serde_json::Value,
    ) {
        let span = info_span!("webhook", adapter = adapter.name());
        async move {
            adapter.acknowledge(&meta).await;

            let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(32);
            let forwarder = {
                let adapter = Arc::clone(&adapter);
                let meta = meta.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        adapter.on_agent_event(&meta, &event).await;
                    }
                })
            };

            let result = self.handle_message(&message, Some(event_tx)).await;
            let _ = forwarder.await;

            let reply_text = match result {
                Ok(reply) => reply.reply,
                Err(e) => {
                    error!(error = %e, adapter = adapter.name(), "webhook turn failed");
                    format!("\u{26a0}\u{fe0f} {e}")
                }
            };

            if let Err(e) = adapter.deliver_reply(&meta, &reply_text).await {
                error!(error = %e, adapter = adapter.name(), "reply delivery failed");
            }
        }
        .instrument(span)
        .await;
    }

    // ── Turn pipeline ────────────────────────────────────────────────────────

    /// Enqueue the turn on the thread's FIFO queue and await it.
    async fn enqueue_turn(
        self: &Arc<Self>,
        thread_id: String,
        message: NormalizedMessage,
        routing_mode: RoutingMode,
        on_event: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<TurnReply> {
        let engine = Arc::clone(self);
        let key = thread_id.clone();
        let task = {
            let thread_id = thread_id.clone();
            async move {
                engine
                    .run_thread_turn(&thread_id, message, routing_mode, on_event)
                    .instrument(info_span!("turn", thread_id = thread_id.as_str()))
                    .await
            }
        };

        self.queues
            .enqueue(&key, task)
            .await
            .map_err(|_| AppError::Agent("gateway is shutting down".into()))?
    }

    /// The serialized per-thread turn body.
    async fn run_thread_turn(
        &self,
        thread_id: &str,
        message: NormalizedMessage,
        routing_mode: RoutingMode,
        on_event: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<TurnReply> {
        let started = Instant::now();
        let existing = self.store.get(thread_id).await;

        let triggers = self.options.reset_triggers();
        let greeting = self.options.greeting();
        let directive = parse_reset_command(&message.text, &triggers, &greeting);

        let reset_reason = self.resolve_reset_reason(&message, existing.as_ref(), directive.as_ref());
        if let Some(ref reason) = reset_reason {
            info!(thread_id, reason = reason.as_str(), "resetting session");
        }

        let provider = self.resolve_provider(&message, existing.as_ref(), directive.as_ref());
        let model = self.resolve_model(provider, existing.as_ref(), directive.as_ref());
        let mcp_profile_ids = message
            .mcp_profile_ids
            .clone()
            .or_else(|| existing.as_ref().map(|r| r.mcp_profile_ids.clone()))
            .unwrap_or_else(|| self.options.settings.default_mcp_profile_ids.clone());

        let text = directive
            .as_ref()
            .map_or(message.text.as_str(), |d| d.next_text.as_str());

        let mut desired = DesiredRuntime {
            provider,
            model,
            mcp_profile_ids,
            force_new_session: reset_reason.is_some(),
            force_default_model: false,
        };

        let stored_session_id = existing.as_ref().map(|r| r.provider_thread_id.as_str());
        let runtime = self
            .registry
            .ensure_runtime(thread_id, &desired, stored_session_id)
            .await?;

        let mut warning: Option<String> = None;
        let outcome = match self.registry.run_turn(&runtime, text, on_event.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) if should_fallback_model(&e, desired.model.as_deref()) => {
                let rejected = desired.model.clone().unwrap_or_default();
                warn!(
                    thread_id,
                    model = rejected.as_str(),
                    error = %e,
                    "model rejected; retrying with the provider default"
                );
                self.registry.close(thread_id).await;
                desired.model = None;
                desired.force_new_session = true;
                desired.force_default_model = true;
                let runtime = self
                    .registry
                    .ensure_runtime(thread_id, &desired, None)
                    .await?;
                warning = Some(format!(
                    "\u{26a0}\u{fe0f} Model `{rejected}` was rejected; replied with the default model.\n\n"
                ));
                self.registry.run_turn(&runtime, text, on_event.as_ref()).await?
            }
            Err(e) => return Err(e),
        };

        // Re-read the registry's view: the fallback path replaced the runtime.
        let record = self
            .upsert_record(thread_id, &message, routing_mode, existing)
            .await?;

        let reply = match warning {
            Some(prefix) => format!("{prefix}{}", outcome.reply),
            None => outcome.reply,
        };

        Ok(TurnReply {
            thread_id: record.thread_id,
            routing_mode,
            provider: record.provider,
            reply,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            reset_reason,
        })
    }

    /// Decide whether and why this turn starts a fresh agent session.
    fn resolve_reset_reason(
        &self,
        message: &NormalizedMessage,
        existing: Option<&ThreadRecord>,
        directive: Option<&ResetDirective>,
    ) -> Option<String> {
        if let Some(directive) = directive {
            return Some(format!("trigger:{}", directive.trigger));
        }

        let record = existing?;
        let policy = self
            .options
            .resolve_policy(&message.channel, SessionType::of(message));
        if policy.is_off() {
            return None;
        }
        let updated_ms = parse_iso_ms(&record.updated_at)?;
        lifecycle::evaluate_expiry(updated_ms, Utc::now(), &policy)
            .map(|reason| format!("{}_expiry", reason.as_str()))
    }

    /// Provider precedence: trigger retarget, inbound override, stored, default.
    fn resolve_provider(
        &self,
        message: &NormalizedMessage,
        existing: Option<&ThreadRecord>,
        directive: Option<&ResetDirective>,
    ) -> Provider {
        if let Some(provider) = directive.and_then(|d| d.provider_override) {
            return provider;
        }
        if let Some(provider) = message
            .provider
            .as_deref()
            .and_then(|token| Provider::parse(token).ok())
        {
            return provider;
        }
        if let Some(record) = existing {
            if let Ok(provider) = Provider::parse(&record.provider) {
                return provider;
            }
        }
        self.options.provider
    }

    /// Model precedence: trigger retarget, stored (same provider), default.
    fn resolve_model(
        &self,
        provider: Provider,
        existing: Option<&ThreadRecord>,
        directive: Option<&ResetDirective>,
    ) -> Option<String> {
        if let Some(directive) = directive {
            if directive.model_override.is_some() {
                return directive.model_override.clone();
            }
            if directive.provider_override.is_some() {
                // Retargeting the provider without a model uses its default.
                return None;
            }
        }
        if let Some(record) = existing {
            if Provider::parse(&record.provider).ok() == Some(provider) && record.model.is_some() {
                return record.model.clone();
            }
        }
        self.options.model.clone()
    }

    /// Create or refresh the thread record after a completed turn.
    async fn upsert_record(
        &self,
        thread_id: &str,
        message: &NormalizedMessage,
        routing_mode: RoutingMode,
        existing: Option<ThreadRecord>,
    ) -> Result<ThreadRecord> {
        let runtime = self
            .registry
            .current(thread_id)
            .await
            .ok_or_else(|| AppError::Agent("runtime vanished before record upsert".into()))?;

        let now = now_iso();
        let record = match existing {
            Some(mut record) => {
                record.provider = runtime.provider.hint().to_owned();
                record.provider_thread_id.clone_from(&runtime.provider_thread_id);
                record.model.clone_from(&runtime.model);
                record.mcp_profile_ids.clone_from(&runtime.mcp_profile_ids);
                record.updated_at = now;
                record
            }
            None => ThreadRecord {
                thread_id: thread_id.to_owned(),
                routing_mode,
                provider: runtime.provider.hint().to_owned(),
                provider_thread_id: runtime.provider_thread_id.clone(),
                model: runtime.model.clone(),
                mcp_profile_ids: runtime.mcp_profile_ids.clone(),
                channel: message.channel.clone(),
                user_id: message.user_id.clone(),
                chat_type: message.chat_type,
                peer_id: message.peer_id.clone(),
                account_id: if message.account_id == "default" {
                    None
                } else {
                    Some(message.account_id.clone())
                },
                identity_id: message.identity_id.clone(),
                channel_thread_id: message.channel_thread_id.clone(),
                created_at: now.clone(),
                updated_at: now,
            },
        };

        self.store.upsert(record.clone()).await?;
        Ok(record)
    }
}

/// Whether an agent error qualifies for the one-shot model fallback.
///
/// Substring heuristic: the lowercased error text must reference the
/// requested model and contain one of the marker phrases.
fn should_fallback_model(error: &AppError, model: Option<&str>) -> bool {
    let Some(model) = model else {
        return false;
    };
    if model.is_empty() {
        return false;
    }
    let text = error.to_string().to_lowercase();
    text.contains(&model.to_lowercase())
        && MODEL_FALLBACK_MARKERS.iter().any(|m| text.contains(m))
}
