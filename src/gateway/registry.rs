//! Per-thread runtime registry and turn execution.
//!
//! The registry owns every live agent runtime, keyed by thread id. It is
//! mutated only from per-thread queue drains (and `close_all` at shutdown),
//! so a single async lock guards the map and is never held across a spawn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::GatewayOptions;
use crate::models::event::AgentEvent;
use crate::protocol::peer::{AgentNotification, PeerOptions, RpcPeer};
use crate::protocol::provider::{
    thread_resume_params, thread_start_params, turn_start_params, Provider, ThreadStartOptions,
};
use crate::protocol::spawner::spawn_agent;
use crate::protocol::stderr::{self, StderrRing};
use crate::protocol::translator::EventTranslator;
use crate::{profiles, AppError, Result};

/// Per-turn inactivity limit; any agent event resets the timer.
pub const TURN_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// What the caller wants the runtime for a thread to look like.
#[derive(Debug, Clone)]
pub struct DesiredRuntime {
    /// Provider the turn targets.
    pub provider: Provider,
    /// Model to request; provider default when absent.
    pub model: Option<String>,
    /// Normalized MCP profile ids.
    pub mcp_profile_ids: Vec<String>,
    /// Destroy any existing runtime first (session reset).
    pub force_new_session: bool,
    /// Suppress the model field entirely (model fallback).
    pub force_default_model: bool,
}

/// Live pairing of an agent child and the peer driving it.
pub struct ThreadRuntime {
    /// Protocol peer over the child's stdio.
    pub peer: RpcPeer,
    /// Provider the child was spawned for.
    pub provider: Provider,
    /// Agent-side session id.
    pub provider_thread_id: String,
    /// Model the session was started with.
    pub model: Option<String>,
    /// Profile ids the session was composed from.
    pub mcp_profile_ids: Vec<String>,
    /// Turn currently executing, for interrupts.
    current_turn: std::sync::Mutex<Option<String>>,
}

impl std::fmt::Debug for ThreadRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRuntime")
            .field("provider", &self.provider)
            .field("provider_thread_id", &self.provider_thread_id)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Result of one executed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Concatenated text deltas, in emission order.
    pub reply: String,
    /// Usage payload from the terminal `done` event, when present.
    pub usage: Option<Value>,
}

/// Pool of live runtimes keyed by thread id.
pub struct RuntimeRegistry {
    options: Arc<GatewayOptions>,
    runtimes: Mutex<HashMap<String, Arc<ThreadRuntime>>>,
}

impl RuntimeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(options: Arc<GatewayOptions>) -> Self {
        Self {
            options,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Return a live runtime for `thread_id`, creating one when needed.
    ///
    /// Recycling rules, in order: `force_new_session` closes any existing
    /// runtime; a provider mismatch keeps the existing runtime (providers
    /// are never switched silently mid-thread); an MCP profile mismatch
    /// recycles; a dead peer recycles; otherwise the existing runtime is
    /// reused.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`] when the Codex configuration is invalid
    /// and a Codex runtime is requested, or when spawn/handshake/session
    /// creation fails.
    pub async fn ensure_runtime(
        &self,
        thread_id: &str,
        desired: &DesiredRuntime,
        stored_provider_thread_id: Option<&str>,
    ) -> Result<Arc<ThreadRuntime>> {
        let existing = {
            let mut runtimes = self.runtimes.lock().await;
            match runtimes.get(thread_id).cloned() {
                Some(runtime) if desired.force_new_session => {
                    runtime.peer.close();
                    runtimes.remove(thread_id);
                    None
                }
                Some(runtime) if runtime.peer.is_closed() => {
                    runtimes.remove(thread_id);
                    None
                }
                Some(runtime) if runtime.provider != desired.provider => {
                    warn!(
                        thread_id,
                        existing = runtime.provider.hint(),
                        requested = desired.provider.hint(),
                        "provider mismatch; keeping existing runtime"
                    );
                    Some(runtime)
                }
                Some(runtime) if runtime.mcp_profile_ids != desired.mcp_profile_ids => {
                    info!(thread_id, "MCP profiles changed; recycling runtime");
                    runtime.peer.close();
                    runtimes.remove(thread_id);
                    None
                }
                existing => existing,
            }
        };

        if let Some(runtime) = existing {
            return Ok(runtime);
        }

        let resume_id = if desired.force_new_session {
            None
        } else {
            stored_provider_thread_id
        };
        let runtime = Arc::new(self.spawn_runtime(thread_id, desired, resume_id).await?);

        let mut runtimes = self.runtimes.lock().await;
        runtimes.insert(thread_id.to_owned(), Arc::clone(&runtime));
        Ok(runtime)
    }

    /// Spawn the child, run the handshake, and create or resume the session.
    async fn spawn_runtime(
        &self,
        thread_id: &str,
        desired: &DesiredRuntime,
        resume_id: Option<&str>,
    ) -> Result<ThreadRuntime> {
        if desired.provider == Provider::Codex {
            if let Some(ref msg) = self.options.codex_config_error {
                return Err(AppError::Agent(format!(
                    "codex configuration invalid: {msg}"
                )));
            }
        }

        let mut servers = profiles::compose(&desired.mcp_profile_ids, &self.options.settings)
            .map_err(|e| AppError::Agent(e.to_string()))?;
        if self.options.memory_enabled {
            let alias = profiles::merge_memory_server(&mut servers, profiles::memory_server_config());
            debug!(thread_id, alias, "merged built-in memory server");
        }

        let command = self.options.agent_command(desired.provider);
        let spawned = spawn_agent(&command)?;

        let ring = StderrRing::new();
        let _stderr_task = stderr::drain(thread_id.to_owned(), spawned.stderr, ring.clone());

        let peer_options = PeerOptions {
            approval_decision: self.options.approval_decision,
            ..PeerOptions::default()
        };
        let peer = RpcPeer::start(spawned.stdin, spawned.stdout, &peer_options);
        monitor_exit(thread_id.to_owned(), spawned.child, peer.clone(), ring);

        peer.initialize(&peer_options).await?;

        let model = if desired.force_default_model {
            None
        } else {
            desired.model.clone()
        };
        let start_options = ThreadStartOptions {
            model: model.clone(),
            cwd: command.cwd.as_ref().map(|p| p.display().to_string()),
            approval_policy: if desired.provider == Provider::Codex {
                self.options.settings.codex.approval_policy.clone()
            } else {
                None
            },
            sandbox_mode: if desired.provider == Provider::Codex {
                self.options.settings.codex.sandbox_mode.clone()
            } else {
                None
            },
            mcp_servers: servers,
            ..ThreadStartOptions::default()
        };

        let session = self
            .open_session(thread_id, &peer, desired.provider, resume_id, &start_options)
            .await?;

        let provider_thread_id = session
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                AppError::Protocol("thread/start result is missing thread.id".into())
            })?;

        info!(
            thread_id,
            provider = desired.provider.hint(),
            provider_thread_id,
            resumed = resume_id.is_some(),
            "agent session ready"
        );

        Ok(ThreadRuntime {
            peer,
            provider: desired.provider,
            provider_thread_id,
            model,
            mcp_profile_ids: desired.mcp_profile_ids.clone(),
            current_turn: std::sync::Mutex::new(None),
        })
    }

    /// Resume the stored session, falling back to a fresh start on failure.
    async fn open_session(
        &self,
        thread_id: &str,
        peer: &RpcPeer,
        provider: Provider,
        resume_id: Option<&str>,
        options: &ThreadStartOptions,
    ) -> Result<Value> {
        if let Some(resume_id) = resume_id {
            match peer
                .request(
                    "thread/resume",
                    thread_resume_params(provider, resume_id, options),
                )
                .await
            {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(
                        thread_id,
                        error = %e,
                        "thread/resume failed; starting a fresh session"
                    );
                }
            }
        }

        peer.request("thread/start", thread_start_params(provider, options))
            .await
    }

    /// Execute one turn on `runtime`, streaming translated events.
    ///
    /// Text deltas are concatenated into the reply; all events are forwarded
    /// to `on_event` when supplied. A 120-second inactivity watchdog sends
    /// `turn/interrupt` and fails the turn when no event arrives in time.
    /// The stream is always consumed to its terminal event.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`] on terminal error events, watchdog
    /// expiry, or child exit mid-turn.
    pub async fn run_turn(
        &self,
        runtime: &ThreadRuntime,
        text: &str,
        on_event: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<TurnOutcome> {
        let mut stream = runtime.peer.subscribe();

        let turn = runtime
            .peer
            .request(
                "turn/start",
                turn_start_params(
                    &runtime.provider_thread_id,
                    text,
                    runtime.model.as_deref(),
                ),
            )
            .await?;

        let turn_id = turn
            .get("turn")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        if let Ok(mut current) = runtime.current_turn.lock() {
            current.clone_from(&turn_id);
        }

        let outcome = self
            .consume_turn_stream(runtime, &mut stream, turn_id.as_deref(), on_event)
            .await;

        if let Ok(mut current) = runtime.current_turn.lock() {
            *current = None;
        }

        outcome
    }

    /// Drive the event stream for one turn until a terminal event.
    async fn consume_turn_stream(
        &self,
        runtime: &ThreadRuntime,
        stream: &mut crate::protocol::peer::NotificationStream,
        turn_id: Option<&str>,
        on_event: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<TurnOutcome> {
        let mut translator = EventTranslator::new();
        let mut reply = String::new();
        let mut usage = None;
        let mut error_message: Option<String> = None;
        let mut deadline = tokio::time::Instant::now() + TURN_INACTIVITY_TIMEOUT;

        loop {
            let notification: Option<AgentNotification> = tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    self.interrupt_runtime(runtime, turn_id).await;
                    return Err(AppError::Agent(format!(
                        "no activity for {} s",
                        TURN_INACTIVITY_TIMEOUT.as_secs()
                    )));
                }
                notification = stream.recv() => notification,
            };

            let Some(notification) = notification else {
                return Err(AppError::Agent(
                    "agent stream ended before the turn completed".into(),
                ));
            };

            // Every notification counts as activity, translated or not.
            deadline = tokio::time::Instant::now() + TURN_INACTIVITY_TIMEOUT;

            let Some(event) = translator.translate(&notification) else {
                continue;
            };

            if let AgentEvent::Text { ref delta } = event {
                reply.push_str(delta);
            }
            if let AgentEvent::Done { usage: ref u } = event {
                usage.clone_from(u);
            }
            if let AgentEvent::Error { ref message } = event {
                error_message = Some(message.clone());
            }

            let terminal = event.is_terminal();
            if let Some(tx) = on_event {
                let _ = tx.send(event).await;
            }

            if terminal {
                break;
            }
        }

        match error_message {
            Some(message) => Err(AppError::Agent(message)),
            None => Ok(TurnOutcome { reply, usage }),
        }
    }

    /// Best-effort `turn/interrupt` for a runtime's current turn.
    async fn interrupt_runtime(&self, runtime: &ThreadRuntime, turn_id: Option<&str>) {
        let params = serde_json::json!({
            "threadId": runtime.provider_thread_id,
            "turnId": turn_id,
        });
        if let Err(e) = runtime.peer.request("turn/interrupt", params).await {
            debug!(error = %e, "turn/interrupt failed");
        }
    }

    /// Interrupt the active turn on `thread_id`, if any runtime is live.
    ///
    /// Best-effort: the runtime is not torn down. Returns `false` when no
    /// runtime exists.
    pub async fn interrupt(&self, thread_id: &str) -> bool {
        let runtime = {
            let runtimes = self.runtimes.lock().await;
            runtimes.get(thread_id).cloned()
        };
        let Some(runtime) = runtime else {
            return false;
        };

        let turn_id = runtime
            .current_turn
            .lock()
            .ok()
            .and_then(|current| current.clone());
        self.interrupt_runtime(&runtime, turn_id.as_deref()).await;
        true
    }

    /// Current runtime for a thread id, if live.
    pub async fn current(&self, thread_id: &str) -> Option<Arc<ThreadRuntime>> {
        self.runtimes.lock().await.get(thread_id).cloned()
    }

    /// Close and remove the runtime for `thread_id`, if present.
    pub async fn close(&self, thread_id: &str) {
        let mut runtimes = self.runtimes.lock().await;
        if let Some(runtime) = runtimes.remove(thread_id) {
            runtime.peer.close();
        }
    }

    /// Close every runtime (gateway shutdown).
    pub async fn close_all(&self) {
        let mut runtimes = self.runtimes.lock().await;
        for (thread_id, runtime) in runtimes.drain() {
            debug!(thread_id, "closing runtime");
            runtime.peer.close();
        }
    }

    /// Number of live runtimes.
    pub async fn live_count(&self) -> usize {
        self.runtimes.lock().await.len()
    }
}

/// Watch the child for exit; fail the peer with the stderr tail when it
/// dies, kill it when the peer is closed first.
fn monitor_exit(thread_id: String, mut child: tokio::process::Child, peer: RpcPeer, ring: StderrRing) {
    let cancel = peer.cancel_token();
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let code = match result {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!(thread_id, %err, "error waiting for agent child");
                        None
                    }
                };
                let tail = ring.tail();
                let mut reason = match code {
                    Some(code) => format!("agent exited with code {code}"),
                    None => "agent terminated by signal".to_owned(),
                };
                if !tail.is_empty() {
                    reason.push_str("; stderr: ");
                    reason.push_str(&tail);
                }
                warn!(thread_id, reason = reason.as_str(), "agent child exited");
                peer.shutdown(&reason);
            }
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!(thread_id, "agent child killed on close");
            }
        }
    });
}
