//! Per-turn state machine (§4.5):
//!
//! `IDLE -> ASSEMBLING -> STREAMING -> {TOOLS_PENDING|FINAL}`, with
//! `TOOLS_PENDING -> EXECUTING_TOOLS -> STREAMING` looping until the model
//! stops requesting tools or `max_tool_rounds` is exhausted, then
//! `FINAL -> PERSISTING -> IDLE`. Any state can fall to `ERROR -> IDLE`,
//! which publishes `AGENT_ERROR` and leaves the session's persisted history
//! exactly as it was before the turn started.
//!
//! Iterates until the model stops requesting tools, streaming deltas through
//! the Event Bus rather than collecting one assembled response, and running
//! independent tool calls within a round concurrently.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use relay_core::error::RelayError;
use relay_core::types::{
    Event, EventType, Importance, Message, PermissionClass, Role, SessionId, ToolCallRef,
    ToolResultRef,
};
use relay_providers::{
    ChatDelta, ChatOptions, ChatRequest, Message as ProviderMessage, ProviderRouter,
    Role as ProviderRole, SystemContent, ToolDefinition,
};
use relay_sessions::{CompactionBudget, SessionStore, Summarizer};
use relay_tools::{ToolContext, ToolRegistry};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::estimator::TokenEstimator;
use crate::prompt::{truncate_content, PromptBuilder, SessionInfo};

/// Bound on tool-result text injected back into the conversation, beyond
/// which it's truncated before being stored and re-sent (§4.2, §4.3).
const MAX_TOOL_RESULT_CHARS: usize = 8_000;

/// Runtime-wide constants an `AgentRuntime` is built from. A superset of what
/// `relay_core::config::RuntimeEnvConfig` carries, plus the model name(s) the
/// router is already wired to — the router owns credential rotation, this
/// config only needs to know the name to put on outgoing requests.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub max_context_tokens: u32,
    pub keep_recent: usize,
    pub max_tool_rounds: u32,
    pub session_queue_bound: usize,
    pub model: String,
    pub max_tokens: u32,
}

impl From<&relay_core::config::RuntimeEnvConfig> for TurnConfig {
    fn from(c: &relay_core::config::RuntimeEnvConfig) -> Self {
        Self {
            max_context_tokens: c.max_context_tokens,
            keep_recent: c.keep_recent,
            max_tool_rounds: c.max_tool_rounds,
            session_queue_bound: c.session_queue_bound,
            model: c.default_model.clone(),
            max_tokens: 4096,
        }
    }
}

/// Outcome of a completed (or cancelled) turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub final_text: String,
    pub cancelled: bool,
    pub used_fallback: bool,
    pub tool_rounds: u32,
    pub generated_files: Vec<relay_tools::GeneratedFile>,
}

/// Per-session serialization: one turn runs at a time; additional callers
/// queue FIFO behind the semaphore up to `session_queue_bound`, beyond which
/// `run_turn` fails fast with [`RelayError::SessionBusy`].
struct SessionLock {
    semaphore: Semaphore,
    queued: AtomicUsize,
}

impl SessionLock {
    fn new() -> Self {
        Self { semaphore: Semaphore::new(1), queued: AtomicUsize::new(0) }
    }
}

/// Drives the per-turn state machine against the Session Store, Tool
/// Registry, Provider Router, and Event Bus of one `RuntimeEnv`.
pub struct AgentRuntime {
    sessions: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    router: Arc<ProviderRouter>,
    bus: Arc<relay_bus::EventBus>,
    prompt_builder: PromptBuilder,
    estimator: Arc<dyn TokenEstimator>,
    config: TurnConfig,
    locks: DashMap<SessionId, Arc<SessionLock>>,
    source: String,
}

impl AgentRuntime {
    pub fn new(
        sessions: Arc<SessionStore>,
        tools: Arc<ToolRegistry>,
        router: Arc<ProviderRouter>,
        bus: Arc<relay_bus::EventBus>,
        prompt_builder: PromptBuilder,
        estimator: Arc<dyn TokenEstimator>,
        config: TurnConfig,
        source: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            tools,
            router,
            bus,
            prompt_builder,
            estimator,
            config,
            locks: DashMap::new(),
            source: source.into(),
        }
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<SessionLock> {
        self.locks.entry(session_id.clone()).or_insert_with(|| Arc::new(SessionLock::new())).clone()
    }

    fn emit(&self, event_type: EventType, session_id: &SessionId, data: serde_json::Value) {
        self.bus.publish(Event::new(event_type, &self.source, data).with_session(session_id.clone()));
    }

    /// Acquire the per-session slot (queueing FIFO, failing fast past the
    /// bound) and run one turn to completion.
    pub async fn run_turn(
        &self,
        session_id: SessionId,
        workspace_dir: PathBuf,
        user_text: String,
        cancellation: CancellationToken,
    ) -> Result<TurnOutcome, RelayError> {
        let lock = self.lock_for(&session_id);

        let queued = lock.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if queued > self.config.session_queue_bound {
            lock.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::SessionBusy { session_id: session_id.to_string() });
        }

        let _permit = lock.semaphore.acquire().await.expect("session semaphore never closes");
        lock.queued.fetch_sub(1, Ordering::SeqCst);

        self.run_turn_locked(&session_id, &workspace_dir, user_text, cancellation).await
    }

    async fn run_turn_locked(
        &self,
        session_id: &SessionId,
        workspace_dir: &PathBuf,
        user_text: String,
        cancellation: CancellationToken,
    ) -> Result<TurnOutcome, RelayError> {
        self.emit(EventType::AgentStart, session_id, serde_json::json!({ "input_chars": user_text.len() }));

        let user_message = text_message(Role::User, user_text, &*self.estimator);
        self.sessions.append(session_id, user_message).await;

        match self.drive(session_id, workspace_dir, cancellation.clone()).await {
            Ok(outcome) => {
                self.emit(
                    EventType::AgentDone,
                    session_id,
                    serde_json::json!({ "cancelled": outcome.cancelled, "used_fallback": outcome.used_fallback }),
                );
                Ok(outcome)
            }
            Err(err) => {
                self.emit(
                    EventType::AgentError,
                    session_id,
                    serde_json::json!({ "code": err.code(), "message": err.to_string(), "recovered": false }),
                );
                Err(err)
            }
        }
    }

    /// ASSEMBLING -> STREAMING -> {TOOLS_PENDING -> EXECUTING_TOOLS -> STREAMING}* -> FINAL -> PERSISTING.
    async fn drive(
        &self,
        session_id: &SessionId,
        workspace_dir: &PathBuf,
        cancellation: CancellationToken,
    ) -> Result<TurnOutcome, RelayError> {
        let tool_catalog = self.tools.describe_for_provider();
        let tool_defs: Vec<ToolDefinition> = tool_catalog
            .iter()
            .map(|d| ToolDefinition {
                name: d["name"].as_str().unwrap_or_default().to_string(),
                description: d["description"].as_str().unwrap_or_default().to_string(),
                input_schema: d["input_schema"].clone(),
            })
            .collect();
        let catalog_text = tool_defs
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n");

        let mut used_fallback = false;
        let mut tool_rounds = 0u32;
        let mut budget_exhausted_notice_sent = false;

        loop {
            info!(session_id = %session_id, round = tool_rounds, "assembling prompt");
            let budget = CompactionBudget {
                max_context_tokens: self.config.max_context_tokens,
                keep_recent: self.config.keep_recent,
            };
            let summarizer = RouterSummarizer { router: self.router.clone(), model: self.config.model.clone() };
            let view = self.sessions.compacted_view(session_id, budget, &summarizer).await;

            let turn_count = view.messages.iter().filter(|m| m.role == Role::User).count() as u32;
            let session_info = SessionInfo {
                session_id: session_id.to_string(),
                turn_count,
                timestamp: chrono::Utc::now().to_rfc3339(),
            };
            let allow_tools = tool_rounds < self.config.max_tool_rounds;
            let prompt = self.prompt_builder.build(if allow_tools { &catalog_text } else { "" }, &session_info);

            let messages: Vec<ProviderMessage> = view.messages.iter().map(to_provider_message).collect();

            let req = ChatRequest {
                system: SystemContent::CacheTiered(prompt.to_anthropic_blocks()),
                messages,
                tools: if allow_tools { tool_defs.clone() } else { Vec::new() },
                options: ChatOptions {
                    model: self.config.model.clone(),
                    max_tokens: self.config.max_tokens,
                    temperature: None,
                    thinking: false,
                },
            };

            info!(session_id = %session_id, round = tool_rounds, "streaming");
            let stream = self.stream_once(session_id, &req, &cancellation).await?;
            used_fallback = used_fallback || stream.used_fallback;

            if stream.cancelled {
                let mut partial = text_message(Role::Assistant, stream.text.clone(), &*self.estimator);
                partial.content = format!("{} [cancelled]", partial.content);
                self.sessions.append(session_id, partial).await;
                return Ok(TurnOutcome {
                    final_text: stream.text,
                    cancelled: true,
                    used_fallback,
                    tool_rounds,
                    generated_files: Vec::new(),
                });
            }

            if stream.tool_calls.is_empty() {
                let assistant = text_message(Role::Assistant, stream.text.clone(), &*self.estimator);
                self.sessions.append(session_id, assistant).await;
                return Ok(TurnOutcome {
                    final_text: stream.text,
                    cancelled: false,
                    used_fallback,
                    tool_rounds,
                    generated_files: Vec::new(),
                });
            }

            if tool_rounds >= self.config.max_tool_rounds {
                if budget_exhausted_notice_sent {
                    // Already told the model its tool budget is gone and gave it
                    // one more round; a second request for tools means we stop
                    // forcing the issue and just return what we have.
                    let assistant = text_message(Role::Assistant, stream.text.clone(), &*self.estimator);
                    self.sessions.append(session_id, assistant).await;
                    return Ok(TurnOutcome {
                        final_text: stream.text,
                        cancelled: false,
                        used_fallback,
                        tool_rounds,
                        generated_files: Vec::new(),
                    });
                }
                warn!(session_id = %session_id, max_tool_rounds = self.config.max_tool_rounds, "tool round budget exhausted");
                let notice = Message {
                    role: Role::System,
                    content: "Tool call budget for this turn is exhausted. Respond with your best answer using only what you already know.".to_string(),
                    tool_calls: Vec::new(),
                    tool_result: None,
                    timestamp: chrono::Utc::now(),
                    token_estimate: self.estimator.estimate("tool budget exhausted"),
                    importance: Importance::High,
                };
                self.sessions.append(session_id, notice).await;
                budget_exhausted_notice_sent = true;
                continue;
            }

            info!(session_id = %session_id, round = tool_rounds, calls = stream.tool_calls.len(), "executing tools");
            let assistant_with_calls = Message {
                role: Role::Assistant,
                content: stream.text.clone(),
                tool_calls: stream.tool_calls.clone(),
                tool_result: None,
                timestamp: chrono::Utc::now(),
                token_estimate: self.estimator.estimate(&stream.text),
                importance: Importance::Normal,
            };
            self.sessions.append(session_id, assistant_with_calls).await;

            let (results, generated_files) =
                self.execute_tools(session_id, workspace_dir, &stream.tool_calls, &cancellation).await;
            for (call, result) in stream.tool_calls.iter().zip(results.iter()) {
                let mut value = result.value.clone().unwrap_or(serde_json::Value::Null);
                let rendered = truncate_content(&value.to_string(), MAX_TOOL_RESULT_CHARS);
                if rendered != value.to_string() {
                    value = serde_json::Value::String(rendered);
                }
                let tool_message = Message {
                    role: Role::Tool,
                    content: if result.ok {
                        value.to_string()
                    } else {
                        result.message.clone().unwrap_or_else(|| "tool failed".to_string())
                    },
                    tool_calls: Vec::new(),
                    tool_result: Some(ToolResultRef { tool_call_id: call.id.clone(), ok: result.ok, value }),
                    timestamp: chrono::Utc::now(),
                    token_estimate: self.estimator.estimate(&result.message.clone().unwrap_or_default()),
                    importance: Importance::Normal,
                };
                self.sessions.append(session_id, tool_message).await;
            }

            if !generated_files.is_empty() {
                self.emit(
                    EventType::AgentFileGenerated,
                    session_id,
                    serde_json::json!({ "files": generated_files }),
                );
            }

            if cancellation.is_cancelled() {
                return Ok(TurnOutcome {
                    final_text: stream.text,
                    cancelled: true,
                    used_fallback,
                    tool_rounds: tool_rounds + 1,
                    generated_files,
                });
            }

            tool_rounds += 1;
        }
    }

    /// Run independent tool calls (all `side_effects == None`) concurrently;
    /// anything else runs sequentially in call order (§4.5).
    async fn execute_tools(
        &self,
        session_id: &SessionId,
        workspace_dir: &PathBuf,
        calls: &[ToolCallRef],
        cancellation: &CancellationToken,
    ) -> (Vec<relay_tools::ToolResult>, Vec<relay_tools::GeneratedFile>) {
        let all_side_effect_free = calls.iter().all(|c| {
            self.tools
                .get(&c.name)
                .map(|t| t.descriptor().side_effects == relay_core::types::SideEffects::None)
                .unwrap_or(false)
        });

        let ctx_for = |call: &ToolCallRef| -> ToolContext {
            self.emit(
                EventType::AgentToolCall,
                session_id,
                serde_json::json!({ "id": call.id, "name": call.name, "arguments": call.arguments }),
            );
            ToolContext {
                session_id: session_id.clone(),
                workspace_dir: workspace_dir.clone(),
                cancellation: cancellation.clone(),
                permission_grant: PermissionClass::Admin,
            }
        };

        let mut results = Vec::with_capacity(calls.len());
        let mut generated_files = Vec::new();

        if all_side_effect_free && calls.len() > 1 {
            let futures = calls.iter().map(|call| {
                let ctx = ctx_for(call);
                let tools = self.tools.clone();
                let name = call.name.clone();
                let arguments = call.arguments.clone();
                async move {
                    tools.invoke(&name, arguments, &ctx).await.unwrap_or_else(|e| {
                        relay_tools::ToolResult::err("tool_error", e.to_string())
                    })
                }
            });
            results = futures_util::future::join_all(futures).await;
        } else {
            for call in calls {
                let ctx = ctx_for(call);
                let result = self
                    .tools
                    .invoke(&call.name, call.arguments.clone(), &ctx)
                    .await
                    .unwrap_or_else(|e| relay_tools::ToolResult::err("tool_error", e.to_string()));
                results.push(result);
            }
        }

        for (call, result) in calls.iter().zip(results.iter()) {
            self.emit(
                EventType::AgentToolResult,
                session_id,
                serde_json::json!({ "id": call.id, "name": call.name, "ok": result.ok }),
            );
            if let Some(file) = &result.generated_file {
                generated_files.push(file.clone());
            }
        }

        (results, generated_files)
    }

    /// Stream one model response, accumulating text and tool calls and
    /// relaying `AGENT_TEXT` as chunks arrive. Aborts at the next delta once
    /// `cancellation` fires; tool calls already fully received are still
    /// returned so the caller can decide what's salvageable.
    async fn stream_once(
        &self,
        session_id: &SessionId,
        req: &ChatRequest,
        cancellation: &CancellationToken,
    ) -> Result<StreamOutcome, RelayError> {
        let (tx, mut rx) = mpsc::channel(64);
        let router = self.router.clone();
        let req_owned = req.clone();
        let send_task = tokio::spawn(async move { router.stream_chat(&req_owned, tx).await });

        let mut acc = StreamOutcome::default();
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    acc.cancelled = true;
                    break;
                }
                delta = rx.recv() => {
                    match delta {
                        Some(d) => self.apply_delta(session_id, &mut acc, d),
                        None => break,
                    }
                }
            }
        }

        match send_task.await {
            Ok(Ok(outcome)) => {
                acc.used_fallback = outcome.used_fallback;
                Ok(acc)
            }
            Ok(Err(e)) if acc.cancelled => {
                let _ = e;
                Ok(acc)
            }
            Ok(Err(e)) => Err(RelayError::ProviderError(e.to_string())),
            Err(join_err) => Err(RelayError::Internal(format!("provider task panicked: {join_err}"))),
        }
    }

    fn apply_delta(&self, session_id: &SessionId, acc: &mut StreamOutcome, delta: ChatDelta) {
        match delta {
            ChatDelta::TextChunk { text } => {
                acc.text.push_str(&text);
                self.emit(EventType::AgentText, session_id, serde_json::json!({ "text": text }));
            }
            ChatDelta::ToolCallStart { id, name } => {
                acc.pending.push(PendingCall { id, name, json_buf: String::new() });
            }
            ChatDelta::ToolCallArg { id, json_fragment } => {
                if let Some(p) = acc.pending.iter_mut().find(|p| p.id == id) {
                    p.json_buf.push_str(&json_fragment);
                }
            }
            ChatDelta::ToolCallEnd { id } => {
                if let Some(pos) = acc.pending.iter().position(|p| p.id == id) {
                    let p = acc.pending.remove(pos);
                    let arguments = serde_json::from_str(&p.json_buf).unwrap_or(serde_json::Value::Null);
                    acc.tool_calls.push(ToolCallRef { id: p.id, name: p.name, arguments });
                }
            }
            ChatDelta::UsageReport { tokens_in, tokens_out } => {
                acc.tokens_in = tokens_in;
                acc.tokens_out = tokens_out;
            }
            ChatDelta::ProviderError { kind } => {
                warn!(session_id = %session_id, ?kind, "mid-stream provider error delta");
            }
        }
    }
}

#[derive(Default)]
struct StreamOutcome {
    text: String,
    tool_calls: Vec<ToolCallRef>,
    pending: Vec<PendingCall>,
    cancelled: bool,
    used_fallback: bool,
    tokens_in: u32,
    tokens_out: u32,
}

struct PendingCall {
    id: String,
    name: String,
    json_buf: String,
}

fn text_message(role: Role, content: String, estimator: &dyn TokenEstimator) -> Message {
    let token_estimate = estimator.estimate(&content);
    Message {
        role,
        content,
        tool_calls: Vec::new(),
        tool_result: None,
        timestamp: chrono::Utc::now(),
        token_estimate,
        importance: Importance::Normal,
    }
}

fn to_provider_message(m: &Message) -> ProviderMessage {
    let role = match m.role {
        Role::User => ProviderRole::User,
        Role::Assistant => ProviderRole::Assistant,
        Role::Tool => ProviderRole::User,
        Role::System => ProviderRole::System,
    };
    ProviderMessage { role, content: m.content.clone() }
}

/// Bridges `relay-sessions`'s synchronous [`Summarizer`] contract to an async
/// provider call. `relay-sessions` can't depend on `relay-providers` (that
/// would be a needless coupling for a crate whose compaction logic doesn't
/// care how summarization happens), so this struct lives here instead, where
/// both are already in scope.
///
/// `block_in_place` + `Handle::block_on` requires a multi-threaded Tokio
/// runtime; the gateway binary is built on one for exactly this reason.
struct RouterSummarizer {
    router: Arc<ProviderRouter>,
    model: String,
}

impl Summarizer for RouterSummarizer {
    fn summarize(&self, dropped_prefix: &str) -> String {
        let router = self.router.clone();
        let model = self.model.clone();
        let prompt = format!(
            "Summarize the conversation below in a few sentences, preserving facts, decisions, and open questions a future turn would need:\n\n{dropped_prefix}"
        );

        let handle = tokio::runtime::Handle::current();
        tokio::task::block_in_place(move || {
            handle.block_on(async move {
                let req = ChatRequest {
                    system: SystemContent::Plain(
                        "You compress conversation history for context-window compaction. Be concise.".to_string(),
                    ),
                    messages: vec![ProviderMessage { role: ProviderRole::User, content: prompt }],
                    tools: Vec::new(),
                    options: ChatOptions { model, max_tokens: 512, temperature: None, thinking: false },
                };

                let (tx, mut rx) = mpsc::channel(32);
                let send = router.stream_chat(&req, tx);
                let collect = async {
                    let mut text = String::new();
                    while let Some(delta) = rx.recv().await {
                        if let ChatDelta::TextChunk { text: chunk } = delta {
                            text.push_str(&chunk);
                        }
                    }
                    text
                };
                let (result, text) = tokio::join!(send, collect);
                match result {
                    Ok(_) if !text.is_empty() => text,
                    _ => {
                        warn!("compaction summarizer call failed or returned nothing, falling back to a truncated prefix");
                        truncate_content(dropped_prefix, 400)
                    }
                }
            })
        })
    }
}
