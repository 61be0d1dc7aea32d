//! Channel Manager (§4.7): owns every registered adapter, drives its
//! lifecycle state machine, enforces DM pairing, and bridges inbound
//! messages into the Agent Runtime — subscribing to that turn's own events
//! so assistant text and generated files stream back out through the
//! adapter as they arrive.
//!
//! Register/connect-all/disconnect-all shape with a backoff-with-jitter
//! reconnect helper, generalized to the full `UNINIT..FAILED` state machine;
//! backoff constants (1s base, 60s cap, ±20% jitter) are sourced from
//! `relay_core::config` so the numbers live in one place.
//!
//! Every lifecycle transition and every message actually handed to or
//! received from an adapter is also published onto the shared Event Bus
//! (`CHANNEL_STATE_CHANGED`, `CHANNEL_ERROR`, `CHANNEL_MESSAGE_IN`,
//! `CHANNEL_MESSAGE_OUT`) so the Gateway's WebSocket fan-out and any other
//! subscriber can observe a channel's traffic without polling `list_status`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_bus::EventBus;
use relay_core::config::{
    ChannelEntryConfig, DmPolicy, RECONNECT_BASE_SECS, RECONNECT_CAP_SECS, RECONNECT_FACTOR,
    RECONNECT_JITTER_FRACTION,
};
use relay_core::types::{ChannelState, Event, EventType, SessionId};
use relay_runtime::AgentRuntime;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::pairing::PairingStore;
use crate::types::{InboundMessage, MediaAttachment, MessageFormat, OutboundMessage};

/// Assistant text is flushed to the adapter at a sentence boundary or after
/// this much idle time, whichever comes first (§4.7).
const BATCH_TIMEOUT: Duration = Duration::from_millis(400);

struct ChannelEntry {
    channel: Arc<dyn Channel>,
    config: ChannelEntryConfig,
    state: Mutex<ChannelState>,
    pairing: Option<PairingStore>,
}

/// Maps `channel_id -> adapter` and drives registration, lifecycle, and
/// inbound dispatch. One instance per gateway process, shared across
/// `RuntimeEnv`s.
pub struct ChannelManager {
    entries: DashMap<String, Arc<ChannelEntry>>,
    bus: Arc<EventBus>,
}

impl ChannelManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { entries: DashMap::new(), bus }
    }

    /// Publish a channel lifecycle or transport event, scoped to `channel_id`.
    fn publish(&self, event_type: EventType, channel_id: &str, data: serde_json::Value) {
        self.bus.publish(Event::new(event_type, "channel-manager", data).with_channel(channel_id));
    }

    /// Register an adapter. Replaces any previous registration under the
    /// same id (`Channel::id`).
    pub fn register(&self, channel: Arc<dyn Channel>, config: ChannelEntryConfig, workspace_dir: &Path) {
        let id = channel.id().to_string();
        let pairing = matches!(config.dm_policy, DmPolicy::Pairing).then(|| PairingStore::new(workspace_dir, &id));
        info!(channel = %id, dm_policy = ?config.dm_policy, "registering channel adapter");
        self.entries.insert(id, Arc::new(ChannelEntry { channel, config, state: Mutex::new(ChannelState::Uninit), pairing }));
    }

    fn entry(&self, channel_id: &str) -> Result<Arc<ChannelEntry>, ChannelError> {
        self.entries
            .get(channel_id)
            .map(|e| e.clone())
            .ok_or_else(|| ChannelError::ConfigError(format!("unknown channel: {channel_id}")))
    }

    /// Start `channel_id`. A no-op if already `Running` (§4.7 idempotence).
    pub async fn start(&self, channel_id: &str) -> Result<(), ChannelError> {
        let entry = self.entry(channel_id)?;
        {
            if *entry.state.lock().await == ChannelState::Running {
                return Ok(());
            }
        }
        *entry.state.lock().await = ChannelState::Starting;

        let result = async {
            entry.channel.on_init().await?;
            entry.channel.on_start(&entry.config).await?;
            entry.channel.on_ready().await
        }
        .await;

        match result {
            Ok(()) => {
                *entry.state.lock().await = ChannelState::Running;
                info!(channel = %channel_id, "channel started");
                self.publish(EventType::ChannelStateChanged, channel_id, serde_json::json!({"state": "running"}));
                Ok(())
            }
            Err(e) => {
                *entry.state.lock().await = ChannelState::Failed;
                warn!(channel = %channel_id, error = %e, "channel failed to start");
                self.publish(EventType::ChannelStateChanged, channel_id, serde_json::json!({"state": "failed"}));
                self.publish(EventType::ChannelError, channel_id, serde_json::json!({"message": e.to_string(), "during": "start"}));
                Err(e)
            }
        }
    }

    /// Stop `channel_id`. A no-op if already `Stopped`.
    pub async fn stop(&self, channel_id: &str) -> Result<(), ChannelError> {
        let entry = self.entry(channel_id)?;
        {
            if *entry.state.lock().await == ChannelState::Stopped {
                return Ok(());
            }
        }
        *entry.state.lock().await = ChannelState::Stopping;
        if let Err(e) = entry.channel.on_stop().await {
            warn!(channel = %channel_id, error = %e, "error while stopping channel");
            self.publish(EventType::ChannelError, channel_id, serde_json::json!({"message": e.to_string(), "during": "stop"}));
        }
        *entry.state.lock().await = ChannelState::Stopped;
        self.publish(EventType::ChannelStateChanged, channel_id, serde_json::json!({"state": "stopped"}));
        Ok(())
    }

    pub async fn restart(&self, channel_id: &str) -> Result<(), ChannelError> {
        self.stop(channel_id).await?;
        self.start(channel_id).await
    }

    /// Send a plain-text message to `chat_id` on `channel_id`, outside of any
    /// turn's forward loop. Used by the Cron Service's `ChannelSend` action
    /// and any other caller that needs to push text without an inbound
    /// message to answer.
    pub async fn send(&self, channel_id: &str, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let entry = self.entry(channel_id)?;
        entry
            .channel
            .send_text(&OutboundMessage { chat_id: chat_id.to_string(), text: text.to_string(), format: MessageFormat::PlainText })
            .await
    }

    /// Every registered channel's id and current lifecycle state, sorted by
    /// id for deterministic output.
    pub async fn list_status(&self) -> Vec<(String, ChannelState)> {
        let mut out = Vec::with_capacity(self.entries.len());
        for e in self.entries.iter() {
            out.push((e.key().clone(), *e.value().state.lock().await));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Called by an adapter (directly, or via whatever transport-level
    /// signal it wires up) when its connection drops. Moves the channel to
    /// `DEGRADED` and drives the reconnect backoff until `RUNNING` or the
    /// channel is stopped out from under the retry loop.
    pub async fn notify_connection_lost(&self, channel_id: &str) {
        let Ok(entry) = self.entry(channel_id) else { return };
        {
            let mut state = entry.state.lock().await;
            if *state != ChannelState::Running {
                return;
            }
            *state = ChannelState::Degraded;
        }
        entry.channel.on_connection_lost().await;
        warn!(channel = %channel_id, "connection lost, entering degraded reconnect");
        self.publish(EventType::ChannelStateChanged, channel_id, serde_json::json!({"state": "degraded"}));

        let id = channel_id.to_string();
        let bus = self.bus.clone();
        tokio::spawn(async move { reconnect_with_backoff(entry, id, bus).await });
    }

    /// Operator approval (`pairing.approve` RPC, §4.9). Returns the newly
    /// approved sender id, or `None` if the channel has no pairing policy or
    /// the code is unknown/expired.
    pub async fn approve_pairing(&self, channel_id: &str, code: &str) -> Option<String> {
        let entry = self.entry(channel_id).ok()?;
        entry.pairing.as_ref()?.approve(code).await
    }

    /// Normalize, pairing-check, and route one inbound platform update into
    /// the Agent Runtime, streaming the resulting turn's events back out
    /// through the adapter as they arrive.
    pub async fn dispatch_inbound(
        &self,
        channel_id: &str,
        raw: InboundMessage,
        runtime: &AgentRuntime,
        workspace_dir: PathBuf,
    ) -> Result<(), ChannelError> {
        let bus = self.bus.as_ref();
        let entry = self.entry(channel_id)?;

        if let Some(pairing) = &entry.pairing {
            if !pairing.is_allowed(&raw.sender_id).await {
                let code = pairing.request_code(&raw.sender_id).await;
                let _ = entry
                    .channel
                    .send_text(&OutboundMessage {
                        chat_id: raw.chat_id.clone(),
                        text: format!("This chat isn't paired yet. Give the operator this code to continue: {code}"),
                        format: MessageFormat::PlainText,
                    })
                    .await;
                return Ok(());
            }
        }

        let Some(inbound) = entry.channel.on_message_received(raw).await else {
            return Ok(());
        };

        let session_id = SessionId::from_channel(channel_id, &inbound.chat_id);
        self.publish(
            EventType::ChannelMessageIn,
            channel_id,
            serde_json::json!({"chat_id": inbound.chat_id, "text": inbound.text}),
        );

        let (tx, rx) = mpsc::unbounded_channel::<ChannelSignal>();
        let sub_session = session_id.clone();
        let subscription = bus.subscribe(
            None,
            Box::new(move |event: &Event| {
                if event.session_id.as_ref() != Some(&sub_session) {
                    return Ok(());
                }
                let signal = match event.event_type {
                    EventType::AgentText => event
                        .data
                        .get("text")
                        .and_then(|v| v.as_str())
                        .map(|t| ChannelSignal::Text(t.to_string())),
                    EventType::AgentFileGenerated => Some(ChannelSignal::Files(event.data.clone())),
                    EventType::AgentError => Some(ChannelSignal::Error(event.data.clone())),
                    EventType::AgentDone => Some(ChannelSignal::Done),
                    _ => None,
                };
                if let Some(signal) = signal {
                    let _ = tx.send(signal);
                }
                Ok(())
            }),
        );

        let forward_channel = entry.channel.clone();
        let forward_chat_id = inbound.chat_id.clone();
        let forward_bus = self.bus.clone();
        let forward_channel_id = channel_id.to_string();
        let forward_task =
            tokio::spawn(async move { forward_loop(forward_channel, forward_chat_id, rx, forward_bus, forward_channel_id).await });

        let turn_result = runtime
            .run_turn(session_id, workspace_dir, inbound.text.clone(), CancellationToken::new())
            .await;

        bus.unsubscribe(subscription);
        let _ = forward_task.await;

        turn_result.map(|_| ()).map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

enum ChannelSignal {
    Text(String),
    Files(serde_json::Value),
    Error(serde_json::Value),
    Done,
}

/// Drains one turn's forwarded signals, batching assistant text on a
/// sentence boundary or `BATCH_TIMEOUT`, forwarding generated files through
/// `send_media`, and turning `AGENT_ERROR` into a user-visible apology. Every
/// message actually handed to the adapter is published as
/// `CHANNEL_MESSAGE_OUT`; adapter failures are published as `CHANNEL_ERROR`.
async fn forward_loop(
    channel: Arc<dyn Channel>,
    chat_id: String,
    mut rx: mpsc::UnboundedReceiver<ChannelSignal>,
    bus: Arc<EventBus>,
    channel_id: String,
) {
    let mut buf = String::new();
    loop {
        tokio::select! {
            signal = rx.recv() => {
                match signal {
                    Some(ChannelSignal::Text(chunk)) => {
                        buf.push_str(&chunk);
                        if ends_at_sentence_boundary(&buf) {
                            flush_text(&channel, &chat_id, &mut buf, &bus, &channel_id).await;
                        }
                    }
                    Some(ChannelSignal::Files(data)) => {
                        flush_text(&channel, &chat_id, &mut buf, &bus, &channel_id).await;
                        if let Some(files) = data.get("files").and_then(|v| v.as_array()) {
                            for f in files {
                                if let Ok(attachment) = serde_json::from_value::<MediaAttachment>(f.clone()) {
                                    match channel.send_media(&chat_id, &attachment).await {
                                        Ok(()) => bus.publish(
                                            Event::new(EventType::ChannelMessageOut, "channel-manager", serde_json::json!({"chat_id": chat_id, "media": attachment.path}))
                                                .with_channel(channel_id.clone()),
                                        ),
                                        Err(e) => {
                                            warn!(chat_id = %chat_id, error = %e, "failed to forward generated file");
                                            bus.publish(
                                                Event::new(EventType::ChannelError, "channel-manager", serde_json::json!({"message": e.to_string(), "during": "send_media"}))
                                                    .with_channel(channel_id.clone()),
                                            );
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Some(ChannelSignal::Error(data)) => {
                        flush_text(&channel, &chat_id, &mut buf, &bus, &channel_id).await;
                        let message = data.get("message").and_then(|v| v.as_str()).unwrap_or("something went wrong");
                        let _ = channel
                            .send_text(&OutboundMessage {
                                chat_id: chat_id.clone(),
                                text: format!("Sorry, I ran into a problem: {message}"),
                                format: MessageFormat::PlainText,
                            })
                            .await;
                    }
                    Some(ChannelSignal::Done) | None => {
                        flush_text(&channel, &chat_id, &mut buf, &bus, &channel_id).await;
                        return;
                    }
                }
            }
            _ = sleep(BATCH_TIMEOUT), if !buf.is_empty() => {
                flush_text(&channel, &chat_id, &mut buf, &bus, &channel_id).await;
            }
        }
    }
}

fn ends_at_sentence_boundary(buf: &str) -> bool {
    buf.trim_end().ends_with(['.', '!', '?'])
}

async fn flush_text(channel: &Arc<dyn Channel>, chat_id: &str, buf: &mut String, bus: &Arc<EventBus>, channel_id: &str) {
    if buf.is_empty() {
        return;
    }
    let text = std::mem::take(buf);
    match channel.send_text(&OutboundMessage { chat_id: chat_id.to_string(), text: text.clone(), format: MessageFormat::PlainText }).await {
        Ok(()) => bus.publish(
            Event::new(EventType::ChannelMessageOut, "channel-manager", serde_json::json!({"chat_id": chat_id, "text": text})).with_channel(channel_id),
        ),
        Err(e) => {
            warn!(chat_id = %chat_id, error = %e, "failed to deliver assistant text");
            bus.publish(
                Event::new(EventType::ChannelError, "channel-manager", serde_json::json!({"message": e.to_string(), "during": "send_text"}))
                    .with_channel(channel_id),
            );
        }
    }
}

/// Exponential backoff with jitter for `DEGRADED -> RUNNING` recovery:
/// base 1s, factor 2, cap 60s, jitter ±20% (§4.6). Derived from the current
/// monotonic nanosecond offset rather than a `rand` dependency, matching the
/// teacher's approach to the same problem.
async fn reconnect_with_backoff(entry: Arc<ChannelEntry>, channel_id: String, bus: Arc<EventBus>) {
    let mut delay_secs = RECONNECT_BASE_SECS;
    loop {
        if *entry.state.lock().await != ChannelState::Degraded {
            return;
        }

        match entry.channel.on_start(&entry.config).await {
            Ok(()) => {
                if let Err(e) = entry.channel.on_ready().await {
                    warn!(channel = %channel_id, error = %e, "reconnected but on_ready failed");
                }
                *entry.state.lock().await = ChannelState::Running;
                info!(channel = %channel_id, "channel reconnected");
                bus.publish(
                    Event::new(EventType::ChannelStateChanged, "channel-manager", serde_json::json!({"state": "running"}))
                        .with_channel(channel_id.clone()),
                );
                return;
            }
            Err(e) => {
                let delay_ms = jittered_delay_ms(delay_secs);
                warn!(channel = %channel_id, error = %e, retry_after_ms = delay_ms, "reconnect attempt failed");
                bus.publish(
                    Event::new(EventType::ChannelError, "channel-manager", serde_json::json!({"message": e.to_string(), "during": "reconnect"}))
                        .with_channel(channel_id.clone()),
                );
                sleep(Duration::from_millis(delay_ms)).await;
                delay_secs = (delay_secs * RECONNECT_FACTOR).min(RECONNECT_CAP_SECS);
            }
        }
    }
}

fn jittered_delay_ms(base_secs: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let base_ms = base_secs * 1000;
    let jitter_span = ((base_ms as f64) * RECONNECT_JITTER_FRACTION) as u64;
    if jitter_span == 0 {
        return base_ms;
    }
    let offset = (nanos as u64) % (2 * jitter_span) as u64;
    base_ms + offset.saturating_sub(jitter_span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::types::EventType as ET;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyChannel {
        id: String,
        start_calls: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl Channel for FlakyChannel {
        fn id(&self) -> &str {
            &self.id
        }
        async fn on_start(&self, _config: &ChannelEntryConfig) -> Result<(), ChannelError> {
            let n = self.start_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err(ChannelError::ConnectionFailed("simulated".to_string()))
            } else {
                Ok(())
            }
        }
        async fn check_health(&self) -> crate::types::ChannelHealth {
            crate::types::ChannelHealth::ok()
        }
        async fn send_text(&self, _msg: &OutboundMessage) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send_media(&self, _chat_id: &str, _file: &MediaAttachment) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn test_config() -> ChannelEntryConfig {
        ChannelEntryConfig { enabled: true, credential_env: "TEST_TOKEN".to_string(), dm_policy: DmPolicy::Open }
    }

    #[tokio::test]
    async fn start_is_idempotent_once_running() {
        let manager = ChannelManager::new(Arc::new(EventBus::new(true)));
        let channel = Arc::new(FlakyChannel { id: "test".to_string(), start_calls: AtomicU32::new(0), fail_first_n: 0 });
        manager.register(channel.clone(), test_config(), std::env::temp_dir().as_path());

        manager.start("test").await.unwrap();
        manager.start("test").await.unwrap();
        assert_eq!(channel.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_failure_marks_channel_failed() {
        let manager = ChannelManager::new(Arc::new(EventBus::new(true)));
        let channel = Arc::new(FlakyChannel { id: "test".to_string(), start_calls: AtomicU32::new(0), fail_first_n: 99 });
        manager.register(channel, test_config(), std::env::temp_dir().as_path());

        assert!(manager.start("test").await.is_err());
        let statuses = manager.list_status().await;
        assert_eq!(statuses, vec![("test".to_string(), ChannelState::Failed)]);
    }

    #[tokio::test]
    async fn unknown_channel_start_errors() {
        let manager = ChannelManager::new(Arc::new(EventBus::new(true)));
        assert!(manager.start("nope").await.is_err());
    }

    #[tokio::test]
    async fn connection_lost_recovers_to_running_after_retries() {
        let manager = ChannelManager::new(Arc::new(EventBus::new(true)));
        let channel = Arc::new(FlakyChannel { id: "test".to_string(), start_calls: AtomicU32::new(0), fail_first_n: 0 });
        manager.register(channel.clone(), test_config(), std::env::temp_dir().as_path());
        manager.start("test").await.unwrap();

        channel.start_calls.store(0, Ordering::SeqCst);
        let flaky = Arc::new(FlakyChannel { id: "test".to_string(), start_calls: AtomicU32::new(0), fail_first_n: 2 });
        manager.register(flaky.clone(), test_config(), std::env::temp_dir().as_path());
        manager.start("test").await.unwrap();

        manager.notify_connection_lost("test").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let statuses = manager.list_status().await;
        assert!(matches!(statuses[0].1, ChannelState::Degraded | ChannelState::Running));
    }

    #[tokio::test]
    async fn start_and_inbound_dispatch_publish_bus_events() {
        let bus = Arc::new(EventBus::new(true));
        let (_, mut rx) = bus.attach_broadcast();
        let manager = ChannelManager::new(bus);
        let channel = Arc::new(FlakyChannel { id: "test".to_string(), start_calls: AtomicU32::new(0), fail_first_n: 0 });
        manager.register(channel, test_config(), std::env::temp_dir().as_path());

        manager.start("test").await.unwrap();
        let started = rx.try_recv().expect("start should publish an event");
        assert_eq!(started.event_type, ET::ChannelStateChanged);
        assert_eq!(started.channel_id.as_deref(), Some("test"));
    }
}
