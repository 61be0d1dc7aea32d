//! Cron Service tick loop and action dispatch (§4.8).
//!
//! A sleep-until-next-wake tick loop paired with a `SchedulerHandle` for job
//! management, covering the three dispatch actions and the lazy
//! channel-manager accessor the bootstrap sequence (§4.10) requires: the
//! Cron Service is initialized before the Channel Manager exists, so
//! `ChannelSend` is routed through a bindable accessor rather than a direct
//! reference.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use relay_bus::EventBus;
use relay_core::types::{Event, EventType};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::schedule::compute_next_run;
use crate::store::CronStore;
use crate::types::{Action, CronJob, OverlapPolicy, RunRecord, RunResult, RunStatus, Schedule};

/// Runs an `AgentTurn` action. Implemented by the gateway over
/// `relay_runtime::AgentRuntime` so this crate never depends on it directly.
#[async_trait]
pub trait TurnDispatcher: Send + Sync {
    async fn dispatch_turn(&self, session_id: String, prompt: String) -> std::result::Result<(), String>;
}

/// Runs a `ChannelSend` action. Implemented by the gateway over
/// `relay_channels::ChannelManager`.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    async fn dispatch_send(&self, channel_id: String, target: String, body: String) -> std::result::Result<(), String>;
}

/// Bindable slot for the Channel Manager (§4.8 "lazy channel binding"):
/// `get()` returns `None` until `bind` is called during bootstrap step 6,
/// after the Cron Service itself was initialized in step 5.
#[derive(Clone, Default)]
pub struct ChannelAccessor(Arc<RwLock<Option<Arc<dyn ChannelDispatcher>>>>);

impl ChannelAccessor {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(None)))
    }

    pub fn bind(&self, dispatcher: Arc<dyn ChannelDispatcher>) {
        *self.0.write().expect("channel accessor lock poisoned") = Some(dispatcher);
    }

    pub fn get(&self) -> Option<Arc<dyn ChannelDispatcher>> {
        self.0.read().expect("channel accessor lock poisoned").clone()
    }
}

/// Handle for job management (add/remove/list), independent of whether the
/// tick loop is currently running.
pub struct SchedulerHandle {
    store: Arc<CronStore>,
}

impl SchedulerHandle {
    pub fn new(store: Arc<CronStore>) -> Self {
        Self { store }
    }

    pub async fn add_job(&self, name: &str, schedule: Schedule, action: Action, overlap_policy: OverlapPolicy) -> Result<CronJob> {
        let now = Utc::now();
        let next_run_at = compute_next_run(&schedule, now);
        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule,
            action,
            enabled: true,
            overlap_policy,
            next_run_at,
            last_run_at: None,
            last_result: None,
            skipped_overrun: 0,
            degraded: false,
            created_at: now,
            updated_at: now,
        };
        self.store.add(job.clone()).await;
        info!(job_id = %job.id, name = %job.name, "cron job added");
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> Result<()> {
        self.store.remove(id).await.ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        info!(job_id = %id, "cron job removed");
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<CronJob> {
        self.store
            .update(id, |job| {
                job.enabled = enabled;
                job.updated_at = Utc::now();
            })
            .await
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.store.list().await
    }
}

/// Drives the tick loop: sleeps until the nearest `next_run_at` (or is woken
/// early by a job mutation), fires every due job, and dispatches its action.
pub struct SchedulerEngine {
    store: Arc<CronStore>,
    bus: Arc<EventBus>,
    turn_dispatcher: Arc<dyn TurnDispatcher>,
    channels: ChannelAccessor,
    in_flight: Mutex<std::collections::HashSet<String>>,
    source: String,
}

impl SchedulerEngine {
    pub fn new(store: Arc<CronStore>, bus: Arc<EventBus>, turn_dispatcher: Arc<dyn TurnDispatcher>, channels: ChannelAccessor, source: impl Into<String>) -> Self {
        Self { store, bus, turn_dispatcher, channels, in_flight: Mutex::new(std::collections::HashSet::new()), source: source.into() }
    }

    /// Main tick loop. Runs until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("cron tick loop started");
        loop {
            let sleep_for = match self.store.next_wake().await {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO),
                None => std::time::Duration::from_secs(3600),
            };
            let sleep_for = sleep_for.min(std::time::Duration::from_secs(3600)).max(std::time::Duration::from_millis(50));

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    self.tick().await;
                }
                _ = self.store.mutated.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron tick loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let now = Utc::now();
        for job in self.store.due(now).await {
            self.bus.publish(Event::new(EventType::CronTick, &self.source, serde_json::json!({ "job_id": job.id })));
            self.fire(job, now).await;
        }
    }

    async fn fire(&self, job: CronJob, now: chrono::DateTime<chrono::Utc>) {
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains(&job.id) {
                if job.overlap_policy == OverlapPolicy::Skip {
                    warn!(job_id = %job.id, "previous run still in flight, skipping fire");
                    self.store.update(&job.id, |j| j.skipped_overrun += 1).await;
                    return;
                }
                // `Queue`: fall through and run anyway. This code path only
                // ever has one fire in flight per job id at a time — `due()`
                // returns a job at most once per tick and ticks run
                // sequentially, so a second concurrent fire can't occur.
            }
            in_flight.insert(job.id.clone());
        }

        let next_run_at = compute_next_run(&job.schedule, now);
        self.store
            .update(&job.id, |j| {
                j.last_run_at = Some(now);
                j.next_run_at = next_run_at;
                j.updated_at = now;
            })
            .await;

        self.bus.publish(Event::new(EventType::CronRunStart, &self.source, serde_json::json!({ "job_id": job.id, "name": job.name })));

        let started_at = now;
        let outcome = self.dispatch(&job.action).await;
        let ended_at = Utc::now();

        let result = match &outcome {
            Ok(()) => RunResult { status: RunStatus::Success, error: None },
            Err(e) => RunResult { status: RunStatus::Failed, error: Some(e.clone()) },
        };
        let record =
            RunRecord { job_id: job.id.clone(), started_at, ended_at, status: result.status, error: result.error.clone() };
        if let Err(e) = self.store.append_run(&record).await {
            error!(job_id = %job.id, error = %e, "failed to append run record");
        }

        self.store
            .update(&job.id, |j| {
                j.degraded = outcome.is_err();
                j.last_result = Some(result);
            })
            .await;

        match &outcome {
            Ok(()) => {
                self.bus.publish(Event::new(EventType::CronRunDone, &self.source, serde_json::json!({ "job_id": job.id })));
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "cron job dispatch failed");
                self.bus.publish(Event::new(
                    EventType::CronRunFailed,
                    &self.source,
                    serde_json::json!({ "job_id": job.id, "error": e }),
                ));
            }
        }

        self.in_flight.lock().await.remove(&job.id);
    }

    async fn dispatch(&self, action: &Action) -> std::result::Result<(), String> {
        match action {
            Action::SystemEvent { event_type, data } => {
                let published_type = event_type.parse::<EventType>().unwrap_or_else(|e| {
                    warn!(event_type = %event_type, error = %e, "job's event_type isn't a known EventType, publishing CRON_TICK instead");
                    EventType::CronTick
                });
                self.bus.publish(Event::new(published_type, &self.source, serde_json::json!({ "system_event": event_type, "data": data })));
                Ok(())
            }
            Action::AgentTurn { session_id, prompt } => {
                self.turn_dispatcher.dispatch_turn(session_id.clone(), prompt.clone()).await
            }
            Action::ChannelSend { channel_id, target, body } => match self.channels.get() {
                Some(dispatcher) => dispatcher.dispatch_send(channel_id.clone(), target.clone(), body.clone()).await,
                None => Err("channel_unavailable".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CronStore;
    use relay_bus::EventBus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTurnDispatcher(Arc<AtomicU32>);

    #[async_trait]
    impl TurnDispatcher for CountingTurnDispatcher {
        async fn dispatch_turn(&self, _session_id: String, _prompt: String) -> std::result::Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingChannelDispatcher;

    #[async_trait]
    impl ChannelDispatcher for FailingChannelDispatcher {
        async fn dispatch_send(&self, _channel_id: String, _target: String, _body: String) -> std::result::Result<(), String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn due_agent_turn_job_dispatches_and_records_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::new(dir.path()));
        let bus = Arc::new(EventBus::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let engine = SchedulerEngine::new(
            store.clone(),
            bus,
            Arc::new(CountingTurnDispatcher(calls.clone())),
            ChannelAccessor::new(),
            "cron",
        );

        let handle = SchedulerHandle::new(store.clone());
        let job = handle
            .add_job(
                "greet",
                Schedule::AtOnce { at: Utc::now() - chrono::Duration::seconds(1) },
                Action::AgentTurn { session_id: "s1".to_string(), prompt: "good morning".to_string() },
                OverlapPolicy::Skip,
            )
            .await
            .unwrap();

        engine.tick().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.get(&job.id).await.unwrap();
        assert!(matches!(stored.last_result, Some(RunResult { status: RunStatus::Success, .. })));
        assert!(stored.next_run_at.is_none());
    }

    #[tokio::test]
    async fn channel_send_without_bound_accessor_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::new(dir.path()));
        let bus = Arc::new(EventBus::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let engine = SchedulerEngine::new(store.clone(), bus, Arc::new(CountingTurnDispatcher(calls)), ChannelAccessor::new(), "cron");

        let handle = SchedulerHandle::new(store.clone());
        let job = handle
            .add_job(
                "notify",
                Schedule::AtOnce { at: Utc::now() - chrono::Duration::seconds(1) },
                Action::ChannelSend { channel_id: "telegram".to_string(), target: "chat-1".to_string(), body: "hi".to_string() },
                OverlapPolicy::Skip,
            )
            .await
            .unwrap();

        engine.tick().await;

        let stored = store.get(&job.id).await.unwrap();
        assert!(stored.degraded);
        assert!(matches!(stored.last_result, Some(RunResult { status: RunStatus::Failed, .. })));
    }

    #[tokio::test]
    async fn channel_send_after_bind_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::new(dir.path()));
        let bus = Arc::new(EventBus::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let channels = ChannelAccessor::new();
        let engine = SchedulerEngine::new(store.clone(), bus, Arc::new(CountingTurnDispatcher(calls)), channels.clone(), "cron");

        channels.bind(Arc::new(FailingChannelDispatcher));

        let handle = SchedulerHandle::new(store.clone());
        let job = handle
            .add_job(
                "notify",
                Schedule::AtOnce { at: Utc::now() - chrono::Duration::seconds(1) },
                Action::ChannelSend { channel_id: "telegram".to_string(), target: "chat-1".to_string(), body: "hi".to_string() },
                OverlapPolicy::Skip,
            )
            .await
            .unwrap();

        engine.tick().await;

        let stored = store.get(&job.id).await.unwrap();
        assert!(stored.degraded);
        assert_eq!(stored.last_result.unwrap().error.unwrap(), "boom");
    }

    #[tokio::test]
    async fn system_event_job_publishes_its_configured_event_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::new(dir.path()));
        let bus = Arc::new(EventBus::new(false));
        let (_flushed, mut rx) = bus.attach_broadcast();
        let calls = Arc::new(AtomicU32::new(0));
        let engine = SchedulerEngine::new(store.clone(), bus, Arc::new(CountingTurnDispatcher(calls)), ChannelAccessor::new(), "cron");

        let handle = SchedulerHandle::new(store.clone());
        handle
            .add_job(
                "startup-hook",
                Schedule::AtOnce { at: Utc::now() - chrono::Duration::seconds(1) },
                Action::SystemEvent { event_type: "SYSTEM_STARTUP".to_string(), data: serde_json::json!({}) },
                OverlapPolicy::Skip,
            )
            .await
            .unwrap();

        engine.tick().await;

        // CRON_TICK from tick() itself, then the job's configured type.
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.event_type);
        }
        assert_eq!(seen, vec![EventType::CronTick, EventType::SystemStartup]);
    }

    #[tokio::test]
    async fn system_event_job_with_unknown_type_falls_back_to_cron_tick() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::new(dir.path()));
        let bus = Arc::new(EventBus::new(false));
        let (_flushed, mut rx) = bus.attach_broadcast();
        let calls = Arc::new(AtomicU32::new(0));
        let engine = SchedulerEngine::new(store.clone(), bus, Arc::new(CountingTurnDispatcher(calls)), ChannelAccessor::new(), "cron");

        let handle = SchedulerHandle::new(store.clone());
        handle
            .add_job(
                "custom-hook",
                Schedule::AtOnce { at: Utc::now() - chrono::Duration::seconds(1) },
                Action::SystemEvent { event_type: "not_a_real_type".to_string(), data: serde_json::json!({}) },
                OverlapPolicy::Skip,
            )
            .await
            .unwrap();

        engine.tick().await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.event_type);
        }
        assert_eq!(seen, vec![EventType::CronTick, EventType::CronTick]);
    }

    #[tokio::test]
    async fn skip_policy_drops_fire_while_previous_still_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::new(dir.path()));
        let bus = Arc::new(EventBus::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let engine = SchedulerEngine::new(store.clone(), bus, Arc::new(CountingTurnDispatcher(calls)), ChannelAccessor::new(), "cron");

        let handle = SchedulerHandle::new(store.clone());
        let job = handle
            .add_job("greet", Schedule::Every { interval_secs: 60, anchor: Utc::now() }, Action::SystemEvent { event_type: "x".to_string(), data: serde_json::json!({}) }, OverlapPolicy::Skip)
            .await
            .unwrap();

        engine.in_flight.lock().await.insert(job.id.clone());
        engine.fire(store.get(&job.id).await.unwrap(), Utc::now()).await;

        let stored = store.get(&job.id).await.unwrap();
        assert_eq!(stored.skipped_overrun, 1);
    }
}
