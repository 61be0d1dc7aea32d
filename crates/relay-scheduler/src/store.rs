//! Cron store (§6): jobs live in one JSON document
//! (`workspace/.cron/jobs.json`), mutated through the shared debounced-write
//! primitive; completed runs append to `workspace/.cron/runs.jsonl`, one
//! object per line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_core::persist::{self, DebouncedWriter};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};

use crate::types::{CronJob, RunRecord};

const DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct JobsDocument {
    version: u32,
    jobs: Vec<CronJob>,
}

pub struct CronStore {
    runs_path: PathBuf,
    writer: DebouncedWriter,
    jobs: Mutex<HashMap<String, CronJob>>,
    /// Woken on every mutation so the tick loop can recompute its sleep
    /// target instead of waiting out a stale one.
    pub mutated: Notify,
}

impl CronStore {
    pub fn new(workspace_dir: &Path) -> Self {
        let cron_dir = workspace_dir.join(".cron");
        let jobs_path = cron_dir.join("jobs.json");
        let doc: JobsDocument = persist::read_json(&jobs_path).ok().flatten().unwrap_or_default();
        let jobs = doc.jobs.into_iter().map(|j| (j.id.clone(), j)).collect();
        Self {
            runs_path: cron_dir.join("runs.jsonl"),
            writer: DebouncedWriter::new(jobs_path, DEBOUNCE),
            jobs: Mutex::new(jobs),
            mutated: Notify::new(),
        }
    }

    async fn persist(&self, jobs: &HashMap<String, CronJob>) {
        let mut list: Vec<CronJob> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.writer.schedule(JobsDocument { version: 1, jobs: list });
        self.mutated.notify_waiters();
    }

    pub async fn add(&self, job: CronJob) {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id.clone(), job);
        self.persist(&jobs).await;
    }

    pub async fn remove(&self, id: &str) -> Option<CronJob> {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.remove(id);
        if removed.is_some() {
            self.persist(&jobs).await;
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<CronJob> {
        let jobs = self.jobs.lock().await;
        let mut list: Vec<CronJob> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Every job that is `enabled` and whose `next_run_at` has arrived.
    pub async fn due(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<CronJob> {
        let jobs = self.jobs.lock().await;
        jobs.values().filter(|j| j.enabled && j.next_run_at.is_some_and(|t| t <= now)).cloned().collect()
    }

    /// The nearest future `next_run_at` among enabled jobs, used to size the
    /// tick loop's sleep.
    pub async fn next_wake(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let jobs = self.jobs.lock().await;
        jobs.values().filter(|j| j.enabled).filter_map(|j| j.next_run_at).min()
    }

    pub async fn update<F>(&self, id: &str, f: F) -> Option<CronJob>
    where
        F: FnOnce(&mut CronJob),
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id)?;
        f(job);
        let updated = job.clone();
        self.persist(&jobs).await;
        Some(updated)
    }

    pub async fn append_run(&self, record: &RunRecord) -> std::io::Result<()> {
        if let Some(parent) = self.runs_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(record).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.runs_path).await?;
        file.write_all(&line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, OverlapPolicy, RunStatus, Schedule};
    use chrono::Utc;

    fn sample_job(id: &str) -> CronJob {
        let now = Utc::now();
        CronJob {
            id: id.to_string(),
            name: "test".to_string(),
            schedule: Schedule::Every { interval_secs: 60, anchor: now },
            action: Action::SystemEvent { event_type: "tick".to_string(), data: serde_json::json!({}) },
            enabled: true,
            overlap_policy: OverlapPolicy::Skip,
            next_run_at: Some(now),
            last_run_at: None,
            last_result: None,
            skipped_overrun: 0,
            degraded: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn add_then_list_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path());
        store.add(sample_job("job-1")).await;
        let jobs = store.list().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "job-1");
    }

    #[tokio::test]
    async fn remove_drops_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path());
        store.add(sample_job("job-1")).await;
        assert!(store.remove("job-1").await.is_some());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn due_only_returns_enabled_past_due_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path());
        let mut future = sample_job("future");
        future.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.add(sample_job("due")).await;
        store.add(future).await;

        let due = store.due(Utc::now()).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "due");
    }

    #[tokio::test]
    async fn append_run_writes_a_jsonl_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path());
        let now = Utc::now();
        store
            .append_run(&RunRecord { job_id: "job-1".to_string(), started_at: now, ended_at: now, status: RunStatus::Success, error: None })
            .await
            .unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join(".cron").join("runs.jsonl")).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
