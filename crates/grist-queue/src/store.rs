//! The owned job arena
//!
//! A [`JobStore`] holds every job for its lifetime in one `RwLock`'d map.
//! The claim transition happens under a single write-lock hold, which is the
//! mutual-exclusion guarantee: two workers can never claim the same job.
//! Several independent stores can coexist in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{Job, JobId, JobLogEntry, JobOptions, JobStatus};
use crate::scheduler;
use crate::stats::QueueStats;

pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    work_notify: Notify,
    total_added: AtomicU64,
}

impl JobStore {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
            config,
            work_notify: Notify::new(),
            total_added: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Creates a job in `waiting` state and wakes one idle worker.
    ///
    /// Rejects an empty `job_type`; unset option fields fall back to the
    /// queue defaults.
    pub async fn add(
        &self,
        job_type: &str,
        payload: Value,
        opts: JobOptions,
    ) -> Result<Job, QueueError> {
        if job_type.trim().is_empty() {
            return Err(QueueError::InvalidArgument(
                "job type must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let delay = opts.delay.unwrap_or(Duration::ZERO);
        let process_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| QueueError::InvalidArgument("delay out of range".to_string()))?;

        let job = Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            priority: opts.priority,
            process_at,
            status: JobStatus::Waiting,
            attempts: 0,
            max_retries: opts.max_retries.unwrap_or(self.config.default_max_retries),
            timeout: opts.timeout.unwrap_or(self.config.default_timeout),
            result: None,
            error: None,
            progress: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            updated_at: now,
            logs: Vec::new(),
        };

        self.jobs.write().await.insert(job.id, job.clone());
        self.total_added.fetch_add(1, Ordering::Relaxed);
        self.work_notify.notify_one();

        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<Job, QueueError> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    /// Jobs in dispatch order (priority descending, then creation order),
    /// optionally filtered by status, truncated to `limit`.
    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| scheduler::dispatch_order(a, b));
        out.truncate(limit);
        out
    }

    /// Removes a job unless it is currently `active`. Returns whether a job
    /// was removed; a missing id is `false`, never an error.
    pub async fn remove(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&id) {
            Some(job) if job.status == JobStatus::Active => false,
            Some(_) => {
                jobs.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Drops terminal jobs whose `updated_at` is older than `older_than`.
    pub async fn sweep(&self, older_than: Duration) -> usize {
        let now = self.clock.now();
        let delta = match chrono::Duration::from_std(older_than) {
            Ok(d) => d,
            Err(_) => return 0,
        };
        let Some(cutoff) = now.checked_sub_signed(delta) else {
            return 0;
        };

        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        let removed = before - jobs.len();
        if removed > 0 {
            debug!(removed, "Swept aged terminal jobs");
        }
        removed
    }

    /// Atomically claims the best ready job: selection, the `waiting` to
    /// `active` flip and `started_at` all happen under one write-lock hold.
    pub async fn claim_next(&self) -> Option<Job> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let id = scheduler::next_ready(&jobs, now)?;
        let job = jobs.get_mut(&id)?;
        job.status = JobStatus::Active;
        job.started_at = Some(now);
        job.updated_at = now;
        Some(job.clone())
    }

    /// Records that an execution is actually beginning. Kept separate from
    /// the claim so a claim that fails handler lookup leaves `attempts`
    /// untouched.
    pub async fn begin_attempt(&self, id: JobId) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.attempts += 1;
        job.updated_at = now;
        Ok(job.clone())
    }

    pub async fn complete(&self, id: JobId, result: Value) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.error = None;
        job.progress = 100;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    /// Puts a failed attempt back in `waiting` with a delayed `process_at`.
    pub async fn reschedule(
        &self,
        id: JobId,
        error: String,
        delay: Duration,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let process_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = JobStatus::Waiting;
        job.error = Some(error);
        job.process_at = process_at;
        job.updated_at = now;
        Ok(job.clone())
    }

    pub async fn fail(&self, id: JobId, error: String) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = JobStatus::Failed;
        job.error = Some(error);
        job.failed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    pub async fn append_log(
        &self,
        id: JobId,
        message: impl Into<String>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.logs.push(JobLogEntry {
            at: now,
            message: message.into(),
        });
        job.updated_at = now;
        Ok(())
    }

    /// Clamps to 100. Advisory only; no scheduling effect.
    pub async fn set_progress(&self, id: JobId, percent: u8) -> Result<Job, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.progress = percent.min(100);
        job.updated_at = now;
        Ok(job.clone())
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let jobs = self.jobs.read().await;
        QueueStats::collect(jobs.values(), now, self.total_added.load(Ordering::Relaxed))
    }

    pub async fn active_count(&self) -> usize {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|job| job.status == JobStatus::Active)
            .count()
    }

    /// Resolves when `add` signals a new candidate. Idle workers race this
    /// against their sleep so fresh work is picked up promptly.
    pub(crate) async fn wait_for_work(&self) {
        self.work_notify.notified().await;
    }
}
