//! Job record and lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Job identifier
pub type JobId = Uuid;

/// Job state machine: `Waiting -> Active -> {Completed | Waiting(retry) | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Enqueued, eligible once `process_at` has elapsed
    Waiting,
    /// Claimed by exactly one worker
    Active,
    /// Finished successfully, `result` is set
    Completed,
    /// Finished permanently, `error` is set
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission options for [`add`](crate::queue::JobQueue::add). Unset
/// retry/timeout fields fall back to the queue's configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Higher runs first
    pub priority: i32,
    /// Initial hold before the job becomes eligible
    pub delay: Option<Duration>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Timestamped message appended by a handler through its context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// A queued unit of work and its full lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    /// Opaque to the queue; handed to the handler untouched
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Not eligible for claiming before this instant
    pub process_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Executions begun so far
    pub attempts: u32,
    pub max_retries: u32,
    /// Per-execution budget enforced by the worker
    pub timeout: Duration,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 0-100, advisory only
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub logs: Vec<JobLogEntry>,
}

impl Job {
    /// Eligible for claiming: waiting and past its `process_at`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.process_at <= now
    }

    /// Milliseconds between the final claim and completion, for completed jobs.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}
