//! Aggregate queue statistics

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::job::{Job, JobStatus};

/// Point-in-time aggregate view of the store.
///
/// `delayed` is derived (`waiting` jobs whose `process_at` is still in the
/// future); it is never stored on the job itself.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    /// Mean of `completed_at - started_at` across completed jobs, in ms.
    pub avg_duration_ms: f64,
    /// Live jobs per type, regardless of status.
    pub per_type: HashMap<String, u64>,
    /// Jobs ever accepted by `add`, including swept and removed ones.
    pub total_added: u64,
}

impl QueueStats {
    pub(crate) fn collect<'a>(
        jobs: impl Iterator<Item = &'a Job>,
        now: DateTime<Utc>,
        total_added: u64,
    ) -> Self {
        let mut stats = QueueStats {
            total_added,
            ..Default::default()
        };
        let mut duration_sum_ms: i64 = 0;

        for job in jobs {
            match job.status {
                JobStatus::Waiting => {
                    stats.waiting += 1;
                    if job.process_at > now {
                        stats.delayed += 1;
                    }
                }
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    duration_sum_ms += job.duration_ms().unwrap_or(0);
                }
                JobStatus::Failed => stats.failed += 1,
            }
            *stats.per_type.entry(job.job_type.clone()).or_insert(0) += 1;
        }

        if stats.completed > 0 {
            stats.avg_duration_ms = duration_sum_ms as f64 / stats.completed as f64;
        }
        stats
    }
}
