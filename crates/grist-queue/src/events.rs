//! Lifecycle event notifications
//!
//! Every job transition emits a [`QueueEvent`] to an injected [`EventSink`].
//! Sinks are informational only: the state machine is correct with zero
//! subscribers, and the default sink drops everything.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::job::{Job, JobId};

/// Snapshot events emitted on job transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// A job entered the store in `waiting` state.
    #[serde(rename = "job:added")]
    Added { job: Job },

    /// A worker claimed the job (`waiting` to `active`).
    #[serde(rename = "job:started")]
    Started { job: Job },

    /// The handler succeeded; the job is terminal.
    #[serde(rename = "job:completed")]
    Completed { job: Job },

    /// The job failed permanently (budget exhausted or no handler).
    #[serde(rename = "job:failed")]
    Failed { job: Job },

    /// A failed attempt was rescheduled with backoff.
    #[serde(rename = "job:retry")]
    Retry { job: Job, delay_ms: u64 },

    /// The handler reported progress through its context.
    #[serde(rename = "job:progress")]
    Progress { job: Job },
}

impl QueueEvent {
    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Added { .. } => "job:added",
            Self::Started { .. } => "job:started",
            Self::Completed { .. } => "job:completed",
            Self::Failed { .. } => "job:failed",
            Self::Retry { .. } => "job:retry",
            Self::Progress { .. } => "job:progress",
        }
    }

    /// The job snapshot carried by the event.
    pub fn job(&self) -> &Job {
        match self {
            Self::Added { job }
            | Self::Started { job }
            | Self::Completed { job }
            | Self::Failed { job }
            | Self::Retry { job, .. }
            | Self::Progress { job } => job,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job().id
    }
}

/// Receiver of queue events.
///
/// Implementations must be `Send + Sync` and should return quickly; events
/// are emitted inline from worker tasks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &QueueEvent);
}

/// Drops every event. The default when no observer is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &QueueEvent) {}
}

/// Logs each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Added { job } => {
                tracing::debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    priority = job.priority,
                    "job:added"
                );
            }
            QueueEvent::Started { job } => {
                tracing::debug!(job_id = %job.id, attempt = job.attempts + 1, "job:started");
            }
            QueueEvent::Completed { job } => {
                tracing::info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    duration_ms = job.duration_ms().unwrap_or(0),
                    "job:completed"
                );
            }
            QueueEvent::Failed { job } => {
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = job.error.as_deref().unwrap_or(""),
                    "job:failed"
                );
            }
            QueueEvent::Retry { job, delay_ms } => {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = delay_ms,
                    "job:retry"
                );
            }
            QueueEvent::Progress { job } => {
                tracing::trace!(job_id = %job.id, progress = job.progress, "job:progress");
            }
        }
    }
}

/// Fans events into a `tokio` broadcast channel for external subscribers.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New subscription; only events emitted after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &QueueEvent) {
        // Send fails only when nobody is subscribed.
        let _ = self.tx.send(event.clone());
    }
}

/// Forwards events to several sinks.
pub struct MultiplexEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiplexEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for MultiplexEventSink {
    fn emit(&self, event: &QueueEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
