//! Handler trait, type registry, and the per-execution context

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::events::{EventSink, QueueEvent};
use crate::job::{Job, JobId};
use crate::store::JobStore;

/// Per-type processing function supplied by the embedding application.
///
/// Invoked at most `max_retries + 1` times per job. The returned value is
/// stored as the job's `result`; an `Err` drives the retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

/// `job_type -> handler` registry. Registration is intended at setup time,
/// before the pool starts; a later registration for the same type replaces
/// the earlier one.
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        if job_type.trim().is_empty() {
            return Err(QueueError::InvalidArgument(
                "job type must not be empty".to_string(),
            ));
        }
        self.handlers
            .write()
            .expect("Handler registry RwLock poisoned")
            .insert(job_type.to_string(), handler);
        Ok(())
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("Handler registry RwLock poisoned")
            .get(job_type)
            .cloned()
    }
}

/// What a handler sees while executing one attempt.
///
/// `log` and `progress` write straight onto the job record; `is_cancelled`
/// flips once the attempt's timeout fires, so long-running handlers can bail
/// out cooperatively.
pub struct JobContext {
    job_id: JobId,
    job_type: String,
    payload: Value,
    attempt: u32,
    store: Arc<JobStore>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        store: Arc<JobStore>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts,
            store,
            events,
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// 1-based execution number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once this attempt's timeout has fired. The queue never preempts
    /// a handler; observing this signal is the handler's responsibility.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Appends a timestamped message to the job's log.
    pub async fn log(&self, message: impl Into<String>) {
        let _ = self.store.append_log(self.job_id, message).await;
    }

    /// Updates the job's progress (clamped to 100) and emits `job:progress`.
    pub async fn progress(&self, percent: u8) {
        if let Ok(job) = self.store.set_progress(self.job_id, percent).await {
            self.events.emit(&QueueEvent::Progress { job });
        }
    }
}
