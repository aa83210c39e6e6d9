//! Worker pool and the per-claim execution guard

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::events::{EventSink, QueueEvent};
use crate::handler::{HandlerRegistry, JobContext};
use crate::job::Job;
use crate::retry::RetryPolicy;
use crate::store::JobStore;

/// Pause after an unexpected internal fault before the loop continues.
const FAULT_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct WorkerPool {
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    idle_interval: Duration,
}

impl WorkerPool {
    pub(crate) fn new(
        store: Arc<JobStore>,
        registry: Arc<HandlerRegistry>,
        events: Arc<dyn EventSink>,
        retry: RetryPolicy,
        idle_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            retry,
            idle_interval,
        }
    }

    /// Spawns `count` independent worker loops sharing one shutdown token.
    pub(crate) fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let pool = Arc::clone(self);
                let token = shutdown.clone();
                tokio::spawn(async move { pool.run(worker_id, token).await })
            })
            .collect()
    }

    /// One worker loop: claim, execute, repeat. Cancellation is only
    /// observed between executions, so an in-flight attempt always reaches
    /// an outcome before the worker exits.
    async fn run(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!(worker_id, "Worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.store.claim_next().await {
                Some(job) => {
                    self.events.emit(&QueueEvent::Started { job: job.clone() });
                    if let Err(e) = self.run_claimed(job).await {
                        error!(worker_id, error = %e, "Worker fault while applying job outcome");
                        tokio::time::sleep(FAULT_BACKOFF).await;
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.store.wait_for_work() => {}
                        _ = tokio::time::sleep(self.idle_interval) => {}
                    }
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    /// Execution guard: handler lookup, attempt accounting, the timeout
    /// race, and outcome application.
    async fn run_claimed(&self, job: Job) -> Result<(), QueueError> {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "No handler registered for job type");
            let err = QueueError::NoHandler(job.job_type.clone());
            let snapshot = self.store.fail(job.id, err.to_string()).await?;
            self.events.emit(&QueueEvent::Failed { job: snapshot });
            return Ok(());
        };

        let job = self.store.begin_attempt(job.id).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Processing job"
        );

        let cancel = CancellationToken::new();
        let ctx = JobContext::new(
            &job,
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { handler.execute(ctx).await });

        // Whichever settles first wins. Dropping the handle on timeout
        // detaches the handler task; the cancelled token is its signal to
        // stop cooperatively.
        let outcome = match tokio::time::timeout(job.timeout, handle).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(QueueError::Execution(format!("{e:#}"))),
            Ok(Err(join_err)) => {
                let msg = if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    join_err.to_string()
                };
                Err(QueueError::Execution(msg))
            }
            Err(_) => {
                cancel.cancel();
                Err(QueueError::Timeout {
                    limit_ms: job.timeout.as_millis() as u64,
                })
            }
        };

        match outcome {
            Ok(result) => {
                let snapshot = self.store.complete(job.id, result).await?;
                info!(job_id = %job.id, job_type = %job.job_type, "Job completed");
                self.events.emit(&QueueEvent::Completed { job: snapshot });
            }
            Err(err) => self.apply_failure(&job, err).await?,
        }
        Ok(())
    }

    /// Retry with backoff while the budget allows, terminal failure after.
    async fn apply_failure(&self, job: &Job, err: QueueError) -> Result<(), QueueError> {
        match self.retry.next_delay(job.attempts, job.max_retries) {
            Some(delay) => {
                info!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, scheduling retry with backoff"
                );
                let snapshot = self.store.reschedule(job.id, err.to_string(), delay).await?;
                self.events.emit(&QueueEvent::Retry {
                    job: snapshot,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            None => {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %err,
                    "Job failed permanently"
                );
                let snapshot = self.store.fail(job.id, err.to_string()).await?;
                self.events.emit(&QueueEvent::Failed { job: snapshot });
            }
        }
        Ok(())
    }
}
