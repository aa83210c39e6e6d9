//! The queue facade: public surface and lifecycle management

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventSink, NullEventSink, QueueEvent};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::job::{Job, JobId, JobOptions, JobStatus};
use crate::retry::RetryPolicy;
use crate::stats::QueueStats;
use crate::store::JobStore;
use crate::worker::WorkerPool;

/// A group of background tasks sharing one cancellation token.
struct TaskSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    /// Cancels the token and awaits every task.
    async fn cancel_and_join(self) {
        self.token.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

/// An embeddable asynchronous job queue.
///
/// Owns the job store, the handler registry and the worker pool; exposes
/// the whole programmatic surface. Construct one per independent queue.
pub struct JobQueue {
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    events: Arc<dyn EventSink>,
    config: QueueConfig,
    workers: Mutex<Option<TaskSet>>,
    sweeper: Mutex<Option<TaskSet>>,
}

impl JobQueue {
    /// Queue on the system clock with events discarded.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_components(config, Arc::new(SystemClock), Arc::new(NullEventSink))
    }

    /// Queue with an injected clock and event sink. Tests pass a
    /// [`ManualClock`](crate::clock::ManualClock); embedding applications
    /// typically pass a broadcast or tracing sink.
    pub fn with_components(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let store = Arc::new(JobStore::new(config.clone(), clock));
        Self {
            store,
            registry: Arc::new(HandlerRegistry::new()),
            events,
            config,
            workers: Mutex::new(None),
            sweeper: Mutex::new(None),
        }
    }

    /// Associates a handler with a job type. Jobs of an unregistered type
    /// fail at claim time, so register before adding.
    pub fn register_handler(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        self.registry.register(job_type, handler)
    }

    /// Enqueues a job and emits `job:added`.
    pub async fn add(
        &self,
        job_type: &str,
        payload: Value,
        opts: JobOptions,
    ) -> Result<Job, QueueError> {
        let job = self.store.add(job_type, payload, opts).await?;
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            "Job enqueued"
        );
        self.events.emit(&QueueEvent::Added { job: job.clone() });
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<Job, QueueError> {
        self.store.get(id).await
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        self.store.list(status, limit).await
    }

    pub async fn remove(&self, id: JobId) -> bool {
        self.store.remove(id).await
    }

    pub async fn sweep(&self, older_than: Duration) -> usize {
        self.store.sweep(older_than).await
    }

    pub async fn stats(&self) -> QueueStats {
        self.store.stats().await
    }

    /// Spins up the worker pool and the periodic sweeper. Idempotent:
    /// calling while running is a no-op.
    pub async fn start(&self) {
        self.start_workers().await;
        self.start_sweeper().await;
    }

    /// Stops claiming and waits until every worker has finished its
    /// in-flight execution. No job is left `active` afterwards. The sweeper
    /// keeps running; `start` restarts the pool.
    pub async fn stop(&self) {
        let set = self.workers.lock().await.take();
        if let Some(set) = set {
            set.cancel_and_join().await;
            info!("Worker pool stopped");
        }
    }

    /// `stop`, then cancels the periodic sweeper. Safe to call repeatedly;
    /// the embedding application wires termination signals to this.
    pub async fn shutdown(&self) {
        self.stop().await;
        let set = self.sweeper.lock().await.take();
        if let Some(set) = set {
            set.cancel_and_join().await;
        }
        info!("Queue shut down");
    }

    async fn start_workers(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            RetryPolicy::new(self.config.backoff, self.config.jitter),
            self.config.idle_interval,
        ));
        let handles = pool.spawn_workers(self.config.workers, token.clone());
        info!(workers = self.config.workers, "Worker pool started");
        *workers = Some(TaskSet { token, handles });
    }

    async fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let store = Arc::clone(&self.store);
        let period = self.config.sweep_interval;
        let retention = self.config.retention;
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep(retention).await;
                    }
                }
            }
            debug!("Sweeper stopped");
        });
        *sweeper = Some(TaskSet {
            token,
            handles: vec![handle],
        });
    }
}
