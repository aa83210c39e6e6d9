//! End-to-end tests for the queue lifecycle

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use grist_queue::{
    BackoffStrategy, BroadcastEventSink, Job, JobContext, JobHandler, JobId, JobOptions,
    JobQueue, JobStatus, ManualClock, NullEventSink, QueueConfig, QueueEvent, RetryPolicy,
};

/// A test handler that counts executions and can fail a set number of times
struct CounterHandler {
    counter: Arc<AtomicU32>,
    fail_times: u32,
}

impl CounterHandler {
    fn new(counter: Arc<AtomicU32>) -> Self {
        Self {
            counter,
            fail_times: 0,
        }
    }

    fn failing(counter: Arc<AtomicU32>, fail_times: u32) -> Self {
        Self {
            counter,
            fail_times,
        }
    }
}

#[async_trait]
impl JobHandler for CounterHandler {
    async fn execute(&self, _ctx: JobContext) -> anyhow::Result<Value> {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        if count < self.fail_times {
            anyhow::bail!("simulated failure on execution {}", count + 1);
        }
        Ok(json!({ "runs": count + 1 }))
    }
}

/// Records the order in which payload tags are processed
struct RecorderHandler {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for RecorderHandler {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value> {
        let tag = ctx.payload()["tag"].as_str().unwrap_or("?").to_string();
        self.seen.lock().unwrap().push(tag);
        Ok(Value::Null)
    }
}

/// Sleeps for a fixed time, then succeeds
struct SleepHandler {
    millis: u64,
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn execute(&self, _ctx: JobContext) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(json!({ "slept_ms": self.millis }))
    }
}

/// Always panics
struct PanicHandler;

#[async_trait]
impl JobHandler for PanicHandler {
    async fn execute(&self, _ctx: JobContext) -> anyhow::Result<Value> {
        panic!("boom");
    }
}

/// Reports progress and writes a log line before finishing
struct ProgressHandler;

#[async_trait]
impl JobHandler for ProgressHandler {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value> {
        ctx.log("halfway there").await;
        ctx.progress(50).await;
        Ok(json!({ "done": true }))
    }
}

/// Tight polling intervals and no backoff delay, for fast tests
fn quick_config(workers: usize) -> QueueConfig {
    QueueConfig::new()
        .with_workers(workers)
        .with_idle_interval(Duration::from_millis(25))
        .with_backoff(BackoffStrategy::Constant {
            delay: Duration::ZERO,
        })
}

/// Polls until the job reaches a terminal status
async fn settled(queue: &JobQueue, id: JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = queue.get(id).await.expect("job should exist");
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal status within 5s")
}

/// Polls until the job is observed in the given status
async fn wait_for_status(queue: &JobQueue, id: JobId, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let job = queue.get(id).await.expect("job should exist");
            if job.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job never reached {status}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_priority_order_with_single_worker() {
        let queue = JobQueue::new(quick_config(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        queue
            .register_handler("recorder", Arc::new(RecorderHandler { seen: seen.clone() }))
            .unwrap();

        let low = queue
            .add("recorder", json!({ "tag": "low" }), JobOptions::new().with_priority(1))
            .await
            .unwrap();
        let high = queue
            .add("recorder", json!({ "tag": "high" }), JobOptions::new().with_priority(10))
            .await
            .unwrap();
        let mid = queue
            .add("recorder", json!({ "tag": "mid" }), JobOptions::new().with_priority(5))
            .await
            .unwrap();

        queue.start().await;
        settled(&queue, low.id).await;
        settled(&queue, high.id).await;
        settled(&queue, mid.id).await;
        queue.shutdown().await;

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_equal_priority_runs_in_insertion_order() {
        let queue = JobQueue::new(quick_config(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        queue
            .register_handler("recorder", Arc::new(RecorderHandler { seen: seen.clone() }))
            .unwrap();

        let first = queue
            .add("recorder", json!({ "tag": "first" }), JobOptions::new())
            .await
            .unwrap();
        let second = queue
            .add("recorder", json!({ "tag": "second" }), JobOptions::new())
            .await
            .unwrap();

        queue.start().await;
        settled(&queue, first.id).await;
        settled(&queue, second.id).await;
        queue.shutdown().await;

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_flaky_job_retries_until_success() {
        let queue = JobQueue::new(quick_config(1));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("flaky", Arc::new(CounterHandler::failing(counter.clone(), 2)))
            .unwrap();

        let job = queue
            .add("flaky", json!({}), JobOptions::new().with_max_retries(3))
            .await
            .unwrap();
        queue.start().await;

        let done = settled(&queue, job.id).await;
        queue.shutdown().await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(done.result, Some(json!({ "runs": 3 })));
        // A success wipes the error left by earlier attempts
        assert_eq!(done.error, None);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_job_failed() {
        let queue = JobQueue::new(quick_config(1));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("doomed", Arc::new(CounterHandler::failing(counter.clone(), 99)))
            .unwrap();

        let job = queue
            .add("doomed", json!({}), JobOptions::new().with_max_retries(2))
            .await
            .unwrap();
        queue.start().await;

        let done = settled(&queue, job.id).await;
        queue.shutdown().await;

        assert_eq!(done.status, JobStatus::Failed);
        // Initial execution plus two retries
        assert_eq!(done.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(done.error.unwrap().contains("simulated failure"));
        assert!(done.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_frees_worker() {
        let queue = JobQueue::new(quick_config(1));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("slow", Arc::new(SleepHandler { millis: 2_000 }))
            .unwrap();
        queue
            .register_handler("quick", Arc::new(CounterHandler::new(counter.clone())))
            .unwrap();

        let slow = queue
            .add(
                "slow",
                json!({}),
                JobOptions::new()
                    .with_timeout(Duration::from_millis(100))
                    .with_max_retries(0),
            )
            .await
            .unwrap();
        queue.start().await;

        let done = settled(&queue, slow.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert_eq!(
            done.error.as_deref(),
            Some("Execution timed out after 100ms")
        );

        // The worker must be free for new work long before the sleep ends
        let quick = queue.add("quick", json!({}), JobOptions::new()).await.unwrap();
        let done = settled(&queue, quick.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_without_attempt() {
        let queue = JobQueue::new(quick_config(1));
        let job = queue
            .add("nobody:home", json!({}), JobOptions::new().with_max_retries(5))
            .await
            .unwrap();
        queue.start().await;

        let done = settled(&queue, job.id).await;
        queue.shutdown().await;

        assert_eq!(done.status, JobStatus::Failed);
        // Never executed, never retried
        assert_eq!(done.attempts, 0);
        assert_eq!(
            done.error.as_deref(),
            Some("No handler registered for job type 'nobody:home'")
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let queue = JobQueue::new(quick_config(1));
        let counter = Arc::new(AtomicU32::new(0));
        queue.register_handler("bomb", Arc::new(PanicHandler)).unwrap();
        queue
            .register_handler("quick", Arc::new(CounterHandler::new(counter.clone())))
            .unwrap();

        let bomb = queue
            .add("bomb", json!({}), JobOptions::new().with_max_retries(1))
            .await
            .unwrap();
        queue.start().await;

        let done = settled(&queue, bomb.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.error.as_deref(), Some("Execution failed: handler panicked"));

        // The pool survives the panic
        let quick = queue.add("quick", json!({}), JobOptions::new()).await.unwrap();
        let done = settled(&queue, quick.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_workers_drain_the_queue() {
        let queue = JobQueue::new(quick_config(2));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("work", Arc::new(CounterHandler::new(counter.clone())))
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..10 {
            let job = queue
                .add("work", json!({ "n": i }), JobOptions::new())
                .await
                .unwrap();
            ids.push(job.id);
        }
        queue.start().await;

        for id in ids {
            let done = settled(&queue, id).await;
            assert_eq!(done.status, JobStatus::Completed);
        }
        queue.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        let stats = queue.stats().await;
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_its_moment() {
        let queue = JobQueue::new(quick_config(1));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("later", Arc::new(CounterHandler::new(counter.clone())))
            .unwrap();

        let job = queue
            .add(
                "later",
                json!({}),
                JobOptions::new().with_delay(Duration::from_millis(300)),
            )
            .await
            .unwrap();
        queue.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let waiting = queue.get(job.id).await.unwrap();
        assert_eq!(waiting.status, JobStatus::Waiting);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let stats = queue.stats().await;
        assert_eq!(stats.delayed, 1);

        let done = settled(&queue, job.id).await;
        queue.shutdown().await;

        assert_eq!(done.status, JobStatus::Completed);
        let started = done.started_at.expect("completed job has started_at");
        let earliest = done.created_at + chrono::Duration::milliseconds(250);
        assert!(started >= earliest, "job started before its delay elapsed");
    }

    #[tokio::test]
    async fn test_retry_reschedule_follows_backoff_progression() {
        use grist_queue::JobStore;

        let clock = Arc::new(ManualClock::starting_now());
        let store = JobStore::new(QueueConfig::new(), clock.clone());
        let policy = RetryPolicy::new(
            BackoffStrategy::Exponential {
                base: Duration::from_secs(1),
            },
            0.0,
        );

        let job = store
            .add("unit", json!({}), JobOptions::new().with_max_retries(2))
            .await
            .unwrap();

        // First execution fails, first retry waits the base delay
        let claimed = store.claim_next().await.expect("job is ready");
        assert_eq!(store.active_count().await, 1);
        let attempt = store.begin_attempt(claimed.id).await.unwrap();
        assert_eq!(attempt.attempts, 1);
        let delay = policy.next_delay(attempt.attempts, attempt.max_retries).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        let parked = store
            .reschedule(job.id, "failed".to_string(), delay)
            .await
            .unwrap();
        assert_eq!(parked.process_at, store.now() + chrono::Duration::seconds(1));

        // Not claimable until the clock reaches process_at
        assert!(store.claim_next().await.is_none());
        clock.advance(Duration::from_secs(1));
        let claimed = store.claim_next().await.expect("retry is due");
        let attempt = store.begin_attempt(claimed.id).await.unwrap();
        assert_eq!(attempt.attempts, 2);

        // Second retry doubles the delay
        let delay = policy.next_delay(attempt.attempts, attempt.max_retries).unwrap();
        assert_eq!(delay, Duration::from_secs(2));
        store
            .reschedule(job.id, "failed".to_string(), delay)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));
        let claimed = store.claim_next().await.expect("second retry is due");
        let attempt = store.begin_attempt(claimed.id).await.unwrap();
        assert_eq!(attempt.attempts, 3);

        // Budget exhausted: two retries on top of the initial execution
        assert!(policy.next_delay(attempt.attempts, attempt.max_retries).is_none());
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_work() {
        let queue = JobQueue::new(quick_config(2));
        queue
            .register_handler("slowish", Arc::new(SleepHandler { millis: 200 }))
            .unwrap();

        for _ in 0..3 {
            queue.add("slowish", json!({}), JobOptions::new()).await.unwrap();
        }
        queue.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.stop().await;

        // Nothing is left mid-execution after stop returns
        let stats = queue.stats().await;
        assert_eq!(stats.active, 0);
        for job in queue.list(None, 10).await {
            assert!(
                job.status == JobStatus::Completed || job.status == JobStatus::Waiting,
                "unexpected status {} after stop",
                job.status
            );
        }
    }

    #[tokio::test]
    async fn test_start_after_stop_resumes_waiting_jobs() {
        let queue = JobQueue::new(quick_config(1));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("work", Arc::new(CounterHandler::new(counter.clone())))
            .unwrap();

        queue.stop().await;

        let job = queue.add("work", json!({}), JobOptions::new()).await.unwrap();
        queue.start().await;
        let done = settled(&queue, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);

        queue.stop().await;
        let parked = queue.add("work", json!({}), JobOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.get(parked.id).await.unwrap().status, JobStatus::Waiting);

        queue.start().await;
        let done = settled(&queue, parked.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        queue.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let queue = JobQueue::new(quick_config(1));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("once", Arc::new(CounterHandler::new(counter.clone())))
            .unwrap();

        queue.start().await;
        queue.start().await;

        let job = queue.add("once", json!({}), JobOptions::new()).await.unwrap();
        settled(&queue, job.id).await;
        queue.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.completed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_safe() {
        let queue = JobQueue::new(quick_config(1));
        queue.start().await;
        queue.shutdown().await;
        queue.shutdown().await;
        assert_eq!(queue.stats().await.completed, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let feed = Arc::new(BroadcastEventSink::new(64));
        let mut rx = feed.subscribe();
        let queue = JobQueue::with_components(
            quick_config(1),
            Arc::new(grist_queue::SystemClock),
            feed.clone(),
        );
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("flaky", Arc::new(CounterHandler::failing(counter, 1)))
            .unwrap();

        let job = queue
            .add("flaky", json!({}), JobOptions::new().with_max_retries(1))
            .await
            .unwrap();
        queue.start().await;
        settled(&queue, job.id).await;

        let events = tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            loop {
                let event = rx.recv().await.expect("event stream closed");
                let finished = matches!(event, QueueEvent::Completed { .. });
                seen.push(event);
                if finished {
                    break;
                }
            }
            seen
        })
        .await
        .expect("lifecycle events did not arrive in time");
        queue.shutdown().await;

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec![
                "job:added",
                "job:started",
                "job:retry",
                "job:started",
                "job:completed"
            ]
        );
        for event in &events {
            assert_eq!(event.job_id(), job.id);
        }
        let retry_delay = events.iter().find_map(|e| match e {
            QueueEvent::Retry { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        });
        assert_eq!(retry_delay, Some(0));
    }

    #[tokio::test]
    async fn test_progress_and_log_reach_the_job_record() {
        let feed = Arc::new(BroadcastEventSink::new(64));
        let mut rx = feed.subscribe();
        let queue = JobQueue::with_components(
            quick_config(1),
            Arc::new(grist_queue::SystemClock),
            feed.clone(),
        );
        queue.register_handler("steps", Arc::new(ProgressHandler)).unwrap();

        let job = queue.add("steps", json!({}), JobOptions::new()).await.unwrap();
        queue.start().await;
        let done = settled(&queue, job.id).await;
        queue.shutdown().await;

        // Completion forces progress to 100
        assert_eq!(done.progress, 100);
        assert!(done.logs.iter().any(|entry| entry.message == "halfway there"));

        let progress_seen = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await.expect("event stream closed") {
                    QueueEvent::Progress { job } => return job.progress,
                    _ => continue,
                }
            }
        })
        .await
        .expect("no progress event arrived");
        assert_eq!(progress_seen, 50);
    }

    #[tokio::test]
    async fn test_remove_only_touches_inactive_jobs() {
        let queue = JobQueue::new(quick_config(1));
        queue
            .register_handler("slowish", Arc::new(SleepHandler { millis: 500 }))
            .unwrap();

        // Waiting jobs can be removed
        let parked = queue.add("slowish", json!({}), JobOptions::new()).await.unwrap();
        assert!(queue.remove(parked.id).await);
        assert!(queue.get(parked.id).await.is_err());

        // Active jobs cannot
        let running = queue.add("slowish", json!({}), JobOptions::new()).await.unwrap();
        queue.start().await;
        wait_for_status(&queue, running.id, JobStatus::Active).await;
        assert!(!queue.remove(running.id).await);

        let done = settled(&queue, running.id).await;
        assert_eq!(done.status, JobStatus::Completed);

        // Terminal jobs can be removed, unknown ids cannot
        assert!(queue.remove(running.id).await);
        assert!(!queue.remove(running.id).await);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_reclaims_old_terminal_jobs() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = JobQueue::with_components(
            quick_config(1),
            clock.clone(),
            Arc::new(NullEventSink),
        );
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("work", Arc::new(CounterHandler::new(counter)))
            .unwrap();

        let finished = queue.add("work", json!({}), JobOptions::new()).await.unwrap();
        queue.start().await;
        let done = settled(&queue, finished.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        queue.stop().await;

        // A waiting job must survive any sweep
        let parked = queue.add("work", json!({}), JobOptions::new()).await.unwrap();

        // Too recent to sweep
        assert_eq!(queue.sweep(Duration::from_secs(3600)).await, 0);

        clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(queue.sweep(Duration::from_secs(3600)).await, 1);
        assert!(queue.get(finished.id).await.is_err());
        assert!(queue.get(parked.id).await.is_ok());

        // Nothing left to sweep
        assert_eq!(queue.sweep(Duration::from_secs(3600)).await, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_blank_job_type_is_rejected() {
        let queue = JobQueue::new(quick_config(1));
        assert!(queue.add("", json!({}), JobOptions::new()).await.is_err());
        assert!(queue.add("   ", json!({}), JobOptions::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_track_types_and_durations() {
        let queue = JobQueue::new(quick_config(2));
        let counter = Arc::new(AtomicU32::new(0));
        queue
            .register_handler("ingest", Arc::new(SleepHandler { millis: 50 }))
            .unwrap();
        queue
            .register_handler("notify", Arc::new(CounterHandler::new(counter)))
            .unwrap();

        let a = queue.add("ingest", json!({}), JobOptions::new()).await.unwrap();
        let b = queue.add("ingest", json!({}), JobOptions::new()).await.unwrap();
        let c = queue.add("notify", json!({}), JobOptions::new()).await.unwrap();
        queue.start().await;
        settled(&queue, a.id).await;
        settled(&queue, b.id).await;
        settled(&queue, c.id).await;
        queue.shutdown().await;

        let stats = queue.stats().await;
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.total_added, 3);
        assert_eq!(stats.per_type.get("ingest"), Some(&2));
        assert_eq!(stats.per_type.get("notify"), Some(&1));
        assert!(stats.avg_duration_ms > 0.0);
    }
}
