//! # Grist Queue
//!
//! Embeddable asynchronous job queue for single-process services.
//!
//! Features:
//! - Priority scheduling with FIFO tie-breaks and delayed jobs
//! - Bounded worker pool with prompt wakeup on new work
//! - Retry with exponential backoff and optional jitter
//! - Per-job timeout guard that frees the worker immediately
//! - Lifecycle events through pluggable sinks
//! - Injectable clock for deterministic tests

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod queue;
pub mod retry;
mod scheduler;
pub mod stats;
pub mod store;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use error::QueueError;
pub use events::{
    BroadcastEventSink, EventSink, MultiplexEventSink, NullEventSink, QueueEvent, TracingEventSink,
};
pub use handler::{JobContext, JobHandler};
pub use job::{Job, JobId, JobLogEntry, JobOptions, JobStatus};
pub use queue::JobQueue;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use stats::QueueStats;
pub use store::JobStore;
