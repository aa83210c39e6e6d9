//! Grist Demo: CSV Ingest Pipeline
//!
//! This example demonstrates the full queue lifecycle:
//! 1. Handler registration and priority scheduling
//! 2. Delayed jobs and live progress reporting
//! 3. Automatic retries with backoff
//! 4. Execution timeouts with cooperative cancellation
//! 5. Stats, sweeping, and graceful shutdown
//!
//! Run with: cargo run -p grist-demo
//! Set RUST_LOG=grist_queue=debug to watch the queue's own tracing output.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use grist_queue::{
    BackoffStrategy, BroadcastEventSink, Job, JobContext, JobHandler, JobId, JobOptions,
    JobQueue, JobStatus, MultiplexEventSink, QueueConfig, SystemClock, TracingEventSink,
};

const CATALOG_CSV: &str = "\
sku,name,qty,price
GR-100,Stone-ground flour,12,4.50
GR-204,Rye berries,3,2.10
GR-310,Malted barley,7,3.75
";

const SUPPLIER_CSV: &str = "\
sku,name,qty,price
GR-418,Buckwheat groats,5,6.20
GR-512,,2,3.40
GR-600,Spelt,4
";

/// Parses a CSV payload, validates every row, and digests the good ones.
///
/// Rows with empty fields or the wrong column count are collected as
/// rejects instead of failing the whole job.
struct CsvIngestHandler;

#[async_trait]
impl JobHandler for CsvIngestHandler {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value> {
        let text = ctx.payload()["csv"]
            .as_str()
            .context("payload is missing the 'csv' text")?
            .to_string();
        let source = ctx.payload()["source"].as_str().unwrap_or("inline").to_string();
        ctx.log(format!("Ingesting CSV from {source}")).await;

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader.headers()?.clone();

        let mut rows = Vec::new();
        let mut rejects = Vec::new();
        let records: Vec<_> = reader.records().collect();
        let total = records.len().max(1);
        for (i, outcome) in records.into_iter().enumerate() {
            // Line 1 is the header row
            let line = i + 2;
            match outcome {
                Ok(record) => {
                    let mut data = serde_json::Map::new();
                    for (header, field) in headers.iter().zip(record.iter()) {
                        data.insert(header.to_string(), Value::String(field.to_string()));
                    }
                    if record.iter().any(|field| field.trim().is_empty()) {
                        rejects.push(json!({
                            "line": line,
                            "error": "Row contains empty fields.",
                            "data": data,
                        }));
                    } else {
                        rows.push(json!({
                            "line": line,
                            "data": data,
                            "hash": row_digest(&record),
                        }));
                    }
                }
                Err(e) => {
                    rejects.push(json!({
                        "line": line,
                        "error": format!("Failed to parse row: {e}"),
                        "data": Value::Null,
                    }));
                }
            }
            ctx.progress(((i + 1) * 100 / total) as u8).await;
        }

        ctx.log(format!(
            "Ingested {} rows, rejected {}",
            rows.len(),
            rejects.len()
        ))
        .await;
        Ok(json!({
            "source": source,
            "processed_rows": rows,
            "errors": rejects,
        }))
    }
}

/// SHA-256 over the comma-joined fields of one record.
fn row_digest(record: &csv::StringRecord) -> String {
    let joined = record.iter().collect::<Vec<_>>().join(",");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fails twice before succeeding, to show the retry policy at work.
#[derive(Default)]
struct FlakyReportHandler {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for FlakyReportHandler {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value> {
        let seen = self.calls.fetch_add(1, Ordering::SeqCst);
        if seen < 2 {
            anyhow::bail!("upstream report service returned 503");
        }
        Ok(json!({ "report": "weekly-summary", "attempt": ctx.attempt() }))
    }
}

/// Sleeps far past its time budget, checking for cancellation as it goes.
struct SlowExportHandler;

#[async_trait]
impl JobHandler for SlowExportHandler {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value> {
        for _ in 0..40 {
            if ctx.is_cancelled() {
                anyhow::bail!("export cancelled");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(json!({ "exported": true }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    println!("🌾 Grist Job Queue Demo: CSV Ingest Pipeline\n");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    // ═══════════════════════════════════════════════════════════════════
    // STEP 1: Configure the Queue and Register Handlers
    // ═══════════════════════════════════════════════════════════════════
    println!("⚙️  **STEP 1: Configuring the Queue**\n");

    let config = QueueConfig::new()
        .with_workers(2)
        .with_idle_interval(Duration::from_millis(200))
        .with_default_timeout(Duration::from_secs(5))
        .with_backoff(BackoffStrategy::Constant {
            delay: Duration::from_millis(300),
        });
    println!("   └─ 2 workers, 300ms retry backoff");

    let feed = Arc::new(BroadcastEventSink::new(256));
    let mut sinks = MultiplexEventSink::new(vec![Arc::new(TracingEventSink)]);
    sinks.add_sink(feed.clone());
    let queue = Arc::new(JobQueue::with_components(
        config,
        Arc::new(SystemClock),
        Arc::new(sinks),
    ));

    queue.register_handler("csv:ingest", Arc::new(CsvIngestHandler))?;
    queue.register_handler("report:weekly", Arc::new(FlakyReportHandler::default()))?;
    queue.register_handler("export:archive", Arc::new(SlowExportHandler))?;
    println!("   └─ Handlers: csv:ingest, report:weekly, export:archive\n");

    // Live event feed, printed as the workers make progress
    let mut updates = feed.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = updates.recv().await {
            let id = event.job_id().to_string();
            println!(
                "   📨 {:<13} {} ({})",
                event.event_type(),
                &id[..8],
                event.job().job_type
            );
        }
    });

    // Ctrl-C drains the workers before the process exits
    let watchdog = Arc::clone(&queue);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Interrupt received, draining workers...");
            watchdog.shutdown().await;
            std::process::exit(130);
        }
    });

    // ═══════════════════════════════════════════════════════════════════
    // STEP 2: Enqueue the Day's Work
    // ═══════════════════════════════════════════════════════════════════
    println!("📥 **STEP 2: Enqueuing Jobs**\n");

    let supplier = queue
        .add(
            "csv:ingest",
            json!({ "source": "supplier-feed", "csv": SUPPLIER_CSV }),
            JobOptions::new().with_priority(5),
        )
        .await?;
    println!("   └─ supplier feed      (priority 5, messy rows)");

    let catalog = queue
        .add(
            "csv:ingest",
            json!({ "source": "catalog", "csv": CATALOG_CSV }),
            JobOptions::new().with_priority(1),
        )
        .await?;
    println!("   └─ catalog refresh    (priority 1)");

    let batch = queue
        .add(
            "csv:ingest",
            json!({ "source": "end-of-day", "csv": CATALOG_CSV }),
            JobOptions::new().with_delay(Duration::from_millis(1200)),
        )
        .await?;
    println!("   └─ end-of-day batch   (delayed 1.2s)");

    let report = queue
        .add(
            "report:weekly",
            json!({ "week": 34 }),
            JobOptions::new().with_max_retries(3),
        )
        .await?;
    println!("   └─ weekly report      (flaky, up to 3 retries)");

    let export = queue
        .add(
            "export:archive",
            json!({ "target": "cold-storage" }),
            JobOptions::new()
                .with_timeout(Duration::from_millis(300))
                .with_max_retries(0),
        )
        .await?;
    println!("   └─ archive export     (300ms budget, will time out)");

    let transcode = queue
        .add("video:transcode", json!({ "src": "intro.mp4" }), JobOptions::new())
        .await?;
    println!("   └─ video transcode    (no handler registered)\n");

    let before = queue.stats().await;
    println!(
        "   Queue before start: {} waiting ({} delayed)\n",
        before.waiting, before.delayed
    );

    // ═══════════════════════════════════════════════════════════════════
    // STEP 3: Run the Pipeline
    // ═══════════════════════════════════════════════════════════════════
    println!("🚀 **STEP 3: Processing**\n");
    queue.start().await;

    let supplier = settled(&queue, supplier.id).await?;
    let catalog = settled(&queue, catalog.id).await?;
    let batch = settled(&queue, batch.id).await?;
    let report = settled(&queue, report.id).await?;
    let export = settled(&queue, export.id).await?;
    let transcode = settled(&queue, transcode.id).await?;

    // ═══════════════════════════════════════════════════════════════════
    // STEP 4: Outcomes
    // ═══════════════════════════════════════════════════════════════════
    println!("\n📋 **STEP 4: Outcomes**\n");

    print_ingest("Supplier feed", &supplier);
    print_ingest("Catalog refresh", &catalog);
    print_ingest("End-of-day batch", &batch);

    println!(
        "   Weekly report:    {} after {} attempts",
        report.status, report.attempts
    );
    println!(
        "   Archive export:   {} ({})",
        export.status,
        export.error.as_deref().unwrap_or("no error")
    );
    println!(
        "   Video transcode:  {} after {} attempts ({})\n",
        transcode.status,
        transcode.attempts,
        transcode.error.as_deref().unwrap_or("no error")
    );

    // ═══════════════════════════════════════════════════════════════════
    // STEP 5: Stats and Cleanup
    // ═══════════════════════════════════════════════════════════════════
    println!("📊 **STEP 5: Stats and Cleanup**\n");

    let stats = queue.stats().await;
    println!("   completed: {}", stats.completed);
    println!("   failed:    {}", stats.failed);
    println!("   avg time:  {:.1}ms", stats.avg_duration_ms);
    for (job_type, count) in &stats.per_type {
        println!("   └─ {job_type}: {count}");
    }

    let failed = queue.list(Some(JobStatus::Failed), 10).await;
    println!("\n   Failed jobs on record:");
    for job in &failed {
        println!(
            "   └─ {} ({}): {}",
            &job.id.to_string()[..8],
            job.job_type,
            job.error.as_deref().unwrap_or("unknown")
        );
    }

    let swept = queue.sweep(Duration::ZERO).await;
    println!("\n   🧹 Swept {swept} finished jobs");

    queue.shutdown().await;
    println!("\n✅ Queue shut down cleanly");
    Ok(())
}

/// Polls until the job reaches a terminal status.
async fn settled(queue: &JobQueue, id: JobId) -> anyhow::Result<Job> {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let job = queue.get(id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("job {id} did not settle within 15s"))?
}

fn print_ingest(label: &str, job: &Job) {
    let empty = Vec::new();
    let rows = job
        .result
        .as_ref()
        .and_then(|r| r["processed_rows"].as_array())
        .unwrap_or(&empty);
    let rejects = job
        .result
        .as_ref()
        .and_then(|r| r["errors"].as_array())
        .unwrap_or(&empty);

    println!(
        "   {label}: {} rows ingested, {} rejected in {}ms",
        rows.len(),
        rejects.len(),
        job.duration_ms().unwrap_or(0)
    );
    if let Some(first) = rows.first() {
        println!(
            "   └─ line {} digest {}",
            first["line"],
            first["hash"].as_str().unwrap_or("?")
        );
    }
    for reject in rejects {
        println!(
            "   └─ ⚠️  line {}: {}",
            reject["line"],
            reject["error"].as_str().unwrap_or("?")
        );
    }
}

fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}
