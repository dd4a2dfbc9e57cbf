//! Prometheus metrics for the worker fleet.
//!
//! Metrics live in `OnceLock` statics so recording sites never carry a
//! registry around; before [`init_metrics`] runs, recording is a no-op.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use std::time::Duration;

use crate::broker::{QueueName, QueueStats};

/// Global registry for all tuneforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished jobs, labeled by queue and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job wall time in seconds, labeled by queue. Buckets reach into the
/// hours because training jobs are not time-bounded.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Queue depths, labeled by queue and `pending`/`processing`.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Workers currently running.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initializes and registers all metrics. Call once at startup; repeated
/// calls leave the first registration in place.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("tuneforge_jobs_total", "Finished jobs by queue and outcome"),
        &["queue", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "tuneforge_job_duration_seconds",
            "Job wall time in seconds",
        )
        .buckets(vec![
            1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0,
        ]),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("tuneforge_queue_depth", "Jobs per queue and state"),
        &["queue", "state"],
    )?;

    let active_workers = Gauge::new("tuneforge_active_workers", "Workers currently running")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // set() failing means another call got here first; keep that one.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Records one finished job.
pub fn record_job(queue: QueueName, outcome: &str, duration: Duration) {
    if let Some(jobs) = JOBS_TOTAL.get() {
        jobs.with_label_values(&[queue.as_str(), outcome]).inc();
    }
    if let Some(durations) = JOB_DURATION.get() {
        durations
            .with_label_values(&[queue.as_str()])
            .observe(duration.as_secs_f64());
    }
}

/// Publishes one queue's depths.
pub fn record_queue_depth(stats: &QueueStats) {
    if let Some(depth) = QUEUE_DEPTH.get() {
        depth
            .with_label_values(&[stats.queue.as_str(), "pending"])
            .set(stats.pending as f64);
        depth
            .with_label_values(&[stats.queue.as_str(), "processing"])
            .set(stats.processing as f64);
    }
}

/// Counts a worker in.
pub fn worker_started() {
    if let Some(workers) = ACTIVE_WORKERS.get() {
        workers.inc();
    }
}

/// Counts a worker out.
pub fn worker_stopped() {
    if let Some(workers) = ACTIVE_WORKERS.get() {
        workers.dec();
    }
}

/// Exports all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&families, &mut buffer) {
        return format!("# Error encoding metrics: {error}\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|error| format!("# Error encoding metrics: {error}\n"))
}
