use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

use crate::maintenance::MaintenanceReport;

const NAMESPACE: &str = "listenstat";

/// Prometheus metrics for the ingestion pipeline and maintenance jobs.
///
/// All metrics use the "listenstat" namespace. The collector mirrors its
/// atomic counters here when a registry is attached.
pub struct Metrics {
    registry: Registry,

    /// Events that passed validation and entered the queue.
    pub events_accepted: Counter,
    /// Events dropped because the queue was full.
    pub events_dropped: Counter,
    /// Individual events rejected by validation.
    pub events_rejected: Counter,
    /// Whole submissions rejected by validation, by reason.
    pub batches_rejected: CounterVec,
    /// Events lost after every write attempt failed.
    pub events_write_failed: Counter,
    /// Events committed to the store.
    pub events_committed: Counter,
    /// Write transactions committed.
    pub batches_committed: Counter,
    /// Time spent committing one batch, retries included.
    pub flush_duration: Histogram,
    /// Events waiting in the ingestion queue.
    pub queue_depth: Gauge,
    /// Rollup rows inserted or updated by maintenance.
    pub rollup_rows: Counter,
    /// Raw events removed by retention.
    pub pruned_rows: Counter,
}

impl Metrics {
    /// Creates a metrics instance with every metric registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_accepted = Counter::with_opts(
            Opts::new("events_accepted_total", "Events accepted into the ingestion queue.")
                .namespace(NAMESPACE),
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Events dropped because the ingestion queue was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_rejected = Counter::with_opts(
            Opts::new("events_rejected_total", "Events rejected by validation.")
                .namespace(NAMESPACE),
        )?;
        let batches_rejected = CounterVec::new(
            Opts::new(
                "batches_rejected_total",
                "Submissions rejected as a whole, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let events_write_failed = Counter::with_opts(
            Opts::new(
                "events_write_failed_total",
                "Events discarded after all write attempts failed.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_committed = Counter::with_opts(
            Opts::new("events_committed_total", "Events committed to the store.")
                .namespace(NAMESPACE),
        )?;
        let batches_committed = Counter::with_opts(
            Opts::new("batches_committed_total", "Write transactions committed.")
                .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time spent committing one batch, retries included.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new("queue_depth", "Events waiting in the ingestion queue.")
                .namespace(NAMESPACE),
        )?;
        let rollup_rows = Counter::with_opts(
            Opts::new(
                "rollup_rows_total",
                "Daily rollup rows inserted or updated by maintenance.",
            )
            .namespace(NAMESPACE),
        )?;
        let pruned_rows = Counter::with_opts(
            Opts::new("pruned_rows_total", "Raw events removed by retention.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(events_accepted.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(batches_rejected.clone()))?;
        registry.register(Box::new(events_write_failed.clone()))?;
        registry.register(Box::new(events_committed.clone()))?;
        registry.register(Box::new(batches_committed.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(rollup_rows.clone()))?;
        registry.register(Box::new(pruned_rows.clone()))?;

        Ok(Self {
            registry,
            events_accepted,
            events_dropped,
            events_rejected,
            batches_rejected,
            events_write_failed,
            events_committed,
            batches_committed,
            flush_duration,
            queue_depth,
            rollup_rows,
            pruned_rows,
        })
    }

    /// Adds one maintenance pass to the rollup and retention counters.
    pub fn observe_maintenance(&self, report: &MaintenanceReport) {
        self.rollup_rows.inc_by(report.rollup_rows_affected as f64);
        self.pruned_rows.inc_by(report.pruned_rows as f64);
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}
