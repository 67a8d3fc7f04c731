pub mod stats;
mod writer;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::stats::{CollectorStats, StatsSnapshot};
use self::writer::{BatchWriter, FlushRequest};
use crate::config::CollectorConfig;
use crate::event::validate::{ValidationError, Validator};
use crate::event::{Event, ValueClass};
use crate::metrics::Metrics;
use crate::store::EventStore;

/// Pending flush requests the writer can hold before callers wait to enqueue.
const FLUSH_QUEUE_CAPACITY: usize = 16;

/// Errors surfaced to producers and flush callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("batch rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("collector is closed")]
    Closed,

    #[error("flush deadline exceeded")]
    DeadlineExceeded,

    #[error("write failed, {events} events discarded")]
    WriteFailed { events: usize },
}

/// Lifecycle of a collector. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CollectorState {
    Running = 0,
    Draining = 1,
    Closed = 2,
}

impl CollectorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Per-submission accounting returned to the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubmitReport {
    /// Events placed on the queue.
    pub accepted: usize,
    /// Events removed by validation.
    pub rejected: usize,
    /// Valid events lost to backpressure.
    pub dropped: usize,
}

type Receivers = (mpsc::Receiver<Event>, mpsc::Receiver<FlushRequest>);

/// Ingestion front door: validates submissions, applies value-class
/// backpressure, and feeds the single batch writer task.
///
/// Producers never touch the store. Only the writer task spawned by
/// [`Collector::start`] commits events.
pub struct Collector {
    cfg: CollectorConfig,
    validator: Validator,
    store: Arc<EventStore>,
    stats: Arc<CollectorStats>,
    state: AtomicU8,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<Event>,
    flush_tx: mpsc::Sender<FlushRequest>,
    /// Channel ends handed to the writer on start.
    receivers: parking_lot::Mutex<Option<Receivers>>,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Collector {
    /// Creates a collector without starting its writer.
    ///
    /// Submissions are accepted immediately and wait in the queue until
    /// [`Collector::start`] is called.
    pub fn new(
        cfg: CollectorConfig,
        store: Arc<EventStore>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        cfg.validate()?;

        let (event_tx, event_rx) = mpsc::channel(cfg.queue_capacity);
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_QUEUE_CAPACITY);

        Ok(Self {
            validator: Validator::new(cfg.max_batch_events),
            cfg,
            store,
            stats: Arc::new(CollectorStats::new(metrics)),
            state: AtomicU8::new(CollectorState::Running as u8),
            cancel: CancellationToken::new(),
            event_tx,
            flush_tx,
            receivers: parking_lot::Mutex::new(Some((event_rx, flush_rx))),
            run_task: tokio::sync::Mutex::new(None),
        })
    }

    /// Creates a collector and starts its writer on the current runtime.
    pub async fn spawn(
        cfg: CollectorConfig,
        store: Arc<EventStore>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let collector = Self::new(cfg, store, metrics)?;
        collector.start().await?;
        Ok(collector)
    }

    /// Spawns the batch writer task. May be called once.
    pub async fn start(&self) -> Result<()> {
        if self.state() != CollectorState::Running {
            bail!("collector is closed");
        }
        let Some((event_rx, flush_rx)) = self.receivers.lock().take() else {
            bail!("collector already started");
        };

        let writer = BatchWriter::new(
            Arc::clone(&self.store),
            self.cfg.clone(),
            Arc::clone(&self.stats),
        );
        let run_task = tokio::spawn(writer.run(event_rx, flush_rx, self.cancel.clone()));
        *self.run_task.lock().await = Some(run_task);

        info!(
            queue_capacity = self.cfg.queue_capacity,
            batch_size = self.cfg.batch_size,
            flush_interval = ?self.cfg.flush_interval,
            "collector started"
        );

        Ok(())
    }

    /// Validates and enqueues one client batch.
    ///
    /// Errors only when the batch is refused as a whole or the collector is
    /// no longer running. Per-event rejections and backpressure drops are
    /// reported in the returned [`SubmitReport`].
    pub async fn submit(&self, session_id: &str, raw: &[u8]) -> Result<SubmitReport, CollectorError> {
        if self.state() != CollectorState::Running {
            return Err(CollectorError::Closed);
        }

        let batch = match self.validator.validate_batch(session_id, raw) {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.record_batch_rejected(e.kind());
                return Err(e.into());
            }
        };
        self.stats.record_rejected(batch.rejected as u64);

        let mut report = SubmitReport {
            rejected: batch.rejected,
            ..Default::default()
        };

        for event in batch.events {
            match self.enqueue(event).await {
                Ok(true) => report.accepted += 1,
                Ok(false) => report.dropped += 1,
                Err(e) => {
                    // Events queued before the collector closed still drain.
                    self.record_submission(&report);
                    return Err(e);
                }
            }
        }

        self.record_submission(&report);
        Ok(report)
    }

    fn record_submission(&self, report: &SubmitReport) {
        self.stats.record_accepted(report.accepted as u64);
        if report.dropped > 0 {
            self.stats.record_dropped(report.dropped as u64);
            warn!(
                dropped = report.dropped,
                accepted = report.accepted,
                "ingestion queue full, dropping events"
            );
        }
        self.stats.set_queue_depth(self.queue_len());
    }

    /// Returns false when the event was dropped for lack of queue space.
    async fn enqueue(&self, event: Event) -> Result<bool, CollectorError> {
        match event.event_type.value_class() {
            ValueClass::High => match self
                .event_tx
                .send_timeout(event, self.cfg.high_value_wait)
                .await
            {
                Ok(()) => Ok(true),
                Err(SendTimeoutError::Timeout(_)) => Ok(false),
                Err(SendTimeoutError::Closed(_)) => Err(CollectorError::Closed),
            },
            ValueClass::Low => match self.event_tx.try_send(event) {
                Ok(()) => Ok(true),
                Err(TrySendError::Full(_)) => Ok(false),
                Err(TrySendError::Closed(_)) => Err(CollectorError::Closed),
            },
        }
    }

    /// Commits every event accepted before this call, waiting at most
    /// `timeout`.
    ///
    /// Dropping the returned future abandons the wait; the flush itself still
    /// runs.
    pub async fn flush_now(&self, timeout: Duration) -> Result<usize, CollectorError> {
        if self.state() != CollectorState::Running {
            return Err(CollectorError::Closed);
        }

        let (ack, done) = oneshot::channel();
        let flush_tx = &self.flush_tx;
        let request = async move {
            flush_tx
                .send(FlushRequest { ack })
                .await
                .map_err(|_| CollectorError::Closed)?;
            done.await.map_err(|_| CollectorError::Closed)?
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| CollectorError::DeadlineExceeded)?
    }

    /// Stops intake, drains the queue into a final flush, and waits for the
    /// writer to exit. Safe to call more than once; later calls wait for the
    /// first to finish.
    pub async fn close(&self) {
        let first = self
            .state
            .compare_exchange(
                CollectorState::Running as u8,
                CollectorState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        self.cancel.cancel();

        let mut run_task = self.run_task.lock().await;
        if let Some(task) = run_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "batch writer task join failed");
            }
        }

        // Never started: whatever was queued has no writer.
        if let Some((mut event_rx, _)) = self.receivers.lock().take() {
            event_rx.close();
            let mut lost = 0u64;
            while event_rx.try_recv().is_ok() {
                lost += 1;
            }
            if lost > 0 {
                warn!(lost, "collector closed before start, discarding queued events");
            }
        }

        self.state.store(CollectorState::Closed as u8, Ordering::SeqCst);
        self.stats.set_queue_depth(0);
        drop(run_task);

        if first {
            let snap = self.stats.snapshot();
            info!(
                accepted = snap.accepted,
                committed = snap.committed,
                dropped = snap.dropped,
                rejected = snap.rejected,
                write_failed = snap.write_failed,
                "collector closed"
            );
        }
    }

    pub fn state(&self) -> CollectorState {
        CollectorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Events currently waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.event_tx.max_capacity() - self.event_tx.capacity()
    }

    /// Valid events lost to backpressure since start.
    pub fn dropped_count(&self) -> u64 {
        self.stats.dropped()
    }

    /// Events removed by validation since start.
    pub fn rejected_count(&self) -> u64 {
        self.stats.rejected()
    }

    /// Events discarded after every write attempt failed.
    pub fn write_failed_count(&self) -> u64 {
        self.stats.write_failed()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn config() -> CollectorConfig {
        CollectorConfig {
            flush_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn collector() -> Collector {
        let store = Arc::new(EventStore::open_in_memory().expect("store"));
        Collector::spawn(config(), store, None).await.expect("spawn")
    }

    #[tokio::test]
    async fn test_submit_reports_accepted_and_rejected() {
        let c = collector().await;
        let raw = br#"[
            {"event_type": "play", "track_stem": "intro"},
            {"event_type": "bogus"},
            {"event_type": "heartbeat", "track_stem": "intro", "position_seconds": 3}
        ]"#;

        let report = c.submit(SESSION, raw).await.expect("submit");
        assert_eq!(
            report,
            SubmitReport {
                accepted: 2,
                rejected: 1,
                dropped: 0
            }
        );
        assert_eq!(c.rejected_count(), 1);
        assert_eq!(c.dropped_count(), 0);

        assert_eq!(c.flush_now(Duration::from_secs(5)).await, Ok(2));
        c.close().await;
    }

    #[tokio::test]
    async fn test_batch_level_rejection_is_an_error() {
        let c = collector().await;
        let err = c.submit("not-a-session", b"[]").await.unwrap_err();
        assert_eq!(err, CollectorError::Rejected(ValidationError::InvalidSessionId));

        let err = c.submit(SESSION, b"{\"event_type\":\"play\"}").await.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::Rejected(ValidationError::MalformedBatch { .. })
        ));
        c.close().await;
    }

    #[tokio::test]
    async fn test_closed_collector_fails_fast() {
        let c = collector().await;
        c.close().await;
        assert_eq!(c.state(), CollectorState::Closed);

        let raw = br#"[{"event_type": "play", "track_stem": "intro"}]"#;
        assert_eq!(c.submit(SESSION, raw).await, Err(CollectorError::Closed));
        assert_eq!(
            c.flush_now(Duration::from_secs(1)).await,
            Err(CollectorError::Closed)
        );

        // Idempotent.
        c.close().await;
        assert_eq!(c.state(), CollectorState::Closed);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let c = collector().await;
        assert!(c.start().await.is_err());
        c.close().await;
    }

    #[tokio::test]
    async fn test_flush_without_writer_hits_deadline() {
        let store = Arc::new(EventStore::open_in_memory().expect("store"));
        let c = Collector::new(config(), store, None).expect("new");

        assert_eq!(
            c.flush_now(Duration::from_millis(20)).await,
            Err(CollectorError::DeadlineExceeded)
        );
        c.close().await;
    }

    #[tokio::test]
    async fn test_close_mid_batch_counts_queued_events() {
        let store = Arc::new(EventStore::open_in_memory().expect("store"));
        let cfg = CollectorConfig {
            queue_capacity: 1,
            high_value_wait: Duration::from_secs(5),
            ..config()
        };
        let c = Arc::new(Collector::new(cfg, store, None).expect("new"));

        // The heartbeat takes the only slot; the play then waits for space.
        let raw = br#"[
            {"event_type": "heartbeat", "track_stem": "a", "position_seconds": 1},
            {"event_type": "play", "track_stem": "a"}
        ]"#;
        let producer = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.submit(SESSION, raw).await })
        };
        while c.queue_len() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        c.close().await;
        let result = producer.await.expect("producer");
        assert_eq!(result, Err(CollectorError::Closed));
        assert_eq!(c.stats().accepted, 1);
        assert_eq!(c.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_len_tracks_unconsumed_events() {
        let store = Arc::new(EventStore::open_in_memory().expect("store"));
        let c = Collector::new(config(), store.clone(), None).expect("new");

        let raw = br#"[
            {"event_type": "heartbeat", "track_stem": "a", "position_seconds": 1},
            {"event_type": "heartbeat", "track_stem": "a", "position_seconds": 2}
        ]"#;
        c.submit(SESSION, raw).await.expect("submit");
        assert_eq!(c.queue_len(), 2);

        c.start().await.expect("start");
        c.flush_now(Duration::from_secs(5)).await.expect("flush");
        assert_eq!(c.queue_len(), 0);
        assert_eq!(store.count_events().expect("count"), 2);
        c.close().await;
    }
}
