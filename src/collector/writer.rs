use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::CollectorStats;
use super::CollectorError;
use crate::config::CollectorConfig;
use crate::event::Event;
use crate::store::EventStore;

/// Outcome of one flush: committed row count, or the failure that discarded
/// the batch.
pub(crate) type FlushOutcome = Result<usize, CollectorError>;

/// Request to commit everything accepted so far.
pub(crate) struct FlushRequest {
    pub ack: oneshot::Sender<FlushOutcome>,
}

/// Single consumer of the ingestion queue.
///
/// Accumulates events and commits them in one transaction when the batch
/// fills, when the flush interval elapses, on an explicit flush request, and
/// once more at shutdown.
pub(crate) struct BatchWriter {
    store: Arc<EventStore>,
    cfg: CollectorConfig,
    stats: Arc<CollectorStats>,
    pending: Vec<Event>,
}

impl BatchWriter {
    pub(crate) fn new(
        store: Arc<EventStore>,
        cfg: CollectorConfig,
        stats: Arc<CollectorStats>,
    ) -> Self {
        let pending = Vec::with_capacity(cfg.batch_size);
        Self {
            store,
            cfg,
            stats,
            pending,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut flushes: mpsc::Receiver<FlushRequest>,
        cancel: CancellationToken,
    ) {
        let period = self.cfg.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain(&mut events, &mut flushes).await;
                    return;
                }

                Some(req) = flushes.recv() => {
                    while let Ok(event) = events.try_recv() {
                        self.pending.push(event);
                    }
                    let outcome = self.flush().await;
                    // The caller may have stopped waiting.
                    let _ = req.ack.send(outcome);
                }

                event = events.recv() => {
                    match event {
                        Some(event) => {
                            self.pending.push(event);

                            // Pull whatever else is ready without blocking.
                            while self.pending.len() < self.cfg.batch_size {
                                match events.try_recv() {
                                    Ok(event) => self.pending.push(event),
                                    Err(_) => break,
                                }
                            }

                            if self.pending.len() >= self.cfg.batch_size {
                                let _ = self.flush().await;
                            }
                        }
                        None => {
                            // Every producer handle is gone.
                            let _ = self.flush().await;
                            return;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        let _ = self.flush().await;
                    }
                }
            }
        }
    }

    /// Final drain: stop intake, pull queued events, then flush once. The
    /// whole drain, final commit and retries included, is bounded by
    /// `drain_timeout`. Flush requests still waiting get the final outcome.
    async fn drain(
        &mut self,
        events: &mut mpsc::Receiver<Event>,
        flushes: &mut mpsc::Receiver<FlushRequest>,
    ) {
        let deadline = Instant::now() + self.cfg.drain_timeout;
        events.close();
        flushes.close();

        while let Ok(event) = events.try_recv() {
            self.pending.push(event);
        }

        let drained = self.pending.len();
        let outcome = match tokio::time::timeout_at(deadline, self.flush()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // The abandoned attempt may still be blocked in the store; it
                // is not retried.
                error!(
                    lost = drained,
                    drain_timeout = ?self.cfg.drain_timeout,
                    "drain deadline elapsed before the final batch committed, discarding events"
                );
                Err(CollectorError::DeadlineExceeded)
            }
        };
        while let Ok(req) = flushes.try_recv() {
            let _ = req.ack.send(outcome.clone());
        }

        info!(drained, "batch writer stopped");
    }

    /// Commits the accumulated batch, retrying with exponential backoff.
    ///
    /// After the last failed attempt the batch is discarded and counted as
    /// write-failed. The accumulator is always empty on return.
    async fn flush(&mut self) -> FlushOutcome {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let batch = Arc::new(std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.cfg.batch_size),
        ));
        let size = batch.len();
        let started = Instant::now();
        let mut backoff = self.cfg.write_retry_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.commit(Arc::clone(&batch)).await {
                Ok(rows) => {
                    let elapsed = started.elapsed();
                    self.stats.record_committed(rows as u64, elapsed);
                    debug!(
                        events = rows,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "batch committed"
                    );
                    return Ok(rows);
                }
                Err(e) if attempt <= self.cfg.write_retries => {
                    warn!(error = %e, attempt, events = size, "batch write failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        attempts = attempt,
                        events = size,
                        "batch write failed, discarding events"
                    );
                    self.stats.record_write_failed(size as u64);
                    return Err(CollectorError::WriteFailed { events: size });
                }
            }
        }
    }

    async fn commit(&self, batch: Arc<Vec<Event>>) -> anyhow::Result<usize> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.insert_events(&batch, Utc::now()))
            .await
            .context("write task failed")?
    }
}
