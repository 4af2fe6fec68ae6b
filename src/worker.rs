//! Worker driver
//!
//! One worker = one autonomous drain loop. Workers never coordinate
//! directly: the atomic snapshot/trim pair and sack notifications are the
//! only shared state.
//!
//! ## Round
//! 1. Snapshot the sack (atomic)
//! 2. Aggregate each known metric and write its splits
//! 3. Trim exactly what was snapshotted
//! 4. Delete the sack marker so the next append notifies again
//!
//! Measures of metrics the catalog no longer knows are trimmed without
//! being aggregated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregate::Aggregator;
use crate::error::{Result, SackError};
use crate::incoming::{IncomingBuffer, Measure, Sack, TrimStats};
use crate::metric::{MetricCatalog, MetricId};
use crate::storage::AggregateStore;

/// Rounds a single wake-up may run on one sack before yielding to others
const MAX_ROUNDS_PER_WAKEUP: usize = 8;

/// What one or more rounds did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    /// Rounds run
    pub rounds: usize,

    /// Metrics aggregated
    pub metrics: usize,

    /// Measures aggregated
    pub measures: usize,

    /// Split blocks written
    pub splits_written: usize,

    /// Metrics dropped because the catalog doesn't know them
    pub unknown_metrics: usize,

    /// Trim outcome
    pub trim: TrimStats,
}

impl RoundStats {
    /// Fold another round into this one
    pub fn absorb(&mut self, other: RoundStats) {
        self.rounds += other.rounds;
        self.metrics += other.metrics;
        self.measures += other.measures;
        self.splits_written += other.splits_written;
        self.unknown_metrics += other.unknown_metrics;
        self.trim.trimmed += other.trim.trimmed;
        self.trim.skipped += other.trim.skipped;
        self.trim.batches += other.trim.batches;
    }
}

/// Drains sacks into the aggregate store
pub struct Worker {
    incoming: Arc<IncomingBuffer>,
    store: Arc<AggregateStore>,
    catalog: Arc<dyn MetricCatalog>,
    aggregator: Arc<dyn Aggregator>,
    version: u32,
}

impl Worker {
    pub fn new(
        incoming: Arc<IncomingBuffer>,
        store: Arc<AggregateStore>,
        catalog: Arc<dyn MetricCatalog>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        let version = store.default_version();
        Self {
            incoming,
            store,
            catalog,
            aggregator,
            version,
        }
    }

    /// Write splits under a specific format version
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    // =========================================================================
    // Rounds
    // =========================================================================

    /// Run one full round on `sack`.
    ///
    /// If aggregation or a split write fails, nothing is trimmed and the
    /// marker stays, so the measures are seen again next round.
    pub fn process_sack(&self, sack: &Sack) -> Result<RoundStats> {
        let processing = self.incoming.process_sack(sack)?;
        let mut stats = self.aggregate_all(processing.measures())?;
        stats.trim = processing.commit()?;
        stats.rounds = 1;
        self.incoming.finish_sack_processing(sack)?;

        if stats.trim.skipped > 0 {
            tracing::warn!(
                "{}: {} queues changed after the snapshot and were left untrimmed",
                sack,
                stats.trim.skipped
            );
        }

        if stats.metrics > 0 || stats.unknown_metrics > 0 {
            tracing::debug!(
                "Processed {}: {} metrics, {} measures, {} splits",
                sack,
                stats.metrics,
                stats.measures,
                stats.splits_written
            );
        }
        Ok(stats)
    }

    /// Process every sack that currently has pending measures.
    ///
    /// The fallback for wake-ups lost across reconnects or coalesced away.
    pub fn sweep(&self) -> Result<RoundStats> {
        let mut total = RoundStats::default();
        for sack in self.incoming.sacks_with_pending()? {
            total.absorb(self.drain(&sack)?);
        }
        Ok(total)
    }

    /// Block on sack notifications until `shutdown` is set, sweeping every
    /// `sweep_interval` as well.
    ///
    /// A failed round is logged and only holds back its own sack: the
    /// measures stay queued for the next wake-up or sweep. Only losing the
    /// notification stream for good stops the loop.
    pub fn run(&self, shutdown: &AtomicBool, sweep_interval: Duration) -> Result<()> {
        let mut stream = self.incoming.iter_sacks_to_process()?;
        tracing::info!("Worker started");

        // Anything appended before we subscribed produced no notification for us
        let mut next_sweep = Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= next_sweep {
                self.sweep_isolated();
                next_sweep = now + sweep_interval;
                continue;
            }

            // Wake up at least every 100ms to notice shutdown
            let wait = (next_sweep - now).min(Duration::from_millis(100));
            match stream.next_timeout(wait) {
                Ok(Some(sack)) => self.log_round_failure(&sack, self.drain(&sack)),
                Ok(None) => {}
                Err(SackError::SubscriptionClosed) => {
                    tracing::warn!("Sack notifications lost, resubscribing");
                    stream = self.incoming.iter_sacks_to_process()?;
                    next_sweep = Instant::now();
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!("Worker stopped");
        Ok(())
    }

    // =========================================================================
    // Metric Lifecycle
    // =========================================================================

    /// Remove every trace of `metric`: pending measures and aggregates
    pub fn delete_metric(&self, metric: &MetricId) -> Result<()> {
        self.incoming.delete_queue(metric)?;
        self.store.delete_metric(metric)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Run rounds on a woken sack while it still has pending measures.
    ///
    /// The wake-up alone proves nothing: the sack may already be empty, or
    /// more may have arrived while we worked.
    fn drain(&self, sack: &Sack) -> Result<RoundStats> {
        let mut total = RoundStats::default();
        for _ in 0..MAX_ROUNDS_PER_WAKEUP {
            total.absorb(self.process_sack(sack)?);
            if !self.incoming.sack_has_pending(sack)? {
                break;
            }
        }
        Ok(total)
    }

    fn aggregate_all(&self, measures: &HashMap<MetricId, Vec<Measure>>) -> Result<RoundStats> {
        let mut stats = RoundStats::default();

        let mut metrics = Vec::with_capacity(measures.len());
        for id in measures.keys() {
            match self.catalog.get(id) {
                Some(metric) => metrics.push(metric),
                None => {
                    tracing::warn!("Dropping measures of unknown metric {}", id);
                    stats.unknown_metrics += 1;
                }
            }
        }
        if metrics.is_empty() {
            return Ok(stats);
        }

        // Namespaces exist from the first processed batch on
        let ids: Vec<MetricId> = metrics.iter().map(|m| m.id).collect();
        self.store.get_or_create_unaggregated(&ids, self.version)?;

        for metric in &metrics {
            let new_measures = &measures[&metric.id];
            let writes =
                self.aggregator
                    .aggregate(metric, new_measures, &self.store, self.version)?;
            for (aggregation, splits) in &writes {
                self.store
                    .store_splits(&metric.id, aggregation, splits, self.version)?;
                stats.splits_written += splits.len();
            }
            stats.metrics += 1;
            stats.measures += new_measures.len();
        }
        Ok(stats)
    }

    /// Sweep that keeps going past sacks whose round fails
    fn sweep_isolated(&self) {
        let sacks = match self.incoming.sacks_with_pending() {
            Ok(sacks) => sacks,
            Err(e) => {
                tracing::warn!("Sweep could not list pending sacks: {}", e);
                return;
            }
        };
        for sack in sacks {
            let result = self.drain(&sack);
            self.log_round_failure(&sack, result);
        }
    }

    fn log_round_failure(&self, sack: &Sack, result: Result<RoundStats>) {
        match result {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!("Transient failure on {}, will retry: {}", sack, e);
            }
            Err(e) => {
                tracing::error!("Round on {} failed, measures stay queued: {}", sack, e);
            }
        }
    }
}
