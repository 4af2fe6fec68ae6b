//! Incoming Module
//!
//! Buffers raw measures per metric until a worker aggregates them.
//!
//! ## Key Layout
//! ```text
//! incoming<N>-<i>                 sack marker (presence only, wakes workers)
//! incoming<N>-<i><sep><metric>    list of encoded measure batches, FIFO
//! ```
//!
//! ## Responsibilities
//! - Route metrics to sacks and append measure batches in one round trip
//! - Arm the sack marker on append so an idle worker gets notified
//! - Enumerate pending metrics per sack and report backlog
//! - Snapshot and trim sacks for workers (see `process`)
//! - Stream sack wake-ups to workers (see `notifier`)

mod codec;
mod notifier;
mod process;
mod sack;

pub use codec::{decode_measures, encode_measures, Measure, MEASURE_SIZE};
pub use notifier::SackStream;
pub use process::{SackProcessing, TrimStats};
pub use sack::{Sack, SackRouter, SACK_PREFIX};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::backend::{escape, scan_all, Backend, Command, Reply};
use crate::config::Config;
use crate::error::{Result, SackError};
use crate::metric::MetricId;

/// Backlog summary across all sacks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    /// Metrics with a non-empty queue
    pub metrics: usize,

    /// Pending measures, counted in queued batches as they were appended
    pub measures: u64,

    /// Per-metric queued batches, when requested
    pub details: Option<HashMap<MetricId, u64>>,
}

/// Sack-partitioned buffer of unprocessed measures
pub struct IncomingBuffer {
    backend: Arc<dyn Backend>,
    config: Config,
    router: SackRouter,
}

impl IncomingBuffer {
    // =========================================================================
    // Storage Settings
    // =========================================================================

    /// Overwrite the cluster-wide sack count.
    ///
    /// Only safe while every queue is empty: changing the count reroutes
    /// metrics and orphans whatever is still pending.
    pub fn set_storage_settings(backend: &dyn Backend, config: &Config, sacks: u32) -> Result<()> {
        SackRouter::new(sacks)?;
        backend.execute(Command::HSet {
            key: config.config_key.as_bytes().to_vec(),
            field: config.sacks_field.as_bytes().to_vec(),
            value: sacks.to_string().into_bytes(),
        })?;
        tracing::info!("Sack count set to {}", sacks);
        Ok(())
    }

    /// Store `config.default_sack_count` unless a count exists, and return
    /// the count in effect
    pub fn ensure_storage_settings(backend: &dyn Backend, config: &Config) -> Result<u32> {
        SackRouter::new(config.default_sack_count)?;
        let created = backend
            .execute(Command::HSetNx {
                key: config.config_key.as_bytes().to_vec(),
                field: config.sacks_field.as_bytes().to_vec(),
                value: config.default_sack_count.to_string().into_bytes(),
            })?
            .into_integer()?;
        if created == 1 {
            tracing::info!("Initialized sack count to {}", config.default_sack_count);
        }
        Self::stored_sack_count(backend, config)?
            .ok_or_else(|| SackError::Config("sack count vanished after initialization".to_string()))
    }

    /// Sack count stored in the backend, if any
    pub fn stored_sack_count(backend: &dyn Backend, config: &Config) -> Result<Option<u32>> {
        let raw = backend
            .execute(Command::HGet {
                key: config.config_key.as_bytes().to_vec(),
                field: config.sacks_field.as_bytes().to_vec(),
            })?
            .into_optional_bulk()?;
        raw.map(|b| {
            std::str::from_utf8(&b)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .ok_or_else(|| {
                    SackError::Config(format!(
                        "stored sack count is not a number: {:?}",
                        String::from_utf8_lossy(&b)
                    ))
                })
        })
        .transpose()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the buffer using the sack count stored in the backend
    pub fn open(backend: Arc<dyn Backend>, config: Config) -> Result<Self> {
        let sacks = Self::stored_sack_count(backend.as_ref(), &config)?.ok_or_else(|| {
            SackError::Config(format!(
                "no sack count stored under {}/{}",
                config.config_key, config.sacks_field
            ))
        })?;
        let router = SackRouter::new(sacks)?;
        tracing::debug!("Incoming buffer opened with {} sacks", sacks);
        Ok(Self {
            backend,
            config,
            router,
        })
    }

    // =========================================================================
    // Producer API
    // =========================================================================

    /// Append encoded measure batches for many metrics in one round trip.
    ///
    /// Each sack touched gets its marker armed once (in greedy mode).
    /// Empty batches are skipped.
    pub fn add_measures_batch<I>(&self, batch: I) -> Result<()>
    where
        I: IntoIterator<Item = (MetricId, Bytes)>,
    {
        let mut notified = HashSet::new();
        let mut commands = Vec::new();

        for (metric, measures) in batch {
            if measures.is_empty() {
                continue;
            }
            let sack = self.router.sack_for(&metric);
            commands.push(Command::RPush {
                key: self.queue_key(&sack, &metric),
                values: vec![measures.to_vec()],
            });
            // Value is meaningless, only creation of the key is observed
            if self.config.greedy && notified.insert(sack) {
                commands.push(Command::SetNx {
                    key: sack.name().into_bytes(),
                    value: b"1".to_vec(),
                });
            }
        }

        if commands.is_empty() {
            return Ok(());
        }
        self.backend.pipeline(commands)?;
        tracing::trace!("Appended measures touching {} sacks", notified.len());
        Ok(())
    }

    /// Encode and append measures for one metric
    pub fn add_measures(&self, metric: MetricId, measures: &[Measure]) -> Result<()> {
        self.add_measures_batch(std::iter::once((metric, encode_measures(measures))))
    }

    // =========================================================================
    // Queue Inspection
    // =========================================================================

    /// Whether `metric` has unprocessed measures
    pub fn has_pending(&self, metric: &MetricId) -> Result<bool> {
        let sack = self.router.sack_for(metric);
        let exists = self
            .backend
            .execute(Command::Exists {
                key: self.queue_key(&sack, metric),
            })?
            .into_integer()?;
        Ok(exists > 0)
    }

    /// Drop every unprocessed measure of `metric`
    pub fn delete_queue(&self, metric: &MetricId) -> Result<()> {
        let sack = self.router.sack_for(metric);
        self.backend.execute(Command::Del {
            keys: vec![self.queue_key(&sack, metric)],
        })?;
        tracing::debug!("Deleted incoming queue of metric {}", metric);
        Ok(())
    }

    /// Metrics with pending measures in `sack`.
    ///
    /// Best-effort: metrics appended or drained while scanning may be missed
    /// or included.
    pub fn list_metrics_in_sack(&self, sack: &Sack) -> Result<HashSet<MetricId>> {
        self.check_sack(sack)?;
        let keys = scan_all(
            self.backend.as_ref(),
            &self.sack_pattern(sack),
            self.config.scan_count,
        )?;
        let mut metrics = HashSet::with_capacity(keys.len());
        for key in keys {
            match self.metric_from_queue_key(&key) {
                Ok(metric) => {
                    metrics.insert(metric);
                }
                Err(e) => tracing::warn!("Ignoring unexpected key in {}: {}", sack, e),
            }
        }
        Ok(metrics)
    }

    /// Sacks holding at least one pending queue, found with a single scan
    /// of the whole incoming keyspace
    pub fn sacks_with_pending(&self) -> Result<BTreeSet<Sack>> {
        let keys = scan_all(self.backend.as_ref(), &self.all_queues_pattern(), self.config.scan_count)?;
        let mut sacks = BTreeSet::new();
        for key in keys {
            match self.metric_from_queue_key(&key) {
                Ok(metric) => {
                    sacks.insert(self.router.sack_for(&metric));
                }
                Err(e) => tracing::warn!("Unexpected key in incoming keyspace: {}", e),
            }
        }
        Ok(sacks)
    }

    /// Backlog across all sacks.
    ///
    /// Lengths are fetched in pipelines of `report_batch_size` so a large
    /// backlog never turns into one huge request.
    pub fn report(&self, details: bool) -> Result<Report> {
        let keys = scan_all(self.backend.as_ref(), &self.all_queues_pattern(), self.config.scan_count)?;
        let mut report = Report {
            details: details.then(HashMap::new),
            ..Report::default()
        };

        for chunk in keys.chunks(self.config.report_batch_size.max(1)) {
            let replies = self.backend.pipeline(
                chunk
                    .iter()
                    .map(|key| Command::LLen { key: key.clone() })
                    .collect(),
            )?;
            if replies.len() != chunk.len() {
                return Err(SackError::ProtocolViolation(format!(
                    "expected {} LLEN replies, got {}",
                    chunk.len(),
                    replies.len()
                )));
            }
            for (key, reply) in chunk.iter().zip(replies) {
                let len = reply.into_integer()?.max(0) as u64;
                if len == 0 {
                    continue;
                }
                report.metrics += 1;
                report.measures += len;
                if let Some(details) = report.details.as_mut() {
                    match self.metric_from_queue_key(key) {
                        Ok(metric) => {
                            details.insert(metric, len);
                        }
                        Err(e) => tracing::warn!("Unexpected key in report scan: {}", e),
                    }
                }
            }
        }

        tracing::debug!(
            "Report: {} metrics, {} pending batches",
            report.metrics,
            report.measures
        );
        Ok(report)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The sack owning `metric`
    pub fn sack_for(&self, metric: &MetricId) -> Sack {
        self.router.sack_for(metric)
    }

    pub fn router(&self) -> &SackRouter {
        &self.router
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// "incoming128-17" + sep + metric id
    fn queue_key(&self, sack: &Sack, metric: &MetricId) -> Vec<u8> {
        format!("{}{}{}", sack.name(), self.config.key_separator, metric).into_bytes()
    }

    /// Glob over every queue of `sack`
    fn sack_pattern(&self, sack: &Sack) -> Vec<u8> {
        let mut pattern = escape(format!("{}{}", sack.name(), self.config.key_separator).as_bytes());
        pattern.push(b'*');
        pattern
    }

    /// Glob over every queue of every sack
    fn all_queues_pattern(&self) -> Vec<u8> {
        let mut pattern = escape(format!("{}{}-", SACK_PREFIX, self.router.sack_count()).as_bytes());
        pattern.push(b'*');
        pattern.extend_from_slice(&escape(self.config.key_separator.as_bytes()));
        pattern.push(b'*');
        pattern
    }

    fn metric_from_queue_key(&self, key: &[u8]) -> Result<MetricId> {
        let key = std::str::from_utf8(key)
            .map_err(|_| SackError::ProtocolViolation("queue key is not UTF-8".to_string()))?;
        let (_, metric) = key.split_once(self.config.key_separator.as_str()).ok_or_else(|| {
            SackError::ProtocolViolation(format!("queue key '{}' has no separator", key))
        })?;
        metric.parse()
    }

    fn check_sack(&self, sack: &Sack) -> Result<()> {
        if !self.router.owns(sack) {
            return Err(SackError::Config(format!(
                "{} does not belong to a {}-sack layout",
                sack,
                self.router.sack_count()
            )));
        }
        Ok(())
    }
}

/// Reply helper shared by the snapshot and trim scripts
fn integer_or_violation(reply: Reply, what: &str) -> Result<i64> {
    reply
        .into_integer()
        .map_err(|e| SackError::ProtocolViolation(format!("{}: {}", what, e)))
}
