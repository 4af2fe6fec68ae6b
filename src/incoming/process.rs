//! Sack processing
//!
//! Drains a sack with snapshot-count-then-bounded-trim:
//!
//! ```text
//!  snapshot (one atomic script)         caller work            trim (one atomic script)
//! ┌──────────────────────────────┐   ┌──────────────────┐   ┌──────────────────────────────┐
//! │ for each queue in the sack:  │   │ decode, aggregate │   │ for each snapshotted queue:  │
//! │   L    = LLEN                │──►│ store splits      │──►│   if first L items unchanged │
//! │   data = LRANGE 0 L-1        │   │ (no lock held)    │   │     LTRIM L -1               │
//! └──────────────────────────────┘   └──────────────────┘   └──────────────────────────────┘
//! ```
//!
//! Measures appended after the snapshot sit beyond index L and survive
//! the trim. If the caller's work fails the trim never runs and the next
//! round sees the same measures again.
//!
//! The trim also checks that the first L items still hash to the
//! snapshotted checksum. When another worker drained the same prefix in
//! the meantime, or the queue was deleted, the trim for that queue is
//! skipped instead of eating measures that arrived later.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::backend::{Command, Reply, Script, ScriptContext};
use crate::error::{Result, SackError};
use crate::metric::MetricId;

use super::{decode_measures, integer_or_violation, IncomingBuffer, Measure, Sack};

// =============================================================================
// Scripts
// =============================================================================

/// KEYS[1] = glob over the sack's queues.
/// Replies [[queue key, L, concatenated items], ...]
struct SnapshotScript;

impl Script for SnapshotScript {
    fn name(&self) -> &'static str {
        "process_measure_for_sack"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[Vec<u8>], _args: &[Vec<u8>]) -> Result<Reply> {
        let pattern = keys.first().ok_or_else(|| {
            SackError::ProtocolViolation("snapshot script needs the sack pattern".to_string())
        })?;

        let queues = ctx
            .call(Command::Keys {
                pattern: pattern.clone(),
            })?
            .into_array()?;

        let mut snapshot = Vec::with_capacity(queues.len());
        for queue in queues {
            let key = queue.into_bulk()?;
            let len = ctx.call(Command::LLen { key: key.to_vec() })?.into_integer()?;
            let data = if len > 0 {
                let items = ctx
                    .call(Command::LRange {
                        key: key.to_vec(),
                        start: 0,
                        stop: len - 1,
                    })?
                    .into_array()?;
                let mut buf = BytesMut::new();
                for item in items {
                    buf.extend_from_slice(&item.into_bulk()?);
                }
                buf.freeze()
            } else {
                Bytes::new()
            };
            snapshot.push(Reply::Array(vec![
                Reply::Bulk(key),
                Reply::Integer(len),
                Reply::Bulk(data),
            ]));
        }
        Ok(Reply::Array(snapshot))
    }
}

/// KEYS = queues, ARGV = (L, crc32 of the first L items) per queue.
/// Replies one integer per queue: 1 trimmed, 0 skipped.
struct TrimScript;

impl Script for TrimScript {
    fn name(&self) -> &'static str {
        "trim_processed_measures"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[Vec<u8>], args: &[Vec<u8>]) -> Result<Reply> {
        if args.len() != keys.len() * 2 {
            return Err(SackError::ProtocolViolation(format!(
                "trim script got {} args for {} keys",
                args.len(),
                keys.len()
            )));
        }

        let mut results = Vec::with_capacity(keys.len());
        for (key, pair) in keys.iter().zip(args.chunks(2)) {
            let count: i64 = parse_arg(&pair[0])?;
            let checksum: u32 = parse_arg(&pair[1])?;

            let len = ctx.call(Command::LLen { key: key.clone() })?.into_integer()?;
            if count <= 0 || len < count {
                results.push(Reply::Integer(0));
                continue;
            }

            let items = ctx
                .call(Command::LRange {
                    key: key.clone(),
                    start: 0,
                    stop: count - 1,
                })?
                .into_array()?;
            let mut hasher = crc32fast::Hasher::new();
            for item in items {
                hasher.update(&item.into_bulk()?);
            }
            if hasher.finalize() != checksum {
                results.push(Reply::Integer(0));
                continue;
            }

            ctx.call(Command::LTrim {
                key: key.clone(),
                start: count,
                stop: -1,
            })?
            .expect_ok()?;
            results.push(Reply::Integer(1));
        }
        Ok(Reply::Array(results))
    }
}

fn parse_arg<T: std::str::FromStr>(raw: &[u8]) -> Result<T> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            SackError::ProtocolViolation(format!(
                "malformed script argument {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

// =============================================================================
// Scoped Processing
// =============================================================================

/// What the snapshot captured for one queue
#[derive(Debug, Clone)]
struct SnapshotEntry {
    key: Vec<u8>,
    count: u64,
    checksum: u32,
}

/// Outcome of a trim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimStats {
    /// Queues whose snapshotted prefix was removed
    pub trimmed: usize,

    /// Queues left alone because their prefix was already gone
    pub skipped: usize,

    /// Batches removed in total
    pub batches: u64,
}

/// A consistent view of a sack's pending measures.
///
/// Call [`commit`](SackProcessing::commit) once the measures are safely
/// aggregated; dropping the view without committing leaves every queue
/// untouched for the next round.
pub struct SackProcessing<'a> {
    buffer: &'a IncomingBuffer,
    sack: Sack,
    entries: Vec<SnapshotEntry>,
    measures: HashMap<MetricId, Vec<Measure>>,
    committed: bool,
}

impl<'a> SackProcessing<'a> {
    pub fn sack(&self) -> Sack {
        self.sack
    }

    /// Decoded measures per metric, in arrival order
    pub fn measures(&self) -> &HashMap<MetricId, Vec<Measure>> {
        &self.measures
    }

    /// Whether the snapshot found nothing to process
    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }

    /// Number of metrics captured
    pub fn metric_count(&self) -> usize {
        self.measures.len()
    }

    /// Remove exactly the snapshotted prefix of every captured queue
    pub fn commit(mut self) -> Result<TrimStats> {
        let stats = self.trim()?;
        self.committed = true;
        Ok(stats)
    }

    fn trim(&self) -> Result<TrimStats> {
        if self.entries.is_empty() {
            return Ok(TrimStats::default());
        }

        let keys: Vec<Vec<u8>> = self.entries.iter().map(|e| e.key.clone()).collect();
        let args: Vec<Vec<u8>> = self
            .entries
            .iter()
            .flat_map(|e| {
                [
                    e.count.to_string().into_bytes(),
                    e.checksum.to_string().into_bytes(),
                ]
            })
            .collect();

        let replies = self
            .buffer
            .backend
            .eval(&TrimScript, &keys, &args)?
            .into_array()?;
        if replies.len() != self.entries.len() {
            return Err(SackError::ProtocolViolation(format!(
                "trim of {} answered for {} queues, expected {}",
                self.sack,
                replies.len(),
                self.entries.len()
            )));
        }

        let mut stats = TrimStats::default();
        for (entry, reply) in self.entries.iter().zip(replies) {
            match integer_or_violation(reply, "trim reply")? {
                1 => {
                    stats.trimmed += 1;
                    stats.batches += entry.count;
                }
                0 => {
                    stats.skipped += 1;
                    tracing::warn!(
                        "Prefix of {} changed since snapshot, leaving it in place",
                        String::from_utf8_lossy(&entry.key)
                    );
                }
                other => {
                    return Err(SackError::ProtocolViolation(format!(
                        "unexpected trim result {} for {}",
                        other,
                        String::from_utf8_lossy(&entry.key)
                    )))
                }
            }
        }

        tracing::debug!(
            "Trimmed {}: {} queues, {} batches, {} skipped",
            self.sack,
            stats.trimmed,
            stats.batches,
            stats.skipped
        );
        Ok(stats)
    }
}

impl Drop for SackProcessing<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.entries.is_empty() {
            tracing::debug!(
                "Released {} without commit, {} queues kept for retry",
                self.sack,
                self.entries.len()
            );
        }
    }
}

impl IncomingBuffer {
    /// Snapshot every pending queue of `sack` in one atomic step
    pub fn process_sack(&self, sack: &Sack) -> Result<SackProcessing<'_>> {
        self.check_sack(sack)?;

        let reply = self
            .backend
            .eval(&SnapshotScript, &[self.sack_pattern(sack)], &[])?;

        let mut entries = Vec::new();
        let mut measures = HashMap::new();
        for item in reply.into_array()? {
            let mut parts = item.into_array()?.into_iter();
            let (key, count, data) = match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(count), Some(data)) => {
                    (key.into_bulk()?, count.into_integer()?, data.into_bulk()?)
                }
                _ => {
                    return Err(SackError::ProtocolViolation(format!(
                        "malformed snapshot entry for {}",
                        sack
                    )))
                }
            };

            let metric = match self.metric_from_queue_key(&key) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Skipping foreign key in {}: {}", sack, e);
                    continue;
                }
            };

            if count <= 0 {
                // Emptied between listing and reading; nothing to trim either
                tracing::debug!("Queue of {} was empty at snapshot time", metric);
                continue;
            }
            if data.is_empty() {
                return Err(SackError::ProtocolViolation(format!(
                    "snapshot of {} reports {} batches but no data",
                    metric, count
                )));
            }

            measures.insert(metric, decode_measures(&data)?);
            entries.push(SnapshotEntry {
                key: key.to_vec(),
                count: count as u64,
                checksum: crc32fast::hash(&data),
            });
        }

        tracing::debug!("Snapshot of {}: {} metrics", sack, entries.len());
        Ok(SackProcessing {
            buffer: self,
            sack: *sack,
            entries,
            measures,
            committed: false,
        })
    }

    /// Snapshot `sack`, hand the measures to `work`, and trim only if it
    /// succeeds. Errors from `work` come back unchanged.
    pub fn process_sack_with<T, E, F>(&self, sack: &Sack, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&HashMap<MetricId, Vec<Measure>>) -> std::result::Result<T, E>,
        E: From<SackError>,
    {
        let processing = self.process_sack(sack)?;
        let output = work(processing.measures())?;
        processing.commit()?;
        Ok(output)
    }
}
