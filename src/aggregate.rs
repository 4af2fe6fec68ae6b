//! Aggregation seam
//!
//! Workers hand raw measures to an [`Aggregator`] and write whatever
//! blocks it returns. The real compaction math lives outside this crate;
//! [`ReferenceAggregator`] is a small transform good enough to drive the
//! pipeline end to end.
//!
//! ## Contract
//! A sack round can be replayed (worker crash between aggregation and
//! trim, failed trim). Aggregators must therefore be idempotent: feeding
//! the same measures twice has to produce the same blocks as feeding them
//! once. Blocks overwrite, they never accumulate.

use std::collections::{BTreeMap, HashMap};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SackError};
use crate::incoming::Measure;
use crate::metric::{align_down, duration_nanos, Aggregation, Metric, SplitKey};
use crate::storage::{AggregateStore, SplitWrite};

/// Turns raw measures into split blocks
pub trait Aggregator: Send + Sync {
    /// Blocks to write per aggregation of `metric`, given its new measures
    /// in arrival order. May read current blocks from `store`.
    fn aggregate(
        &self,
        metric: &Metric,
        measures: &[Measure],
        store: &AggregateStore,
        version: u32,
    ) -> Result<HashMap<Aggregation, Vec<SplitWrite>>>;
}

// =============================================================================
// Block Codec
// =============================================================================

/// Size of the trailing checksum
const CRC_SIZE: usize = 4;

/// Points of one split window, sorted by timestamp
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateBlock {
    pub points: Vec<(i64, f64)>,
}

impl AggregateBlock {
    /// bincode payload followed by its CRC32 (little endian)
    pub fn encode(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(payload.len() + CRC_SIZE);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CRC_SIZE {
            return Err(SackError::Serialization(format!(
                "aggregate block of {} bytes is too short",
                data.len()
            )));
        }
        let (payload, crc) = data.split_at(data.len() - CRC_SIZE);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(SackError::Serialization(format!(
                "aggregate block checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }
        Ok(bincode::deserialize(payload)?)
    }
}

// =============================================================================
// Reference Aggregator
// =============================================================================

/// Per-bucket reducers that stay idempotent under replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reducer {
    First,
    Last,
    Min,
    Max,
}

impl Reducer {
    fn parse(method: &str) -> Result<Self> {
        match method {
            "first" => Ok(Reducer::First),
            "last" => Ok(Reducer::Last),
            "min" => Ok(Reducer::Min),
            "max" => Ok(Reducer::Max),
            other => Err(SackError::Config(format!(
                "unsupported aggregation method '{}'",
                other
            ))),
        }
    }

    /// Fold `value` into a bucket that may already hold one
    fn fold(self, current: Option<f64>, value: f64) -> f64 {
        match (self, current) {
            (_, None) => value,
            (Reducer::First, Some(c)) => c,
            (Reducer::Last, Some(_)) => value,
            (Reducer::Min, Some(c)) => c.min(value),
            (Reducer::Max, Some(c)) => c.max(value),
        }
    }
}

/// Buckets measures per granularity and keeps one value per bucket
/// (`first`, `last`, `min` or `max`), merged into the stored block
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceAggregator;

impl Aggregator for ReferenceAggregator {
    fn aggregate(
        &self,
        metric: &Metric,
        measures: &[Measure],
        store: &AggregateStore,
        version: u32,
    ) -> Result<HashMap<Aggregation, Vec<SplitWrite>>> {
        let mut out = HashMap::with_capacity(metric.aggregations.len());
        if measures.is_empty() {
            return Ok(out);
        }

        for aggregation in &metric.aggregations {
            let reducer = Reducer::parse(aggregation.method())?;
            let granularity = duration_nanos(aggregation.granularity());

            // Fold the new measures per split and bucket, in arrival order
            let mut fresh: BTreeMap<SplitKey, BTreeMap<i64, f64>> = BTreeMap::new();
            for m in measures {
                let bucket = align_down(m.timestamp, granularity)?;
                let points = fresh.entry(aggregation.split_key_for(bucket)?).or_default();
                let folded = reducer.fold(points.get(&bucket).copied(), m.value);
                points.insert(bucket, folded);
            }

            let lookups: Vec<(SplitKey, Aggregation)> =
                fresh.keys().map(|k| (*k, aggregation.clone())).collect();
            let existing = match store.get_measures(&metric.id, &lookups, version) {
                Ok(blocks) => blocks,
                Err(SackError::MetricDoesNotExist(_)) => vec![None; lookups.len()],
                Err(e) => return Err(e),
            };

            let mut writes = Vec::with_capacity(fresh.len());
            for ((key, points), stored) in fresh.into_iter().zip(existing) {
                let mut merged: BTreeMap<i64, f64> = match stored {
                    Some(data) => AggregateBlock::decode(&data)?.points.into_iter().collect(),
                    None => BTreeMap::new(),
                };
                for (bucket, value) in points {
                    let folded = reducer.fold(merged.get(&bucket).copied(), value);
                    merged.insert(bucket, folded);
                }
                let block = AggregateBlock {
                    points: merged.into_iter().collect(),
                };
                writes.push(SplitWrite::new(key, block.encode()?));
            }
            out.insert(aggregation.clone(), writes);
        }

        Ok(out)
    }
}
