//! Storage Module
//!
//! Split-key aggregate store: one hash per metric, one field per
//! aggregate block.
//!
//! ## Layout
//! ```text
//! timeseries<sep><metric id>            (hash, absent ⇔ metric unknown)
//!   ├── none_v3                         unaggregated buffer
//!   ├── 1420070400.0_mean_300.0_v3      split block
//!   ├── 1421150400.0_mean_300.0_v3      split block
//!   └── 1420070400.0_max_60.0_v3        split block
//! ```
//!
//! ## Responsibilities
//! - Batched writes and deletes of split blocks (one round trip each)
//! - Existence-aware batch reads: whole-metric absence is an error,
//!   absent fields are `None`
//! - Exhaustive enumeration of split keys per aggregation

mod field;
mod scripts;

pub use field::{
    format_seconds, parse_seconds, parse_split_field, split_field, split_pattern,
    unaggregated_field,
};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;

use crate::backend::{Backend, Command, Reply};
use crate::config::Config;
use crate::error::{Result, SackError};
use crate::metric::{Aggregation, MetricId, SplitKey};

use scripts::{GetMeasuresScript, ListSplitKeysScript, METRIC_MISSING};

/// One block to write
#[derive(Debug, Clone, PartialEq)]
pub struct SplitWrite {
    pub key: SplitKey,
    pub data: Bytes,

    /// Codec metadata, passed through untouched
    pub offset: Option<u64>,
}

impl SplitWrite {
    pub fn new(key: SplitKey, data: Bytes) -> Self {
        Self {
            key,
            data,
            offset: None,
        }
    }
}

/// Per-metric store of aggregate blocks
pub struct AggregateStore {
    backend: Arc<dyn Backend>,
    config: Config,
}

impl AggregateStore {
    pub fn new(backend: Arc<dyn Backend>, config: Config) -> Self {
        Self { backend, config }
    }

    /// Format version used when callers have no opinion
    pub fn default_version(&self) -> u32 {
        self.config.format_version
    }

    // =========================================================================
    // Unaggregated Buffers
    // =========================================================================

    /// Upsert the unaggregated buffer of many metrics in one round trip
    pub fn store_unaggregated(&self, items: &[(MetricId, Bytes)], version: u32) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let field = unaggregated_field(version).into_bytes();
        let commands = items
            .iter()
            .map(|(metric, data)| Command::HSet {
                key: self.metric_key(metric),
                field: field.clone(),
                value: data.to_vec(),
            })
            .collect();
        self.backend.pipeline(commands)?;
        Ok(())
    }

    /// Create each metric's unaggregated field if missing, then read it.
    ///
    /// An empty buffer reads back as `None`. Creating the field also creates
    /// the metric namespace.
    pub fn get_or_create_unaggregated(
        &self,
        metrics: &[MetricId],
        version: u32,
    ) -> Result<HashMap<MetricId, Option<Bytes>>> {
        if metrics.is_empty() {
            return Ok(HashMap::new());
        }
        let field = unaggregated_field(version).into_bytes();
        let mut commands = Vec::with_capacity(metrics.len() * 2);
        for metric in metrics {
            let key = self.metric_key(metric);
            commands.push(Command::HSetNx {
                key: key.clone(),
                field: field.clone(),
                value: Vec::new(),
            });
            commands.push(Command::HGet {
                key,
                field: field.clone(),
            });
        }

        let replies = self.backend.pipeline(commands)?;
        if replies.len() != metrics.len() * 2 {
            return Err(SackError::ProtocolViolation(format!(
                "expected {} replies, got {}",
                metrics.len() * 2,
                replies.len()
            )));
        }

        let mut out = HashMap::with_capacity(metrics.len());
        for (metric, pair) in metrics.iter().zip(replies.chunks(2)) {
            let data = pair[1].clone().into_optional_bulk()?.filter(|b| !b.is_empty());
            out.insert(*metric, data);
        }
        Ok(out)
    }

    // =========================================================================
    // Splits
    // =========================================================================

    /// Every stored split key of each aggregation.
    ///
    /// Fails with `MetricDoesNotExist` when the metric has no namespace at
    /// all; an aggregation without data maps to an empty set.
    pub fn list_split_keys(
        &self,
        metric: &MetricId,
        aggregations: &[Aggregation],
        version: u32,
    ) -> Result<HashMap<Aggregation, BTreeSet<SplitKey>>> {
        let mut args = vec![self.config.scan_count.max(1).to_string().into_bytes()];
        args.extend(aggregations.iter().map(|a| split_pattern(a, version)));

        let reply = self
            .backend
            .eval(&ListSplitKeysScript, &[self.metric_key(metric)], &args)?;
        if reply.is_nil() {
            return Err(SackError::MetricDoesNotExist(*metric));
        }

        let per_aggregation = reply.into_array()?;
        if per_aggregation.len() != aggregations.len() {
            return Err(SackError::ProtocolViolation(format!(
                "list_split_keys answered {} aggregations, expected {}",
                per_aggregation.len(),
                aggregations.len()
            )));
        }

        let mut out = HashMap::with_capacity(aggregations.len());
        for (aggregation, fields) in aggregations.iter().zip(per_aggregation) {
            let mut keys = BTreeSet::new();
            for field in fields.into_array()? {
                let field = field.into_bulk()?;
                let field = std::str::from_utf8(&field).map_err(|_| {
                    SackError::ProtocolViolation("split field is not UTF-8".to_string())
                })?;
                let (key, method) = parse_split_field(field)?;
                if method == aggregation.method() && key.granularity() == aggregation.granularity() {
                    keys.insert(key);
                }
            }
            out.insert(aggregation.clone(), keys);
        }
        Ok(out)
    }

    /// Upsert many blocks of one aggregation in one round trip
    pub fn store_splits(
        &self,
        metric: &MetricId,
        aggregation: &Aggregation,
        splits: &[SplitWrite],
        version: u32,
    ) -> Result<()> {
        if splits.is_empty() {
            return Ok(());
        }
        let key = self.metric_key(metric);
        let mut commands = Vec::with_capacity(splits.len());
        for split in splits {
            check_granularity(&split.key, aggregation)?;
            commands.push(Command::HSet {
                key: key.clone(),
                field: split_field(&split.key, aggregation.method(), version).into_bytes(),
                value: split.data.to_vec(),
            });
        }
        self.backend.pipeline(commands)?;
        tracing::trace!(
            "Stored {} splits of {} for metric {}",
            splits.len(),
            aggregation,
            metric
        );
        Ok(())
    }

    /// Remove blocks of one aggregation in one round trip
    pub fn delete_splits(
        &self,
        metric: &MetricId,
        keys: &[SplitKey],
        aggregation: &Aggregation,
        version: u32,
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let metric_key = self.metric_key(metric);
        let mut commands = Vec::with_capacity(keys.len());
        for key in keys {
            check_granularity(key, aggregation)?;
            commands.push(Command::HDel {
                key: metric_key.clone(),
                fields: vec![split_field(key, aggregation.method(), version).into_bytes()],
            });
        }
        self.backend.pipeline(commands)?;
        Ok(())
    }

    /// Remove the metric's whole namespace: every aggregation, every version
    pub fn delete_metric(&self, metric: &MetricId) -> Result<()> {
        self.backend.execute(Command::Del {
            keys: vec![self.metric_key(metric)],
        })?;
        tracing::debug!("Deleted aggregates of metric {}", metric);
        Ok(())
    }

    /// Whether the metric has a namespace
    pub fn metric_exists(&self, metric: &MetricId) -> Result<bool> {
        let exists = self
            .backend
            .execute(Command::Exists {
                key: self.metric_key(metric),
            })?
            .into_integer()?;
        Ok(exists > 0)
    }

    /// Fetch blocks in request order, `None` where the split is absent.
    ///
    /// Fails with `MetricDoesNotExist` when the metric has no namespace.
    pub fn get_measures(
        &self,
        metric: &MetricId,
        keys_and_aggregations: &[(SplitKey, Aggregation)],
        version: u32,
    ) -> Result<Vec<Option<Bytes>>> {
        if keys_and_aggregations.is_empty() {
            return Ok(Vec::new());
        }

        let mut fields = Vec::with_capacity(keys_and_aggregations.len());
        for (key, aggregation) in keys_and_aggregations {
            check_granularity(key, aggregation)?;
            fields.push(split_field(key, aggregation.method(), version).into_bytes());
        }

        let reply = self
            .backend
            .eval(&GetMeasuresScript, &[self.metric_key(metric)], &fields)?;
        let mut parts = reply.into_array()?.into_iter();
        let code = parts.next().map(Reply::into_integer).transpose()?;
        match code {
            Some(METRIC_MISSING) => Err(SackError::MetricDoesNotExist(*metric)),
            Some(0) => {
                let values = parts
                    .next()
                    .ok_or_else(|| {
                        SackError::ProtocolViolation("get_measures reply has no values".to_string())
                    })?
                    .into_array()?;
                if values.len() != fields.len() {
                    return Err(SackError::ProtocolViolation(format!(
                        "get_measures answered {} fields, expected {}",
                        values.len(),
                        fields.len()
                    )));
                }
                values.into_iter().map(Reply::into_optional_bulk).collect()
            }
            other => Err(SackError::ProtocolViolation(format!(
                "unexpected get_measures code {:?}",
                other
            ))),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn metric_key(&self, metric: &MetricId) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.config.storage_prefix, self.config.key_separator, metric
        )
        .into_bytes()
    }
}

fn check_granularity(key: &SplitKey, aggregation: &Aggregation) -> Result<()> {
    if key.granularity() != aggregation.granularity() {
        return Err(SackError::ProtocolViolation(format!(
            "split granularity {:?} does not match aggregation {}",
            key.granularity(),
            aggregation
        )));
    }
    Ok(())
}
