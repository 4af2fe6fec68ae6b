//! Metric data model
//!
//! Identifiers and aggregation definitions the core reads from the metric
//! catalog, plus the split key that addresses one window of aggregate
//! history.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Result, SackError};

/// Points per split window: a split covers `granularity * POINTS_PER_SPLIT`
pub const POINTS_PER_SPLIT: i64 = 3600;

/// Separator inside aggregate field names, so it can't appear in methods
pub const FIELD_SEP: char = '_';

// =============================================================================
// Metric Identity
// =============================================================================

/// Stable metric identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(Uuid);

impl MetricId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The identifier as one integer, which is what sack routing hashes
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for MetricId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for MetricId {
    type Err = SackError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SackError::Serialization(format!("invalid metric id '{}': {}", s, e)))
    }
}

impl From<Uuid> for MetricId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// =============================================================================
// Aggregation Definitions
// =============================================================================

/// One (method, granularity) pair a metric tracks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Aggregation {
    method: String,
    granularity: Duration,
}

impl Aggregation {
    /// Validate and build an aggregation definition
    pub fn new(method: impl Into<String>, granularity: Duration) -> Result<Self> {
        let method = method.into();
        if method.is_empty() || method.contains(FIELD_SEP) {
            return Err(SackError::Config(format!(
                "aggregation method '{}' must be non-empty and must not contain '{}'",
                method, FIELD_SEP
            )));
        }
        if granularity.is_zero() {
            return Err(SackError::Config(format!(
                "aggregation '{}' needs a non-zero granularity",
                method
            )));
        }
        Ok(Self {
            method,
            granularity,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Split key of the window holding `timestamp` (nanoseconds)
    pub fn split_key_for(&self, timestamp: i64) -> Result<SplitKey> {
        SplitKey::from_timestamp(timestamp, self.granularity)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}", self.method, self.granularity)
    }
}

/// A metric as the catalog hands it to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub id: MetricId,
    pub aggregations: Vec<Aggregation>,
}

impl Metric {
    pub fn new(id: MetricId, aggregations: Vec<Aggregation>) -> Self {
        Self { id, aggregations }
    }
}

// =============================================================================
// Split Keys
// =============================================================================

/// Start of one fixed-width window of aggregate history at one granularity.
///
/// Windows for a given granularity are aligned on multiples of their width,
/// so they never overlap and leave no gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SplitKey {
    /// Window start, nanoseconds since the epoch
    timestamp: i64,
    granularity: Duration,
}

impl SplitKey {
    /// Key of the window containing `timestamp`.
    ///
    /// Fails when the window would start before the representable range.
    pub fn from_timestamp(timestamp: i64, granularity: Duration) -> Result<Self> {
        Ok(Self {
            timestamp: align_down(timestamp, window_width(granularity))?,
            granularity,
        })
    }

    /// Build a key from an already aligned window start
    pub fn new(timestamp: i64, granularity: Duration) -> Result<Self> {
        let key = Self::from_timestamp(timestamp, granularity)?;
        if key.timestamp != timestamp {
            return Err(SackError::ProtocolViolation(format!(
                "split timestamp {} is not aligned on granularity {:?}",
                timestamp, granularity
            )));
        }
        Ok(key)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// The following window, `None` past the representable range
    pub fn next(&self) -> Option<Self> {
        let timestamp = self.timestamp.checked_add(window_width(self.granularity))?;
        Some(Self {
            timestamp,
            granularity: self.granularity,
        })
    }

    /// Whether `timestamp` falls inside this window
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp
            .checked_sub(self.timestamp)
            .map_or(false, |offset| (0..window_width(self.granularity)).contains(&offset))
    }
}

/// Largest multiple of `step` not above `timestamp`
pub fn align_down(timestamp: i64, step: i64) -> Result<i64> {
    timestamp
        .div_euclid(step)
        .checked_mul(step)
        .ok_or_else(|| {
            SackError::Serialization(format!(
                "timestamp {} has no {}ns-aligned start in range",
                timestamp, step
            ))
        })
}

/// Width of a split window in nanoseconds
pub fn window_width(granularity: Duration) -> i64 {
    duration_nanos(granularity).saturating_mul(POINTS_PER_SPLIT).max(1)
}

/// Duration as signed nanoseconds, saturating
pub fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

// =============================================================================
// Catalog
// =============================================================================

/// Source of metric definitions, owned by whoever manages metric lifecycle
pub trait MetricCatalog: Send + Sync {
    /// The metric, or `None` once it has been deleted
    fn get(&self, id: &MetricId) -> Option<Metric>;
}

/// Catalog held in memory
#[derive(Default)]
pub struct StaticCatalog {
    metrics: parking_lot::RwLock<std::collections::HashMap<MetricId, Metric>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a metric definition
    pub fn register(&self, metric: Metric) {
        self.metrics.write().insert(metric.id, metric);
    }

    /// Forget a metric; returns its last definition
    pub fn remove(&self, id: &MetricId) -> Option<Metric> {
        self.metrics.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    /// Every registered id
    pub fn ids(&self) -> Vec<MetricId> {
        self.metrics.read().keys().copied().collect()
    }
}

impl MetricCatalog for StaticCatalog {
    fn get(&self, id: &MetricId) -> Option<Metric> {
        self.metrics.read().get(id).cloned()
    }
}
