//! Sack routing
//!
//! A sack is one shard of the metric keyspace. Routing is a pure function
//! of the metric id and the sack count, so every worker agrees on which
//! sack owns a metric without talking to the others.

use std::fmt;

use crate::error::{Result, SackError};
use crate::metric::MetricId;

/// Prefix of sack names: sack `i` of `N` is `incoming<N>-<i>`
pub const SACK_PREFIX: &str = "incoming";

/// One shard of the incoming keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sack {
    index: u32,
    count: u32,
}

impl Sack {
    pub fn new(index: u32, count: u32) -> Result<Self> {
        if index >= count {
            return Err(SackError::Config(format!(
                "sack index {} out of range for {} sacks",
                index, count
            )));
        }
        Ok(Self { index, count })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Sack count this sack was routed with
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Name of the sack, also the key of its marker
    pub fn name(&self) -> String {
        format!("{}{}-{}", SACK_PREFIX, self.count, self.index)
    }

    /// Parse a sack name produced under `count` sacks.
    /// "incoming128-17" → Some(sack 17)
    pub fn parse_name(name: &str, count: u32) -> Option<Self> {
        let rest = name.strip_prefix(SACK_PREFIX)?;
        let (n, i) = rest.split_once('-')?;
        if n.parse::<u32>().ok()? != count || !i.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::new(i.parse().ok()?, count).ok()
    }
}

impl fmt::Display for Sack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Deterministic metric → sack partitioner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackRouter {
    sack_count: u32,
}

impl SackRouter {
    pub fn new(sack_count: u32) -> Result<Self> {
        if sack_count == 0 {
            return Err(SackError::Config("sack count must be at least 1".to_string()));
        }
        Ok(Self { sack_count })
    }

    pub fn sack_count(&self) -> u32 {
        self.sack_count
    }

    /// The sack owning `metric`
    pub fn sack_for(&self, metric: &MetricId) -> Sack {
        let index = (metric.as_u128() % self.sack_count as u128) as u32;
        Sack {
            index,
            count: self.sack_count,
        }
    }

    /// Sack by index
    pub fn sack(&self, index: u32) -> Result<Sack> {
        Sack::new(index, self.sack_count)
    }

    /// Every sack, in index order
    pub fn sacks(&self) -> impl Iterator<Item = Sack> {
        let count = self.sack_count;
        (0..count).map(move |index| Sack { index, count })
    }

    /// Whether `sack` was produced by a router with the same sack count
    pub fn owns(&self, sack: &Sack) -> bool {
        sack.count == self.sack_count
    }
}
