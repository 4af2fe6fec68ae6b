//! # sackdb
//!
//! Ingestion and storage core of a metric time-series platform:
//! - Sack-partitioned incoming buffer for raw measures
//! - Atomic snapshot-then-bounded-trim processing, safe under concurrent
//!   appends and concurrent workers
//! - Keyspace-notification wake-ups for idle workers
//! - Split-key aggregate store addressed by (window, method, granularity,
//!   format version)
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Producers (ingestion API)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ add_measures_batch
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        IncomingBuffer  (SackRouter: metric → sack)           │
//! │   RPUSH queue  +  SETNX sack marker ──► notification         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ iter_sacks_to_process / process_sack
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Workers (autonomous)                         │
//! │   snapshot ──► Aggregator ──► store_splits ──► trim          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  AggregateStore                              │
//! │      timeseries:<metric> { <ts>_<method>_<gran>_v<n> }       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        Backend (scripts, pipelines, scans, pub/sub)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod metric;
pub mod backend;
pub mod incoming;
pub mod storage;
pub mod aggregate;
pub mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{SackError, Result};
pub use config::Config;
pub use backend::{Backend, MemoryBackend};
pub use incoming::{IncomingBuffer, Measure, Sack, SackRouter};
pub use metric::{Aggregation, Metric, MetricCatalog, MetricId, SplitKey, StaticCatalog};
pub use storage::{AggregateStore, SplitWrite};
pub use aggregate::{Aggregator, ReferenceAggregator};
pub use worker::{RoundStats, Worker};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of sackdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
