//! Error types for sackdb
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::metric::MetricId;

/// Result type alias using SackError
pub type Result<T> = std::result::Result<T, SackError>;

/// Unified error type for sackdb operations
#[derive(Debug, Error)]
pub enum SackError {
    // -------------------------------------------------------------------------
    // I/O and Backend Errors (transient, retried by the driver)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Operation against a key holding the wrong kind of value: {key}")]
    WrongType { key: String },

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Metric {0} does not exist")]
    MetricDoesNotExist(MetricId),

    // -------------------------------------------------------------------------
    // Protocol Errors (fatal, never silently skipped)
    // -------------------------------------------------------------------------
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Notification Errors
    // -------------------------------------------------------------------------
    #[error("Subscription channel closed")]
    SubscriptionClosed,
}

impl From<bincode::Error> for SackError {
    fn from(e: bincode::Error) -> Self {
        SackError::Serialization(e.to_string())
    }
}

impl SackError {
    /// Whether the driver should retry the failed operation later
    pub fn is_transient(&self) -> bool {
        matches!(self, SackError::Io(_) | SackError::Backend(_))
    }
}
