//! Error types for metric calculation, storage and scheduling

use thiserror::Error;

/// Errors surfaced by the metrics subsystem.
///
/// Every variant carries a stable [`kind`](MetricsError::kind) tag that the
/// HTTP layer reports alongside the human-readable message.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Unknown entity: {entity}")]
    UnknownEntity { entity: String },

    #[error("Invalid filter: {message}")]
    InvalidFilter { message: String },

    #[error("Invalid metric config: {message}")]
    InvalidMetricConfig { message: String },

    #[error("Unsupported metric type: {metric_type}")]
    UnsupportedMetricType { metric_type: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Invalid entity '{entity}'. Must be one of: {allowed}")]
    InvalidEntity { entity: String, allowed: String },

    #[error("Invalid trigger: {message}")]
    InvalidTrigger { message: String },

    #[error("Metric '{name}' already exists")]
    DuplicateName { name: String },

    #[error("Scheduler not available in this process")]
    SchedulerUnavailable,

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl MetricsError {
    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        Self::UnknownEntity { entity: entity.into() }
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter { message: message.into() }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidMetricConfig { message: message.into() }
    }

    pub fn unsupported_type(metric_type: impl Into<String>) -> Self {
        Self::UnsupportedMetricType { metric_type: metric_type.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid_trigger(message: impl Into<String>) -> Self {
        Self::InvalidTrigger { message: message.into() }
    }

    /// Stable machine-readable tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownEntity { .. } => "UnknownEntity",
            Self::InvalidFilter { .. } => "InvalidFilter",
            Self::InvalidMetricConfig { .. } => "InvalidMetricConfig",
            Self::UnsupportedMetricType { .. } => "UnsupportedMetricType",
            Self::NotFound { .. } => "NotFound",
            Self::InvalidEntity { .. } => "InvalidEntity",
            Self::InvalidTrigger { .. } => "InvalidTrigger",
            Self::DuplicateName { .. } => "DuplicateName",
            Self::SchedulerUnavailable => "SchedulerUnavailable",
            Self::Storage(_) => "Storage",
        }
    }

    /// Message safe to hand to API callers. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) => "storage failure".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MetricsError>;
