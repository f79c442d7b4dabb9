//! Metric definitions and their calculation.
//!
//! A metric is a named scalar derived from an entity collection according
//! to declarative configuration: a type (count, sum, avg, ...), an optional
//! field and a list of filters. The [`MetricService`] ties the
//! [`MetricCalculator`] to the [`MetricRepository`](crate::repository::MetricRepository).

pub mod calculator;
pub mod error;
pub mod field;
pub mod filter;
pub mod registry;
pub mod service;
pub mod types;

pub use calculator::{Calculation, MetricCalculator, RawQueryExecutor};
pub use error::{MetricsError, Result};
pub use field::FieldPath;
pub use registry::{Collection, EntityRegistry, EntitySource, SqliteEntity, StaticEntity};
pub use service::MetricService;
pub use types::*;
