//! Metric calculator: turns a metric definition into a scalar.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool, ValueRef};

use crate::metrics::{
    error::{MetricsError, Result},
    field::FieldPath,
    filter,
    registry::{Collection, EntityRegistry},
    types::{CalculationConfig, FilterClause, MetricDefinition, MetricType, MetricValue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
}

/// A metric's calculation with exactly the inputs its kind needs.
#[derive(Debug, Clone)]
pub enum Calculation {
    Count {
        filters: Vec<FilterClause>,
    },
    Aggregate {
        op: Aggregation,
        field: FieldPath,
        filters: Vec<FilterClause>,
    },
    DistinctCount {
        field: FieldPath,
        filters: Vec<FilterClause>,
    },
    Percentage {
        filters: Vec<FilterClause>,
        numerator_filters: Vec<FilterClause>,
        denominator_filters: Option<Vec<FilterClause>>,
    },
    /// Raw SQL run verbatim. Nothing guards against injection here; only
    /// trusted callers should be able to define custom metrics.
    Custom {
        query: String,
    },
}

impl Calculation {
    /// Build from the stored `(type, config)` pair.
    pub fn from_parts(metric_type: &str, config: Option<&CalculationConfig>) -> Result<Self> {
        let metric_type: MetricType = metric_type.parse()?;
        let config = config.cloned().unwrap_or_default();

        let required_field = |config: &CalculationConfig| -> Result<FieldPath> {
            let spec = config.field.as_deref().ok_or_else(|| {
                MetricsError::invalid_config(format!(
                    "'{}' metrics require calculation_config.field",
                    metric_type
                ))
            })?;
            FieldPath::parse_with(spec, MetricsError::invalid_config)
        };

        let calculation = match metric_type {
            MetricType::Count => Calculation::Count {
                filters: config.filters,
            },
            MetricType::Sum | MetricType::Avg | MetricType::Min | MetricType::Max => {
                let op = match metric_type {
                    MetricType::Sum => Aggregation::Sum,
                    MetricType::Avg => Aggregation::Avg,
                    MetricType::Min => Aggregation::Min,
                    _ => Aggregation::Max,
                };
                Calculation::Aggregate {
                    op,
                    field: required_field(&config)?,
                    filters: config.filters,
                }
            }
            MetricType::DistinctCount => Calculation::DistinctCount {
                field: required_field(&config)?,
                filters: config.filters,
            },
            MetricType::Percentage => Calculation::Percentage {
                filters: config.filters,
                numerator_filters: config.numerator_filters,
                denominator_filters: config.denominator_filters,
            },
            MetricType::Custom => Calculation::Custom {
                query: config.query.filter(|q| !q.trim().is_empty()).ok_or_else(|| {
                    MetricsError::invalid_config("'custom' metrics require calculation_config.query")
                })?,
            },
        };
        Ok(calculation)
    }

    /// Evaluate against an already-resolved collection. `Custom` is not
    /// handled here because it never reads a collection.
    pub fn evaluate(&self, collection: &Collection) -> Result<MetricValue> {
        match self {
            Calculation::Count { filters } => {
                let working = filter::apply(collection, filters)?;
                Ok(MetricValue::Integer(working.len() as i64))
            }
            Calculation::Aggregate { op, field, filters } => {
                let working = filter::apply(collection, filters)?;
                aggregate(*op, field, &working)
            }
            Calculation::DistinctCount { field, filters } => {
                let working = filter::apply(collection, filters)?;
                let distinct: HashSet<String> = working
                    .records()
                    .iter()
                    .filter_map(|r| field.resolve(r))
                    .filter(|v| !v.is_null())
                    .map(|v| distinct_key(&v))
                    .collect();
                Ok(MetricValue::Integer(distinct.len() as i64))
            }
            Calculation::Percentage {
                filters,
                numerator_filters,
                denominator_filters,
            } => {
                let working = filter::apply(collection, filters)?;
                let numerator = filter::apply(&working, numerator_filters)?.len();
                let denominator = match denominator_filters {
                    Some(f) => filter::apply(&working, f)?.len(),
                    None => working.len(),
                };
                if denominator == 0 {
                    return Ok(MetricValue::Float(0.0));
                }
                Ok(MetricValue::Float(numerator as f64 / denominator as f64 * 100.0))
            }
            Calculation::Custom { .. } => Err(MetricsError::invalid_config(
                "custom metrics are evaluated by a query executor",
            )),
        }
    }
}

fn aggregate(op: Aggregation, field: &FieldPath, working: &Collection) -> Result<MetricValue> {
    let mut numbers: Vec<serde_json::Number> = Vec::with_capacity(working.len());
    for record in working.records() {
        let Some(value) = field.resolve(record) else {
            continue;
        };
        match value.as_ref() {
            Value::Null => {}
            Value::Number(n) => numbers.push(n.clone()),
            Value::Bool(b) => numbers.push(serde_json::Number::from(i64::from(*b))),
            other => {
                return Err(MetricsError::invalid_config(format!(
                    "field '{}' holds a non-numeric value: {}",
                    field, other
                )))
            }
        }
    }

    let floats = || numbers.iter().filter_map(serde_json::Number::as_f64);

    let value = match op {
        Aggregation::Sum => MetricValue::Float(floats().sum()),
        Aggregation::Avg => {
            if numbers.is_empty() {
                MetricValue::Float(0.0)
            } else {
                MetricValue::Float(floats().sum::<f64>() / numbers.len() as f64)
            }
        }
        Aggregation::Min | Aggregation::Max => {
            if numbers.is_empty() {
                return Ok(MetricValue::Integer(0));
            }
            let integers: Option<Vec<i64>> = numbers.iter().map(serde_json::Number::as_i64).collect();
            match (integers, op) {
                (Some(ints), Aggregation::Min) => MetricValue::Integer(ints.into_iter().min().unwrap_or(0)),
                (Some(ints), _) => MetricValue::Integer(ints.into_iter().max().unwrap_or(0)),
                (None, Aggregation::Min) => MetricValue::Float(floats().fold(f64::INFINITY, f64::min)),
                (None, _) => MetricValue::Float(floats().fold(f64::NEG_INFINITY, f64::max)),
            }
        }
    };
    Ok(value)
}

fn distinct_key(value: &Value) -> String {
    match value {
        Value::Number(n) => format!("n:{}", n.as_f64().unwrap_or_default()),
        Value::String(s) => format!("s:{}", s),
        other => format!("j:{}", other),
    }
}

/// Runs the raw query of a `custom` metric and returns its first column.
#[async_trait]
pub trait RawQueryExecutor: Send + Sync {
    async fn scalar(&self, query: &str) -> Result<MetricValue>;
}

#[async_trait]
impl RawQueryExecutor for SqlitePool {
    async fn scalar(&self, query: &str) -> Result<MetricValue> {
        let row = sqlx::query(query).fetch_optional(self).await.map_err(|e| match e {
            sqlx::Error::Database(db) => {
                MetricsError::invalid_config(format!("custom query failed: {}", db.message()))
            }
            other => MetricsError::Storage(other),
        })?;

        let Some(row) = row else {
            return Ok(MetricValue::Integer(0));
        };
        if row.columns().is_empty() {
            return Err(MetricsError::invalid_config("custom query returned no columns"));
        }
        if row.try_get_raw(0)?.is_null() {
            return Ok(MetricValue::Integer(0));
        }
        if let Ok(v) = row.try_get::<i64, _>(0) {
            return Ok(MetricValue::Integer(v));
        }
        row.try_get::<f64, _>(0)
            .map(MetricValue::Float)
            .map_err(|_| MetricsError::invalid_config("custom query must return a number"))
    }
}

/// Computes metric values from definitions. Never persists anything.
#[derive(Clone)]
pub struct MetricCalculator {
    registry: Arc<EntityRegistry>,
    raw_queries: Option<Arc<dyn RawQueryExecutor>>,
}

impl MetricCalculator {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            raw_queries: None,
        }
    }

    /// Enable `custom` metrics backed by `executor`.
    pub fn with_raw_queries(mut self, executor: Arc<dyn RawQueryExecutor>) -> Self {
        self.raw_queries = Some(executor);
        self
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub async fn calculate(&self, definition: &MetricDefinition) -> Result<MetricValue> {
        let calculation = Calculation::from_parts(
            &definition.metric_type,
            definition.calculation_config.as_ref(),
        )?;

        let value = if let Calculation::Custom { query } = &calculation {
            let executor = self.raw_queries.as_ref().ok_or_else(|| {
                MetricsError::invalid_config("custom queries are not enabled")
            })?;
            executor.scalar(query).await?
        } else {
            let entity = definition.entity.as_deref().ok_or_else(|| {
                MetricsError::invalid_config(format!(
                    "metric '{}' has no entity; manual metrics are not calculated",
                    definition.name
                ))
            })?;
            let collection = self.registry.resolve(entity).await?;
            calculation.evaluate(&collection)?
        };

        tracing::debug!(metric = %definition.name, %value, "metric calculated");
        Ok(value)
    }
}
