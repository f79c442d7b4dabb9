//! Core data types for metric definitions and calculation results

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::error::MetricsError;

/// A persisted metric definition together with its last computed value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricDefinition {
    pub id: i64,
    pub name: String,
    /// Logical entity name. `None` marks a manually maintained metric.
    pub entity: Option<String>,
    /// Wire form of the metric type. Parsed into [`MetricType`] when used.
    #[serde(rename = "type")]
    pub metric_type: String,
    pub value: f64,
    pub calculation_config: Option<CalculationConfig>,
    pub created_at: String,
    pub updated_at: String,
    pub last_calculated_at: Option<String>,
}

/// Fixed vocabulary of aggregation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    DistinctCount,
    Percentage,
    Custom,
}

impl MetricType {
    pub const ALL: [MetricType; 8] = [
        MetricType::Count,
        MetricType::Sum,
        MetricType::Avg,
        MetricType::Min,
        MetricType::Max,
        MetricType::DistinctCount,
        MetricType::Percentage,
        MetricType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Count => "count",
            MetricType::Sum => "sum",
            MetricType::Avg => "avg",
            MetricType::Min => "min",
            MetricType::Max => "max",
            MetricType::DistinctCount => "distinct_count",
            MetricType::Percentage => "percentage",
            MetricType::Custom => "custom",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MetricsError::unsupported_type(s))
    }
}

/// Declarative description of how a metric is computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CalculationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterClause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numerator_filters: Vec<FilterClause>,
    /// `None` means "the whole working collection".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denominator_filters: Option<Vec<FilterClause>>,
    /// Raw SQL for `custom` metrics. Executed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// One `(field, operator, value)` predicate. Clauses in a list are ANDed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterClause {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }
}

/// A computed scalar.
///
/// Integer and float results are kept apart: `min`/`max` over an empty
/// collection yield `Integer(0)` while `sum`/`avg` yield `Float(0.0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Integer(v) => *v as f64,
            MetricValue::Float(v) => *v,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, MetricValue::Integer(_))
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Addresses a metric by id or by unique name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricRef {
    Id(i64),
    Name(String),
}

impl MetricRef {
    /// Any identifier that parses as an integer is an id lookup; everything
    /// else is a name lookup. A metric literally named `"42"` can therefore
    /// never be reached by name through this path.
    pub fn parse(identifier: &str) -> Self {
        match identifier.parse::<i64>() {
            Ok(id) => MetricRef::Id(id),
            Err(_) => MetricRef::Name(identifier.to_string()),
        }
    }
}

impl fmt::Display for MetricRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricRef::Id(id) => write!(f, "Metric {}", id),
            MetricRef::Name(name) => write!(f, "Metric {}", name),
        }
    }
}

/// Input for creating a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMetric {
    pub name: String,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub calculation_config: Option<CalculationConfig>,
}

/// Partial update. `name` is immutable and therefore absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricUpdate {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default, rename = "type")]
    pub metric_type: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub calculation_config: Option<CalculationConfig>,
}

pub const DEFAULT_LIST_LIMIT: i64 = 100;
pub const MAX_LIST_LIMIT: i64 = 1000;

/// Listing filter and page window.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    pub entity: Option<String>,
    pub metric_type: Option<String>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_LIST_LIMIT
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            entity: None,
            metric_type: None,
            skip: 0,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

/// Outcome of a batch operation: what succeeded plus an error manifest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub updated: Vec<MetricDefinition>,
    pub failed: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn record_failure(&mut self, identifier: impl Into<String>, err: &MetricsError) {
        self.failed.push(BatchFailure {
            identifier: identifier.into(),
            error: err.kind().to_string(),
            message: err.public_message(),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchFailure {
    pub identifier: String,
    pub error: String,
    pub message: String,
}

/// Aggregate view over the stored metric definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricStatistics {
    pub total: i64,
    pub by_type: BTreeMap<String, i64>,
    pub by_entity: BTreeMap<String, i64>,
    pub never_calculated: i64,
    pub last_calculated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metric_ref_numeric_strings_are_ids() {
        assert_eq!(MetricRef::parse("42"), MetricRef::Id(42));
        assert_eq!(MetricRef::parse("-3"), MetricRef::Id(-3));
        assert_eq!(
            MetricRef::parse("active_trucks"),
            MetricRef::Name("active_trucks".into())
        );
        // A numeric-looking name is always treated as an id.
        assert_eq!(MetricRef::parse("2024"), MetricRef::Id(2024));
    }

    #[test]
    fn metric_type_parses_known_names_only() {
        assert_eq!("distinct_count".parse::<MetricType>().unwrap(), MetricType::DistinctCount);
        let err = "median".parse::<MetricType>().unwrap_err();
        assert_eq!(err.kind(), "UnsupportedMetricType");
    }

    #[test]
    fn metric_value_serializes_as_plain_number() {
        assert_eq!(serde_json::to_value(MetricValue::Integer(0)).unwrap(), json!(0));
        assert_eq!(serde_json::to_value(MetricValue::Float(40.0)).unwrap(), json!(40.0));
    }

    #[test]
    fn calculation_config_accepts_partial_json() {
        let config: CalculationConfig = serde_json::from_value(json!({
            "numerator_filters": [{"field": "job_status", "operator": "eq", "value": "Completed"}],
            "denominator_filters": []
        }))
        .unwrap();

        assert!(config.field.is_none());
        assert!(config.filters.is_empty());
        assert_eq!(config.numerator_filters.len(), 1);
        assert_eq!(config.denominator_filters, Some(vec![]));
    }

    #[test]
    fn is_null_clause_may_omit_value() {
        let clause: FilterClause =
            serde_json::from_value(json!({"field": "plate", "operator": "is_null"})).unwrap();
        assert_eq!(clause.value, Value::Null);
    }
}
