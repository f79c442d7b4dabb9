//! Field addressing shared by filters and aggregations.
//!
//! A field is either a plain column (`mileage`) or a path into a structured
//! column written as `json:<column>.<path>` (`json:performance.safety.score`).

use std::fmt;

use serde_json::Value;

use crate::metrics::error::{MetricsError, Result};

const JSON_PREFIX: &str = "json:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPath {
    Column(String),
    Json { column: String, path: Vec<String> },
}

impl FieldPath {
    /// Parse a field spec. `error` builds the error reported for a
    /// malformed spec, so filters and aggregations can use their own kind.
    pub fn parse_with<E>(spec: &str, error: E) -> Result<Self>
    where
        E: Fn(String) -> MetricsError,
    {
        let Some(rest) = spec.strip_prefix(JSON_PREFIX) else {
            if spec.is_empty() {
                return Err(error("field name is empty".to_string()));
            }
            return Ok(FieldPath::Column(spec.to_string()));
        };

        let mut parts = rest.split('.');
        let column = parts.next().unwrap_or_default();
        let path: Vec<String> = parts.map(str::to_string).collect();

        if column.is_empty() || path.is_empty() || path.iter().any(String::is_empty) {
            return Err(error(format!(
                "malformed json field '{}', expected json:<column>.<path>",
                spec
            )));
        }

        Ok(FieldPath::Json {
            column: column.to_string(),
            path,
        })
    }

    /// Look the field up in `record`. Missing attributes resolve to `None`.
    ///
    /// Structured columns may hold either nested JSON or JSON text; text is
    /// decoded before descending.
    pub fn resolve<'a>(&self, record: &'a Value) -> Option<std::borrow::Cow<'a, Value>> {
        use std::borrow::Cow;

        match self {
            FieldPath::Column(name) => record.get(name).map(Cow::Borrowed),
            FieldPath::Json { column, path } => {
                let base = record.get(column)?;
                match base {
                    Value::String(text) => {
                        let decoded: Value = serde_json::from_str(text).ok()?;
                        descend(&decoded, path).cloned().map(Cow::Owned)
                    }
                    other => descend(other, path).map(Cow::Borrowed),
                }
            }
        }
    }
}

fn descend<'a>(mut value: &'a Value, path: &[String]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPath::Column(name) => f.write_str(name),
            FieldPath::Json { column, path } => {
                write!(f, "{}{}.{}", JSON_PREFIX, column, path.join("."))
            }
        }
    }
}
