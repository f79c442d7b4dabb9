//! Filter evaluation over entity collections.
//!
//! [`apply`] narrows a [`Collection`] by a list of [`FilterClause`]s joined
//! with AND. It never mutates its input and never widens the result.
//!
//! Null handling follows SQL: a null or missing field matches no
//! value-based operator and only satisfies `is_null`. `like` is a
//! case-sensitive substring test.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::metrics::error::{MetricsError, Result};
use crate::metrics::field::FieldPath;
use crate::metrics::registry::Collection;
use crate::metrics::types::FilterClause;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Ne => "ne",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
            FilterOperator::Like => "like",
            FilterOperator::IsNull => "is_null",
            FilterOperator::IsNotNull => "is_not_null",
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOperator {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        let op = match s {
            "eq" => FilterOperator::Eq,
            "ne" => FilterOperator::Ne,
            "gt" => FilterOperator::Gt,
            "gte" => FilterOperator::Gte,
            "lt" => FilterOperator::Lt,
            "lte" => FilterOperator::Lte,
            "in" => FilterOperator::In,
            "not_in" => FilterOperator::NotIn,
            "like" => FilterOperator::Like,
            "is_null" => FilterOperator::IsNull,
            "is_not_null" => FilterOperator::IsNotNull,
            other => {
                return Err(MetricsError::invalid_filter(format!(
                    "unknown operator '{}'",
                    other
                )))
            }
        };
        Ok(op)
    }
}

/// A clause with its field and operator already parsed and its value
/// checked against the operator.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: Value,
}

impl CompiledFilter {
    pub fn compile(clause: &FilterClause) -> Result<Self> {
        let operator: FilterOperator = clause.operator.parse()?;
        let field = FieldPath::parse_with(&clause.field, MetricsError::invalid_filter)?;

        match operator {
            FilterOperator::In | FilterOperator::NotIn if !clause.value.is_array() => {
                return Err(MetricsError::invalid_filter(format!(
                    "operator '{}' on '{}' requires a list value",
                    operator, clause.field
                )));
            }
            FilterOperator::Like if !clause.value.is_string() => {
                return Err(MetricsError::invalid_filter(format!(
                    "operator 'like' on '{}' requires a string value",
                    clause.field
                )));
            }
            _ => {}
        }

        Ok(Self {
            field,
            operator,
            value: clause.value.clone(),
        })
    }

    pub fn matches(&self, record: &Value) -> Result<bool> {
        let resolved = self.field.resolve(record);
        let actual = match resolved.as_deref() {
            None | Some(Value::Null) => {
                return Ok(self.operator == FilterOperator::IsNull);
            }
            Some(v) => v,
        };

        let matched = match self.operator {
            FilterOperator::IsNull => false,
            FilterOperator::IsNotNull => true,
            FilterOperator::Eq => values_equal(actual, &self.value),
            FilterOperator::Ne => !self.value.is_null() && !values_equal(actual, &self.value),
            FilterOperator::Gt => self.compare(actual)? == Ordering::Greater,
            FilterOperator::Gte => self.compare(actual)? != Ordering::Less,
            FilterOperator::Lt => self.compare(actual)? == Ordering::Less,
            FilterOperator::Lte => self.compare(actual)? != Ordering::Greater,
            FilterOperator::In => self.list().iter().any(|v| values_equal(actual, v)),
            FilterOperator::NotIn => !self.list().iter().any(|v| values_equal(actual, v)),
            FilterOperator::Like => {
                let needle = self.value.as_str().unwrap_or_default();
                match actual {
                    Value::String(s) => s.contains(needle),
                    other => other.to_string().contains(needle),
                }
            }
        };
        Ok(matched)
    }

    fn list(&self) -> &[Value] {
        self.value.as_array().map(Vec::as_slice).unwrap_or_default()
    }

    fn compare(&self, actual: &Value) -> Result<Ordering> {
        let ordering = match (actual, &self.value) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(a, b)| a.partial_cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        };

        ordering.ok_or_else(|| {
            MetricsError::invalid_filter(format!(
                "cannot compare '{}' ({}) with {} using '{}'",
                self.field,
                type_name(actual),
                type_name(&self.value),
                self.operator
            ))
        })
    }
}

/// JSON equality with numeric normalisation: `1 == 1.0`, and booleans
/// equal their SQLite integer encoding (`true == 1`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Bool(x), Value::Number(n)) | (Value::Number(n), Value::Bool(x)) => {
            n.as_f64() == Some(if *x { 1.0 } else { 0.0 })
        }
        _ => a == b,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Compile every clause, failing on the first invalid one.
pub fn compile(filters: &[FilterClause]) -> Result<Vec<CompiledFilter>> {
    filters.iter().map(CompiledFilter::compile).collect()
}

/// Narrow `collection` to the records matching every clause.
pub fn apply(collection: &Collection, filters: &[FilterClause]) -> Result<Collection> {
    if filters.is_empty() {
        return Ok(collection.clone());
    }

    let compiled = compile(filters)?;
    let mut kept = Vec::new();
    for record in collection.records() {
        let mut keep = true;
        for filter in &compiled {
            if !filter.matches(record)? {
                keep = false;
                break;
            }
        }
        if keep {
            kept.push(record.clone());
        }
    }

    Ok(Collection::new(collection.entity(), kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn trucks() -> Collection {
        Collection::new(
            "trucks",
            vec![
                json!({"id": 1, "status": "active", "mileage": 1000, "make": "Volvo",
                       "specs": {"engine": {"hp": 450}}}),
                json!({"id": 2, "status": "active", "mileage": 50000, "make": "Kenworth",
                       "specs": {"engine": {"hp": 500}}}),
                json!({"id": 3, "status": "repair", "mileage": 120000, "make": "Volvo"}),
                json!({"id": 4, "status": "retired", "mileage": 300000, "make": "Mack",
                       "plate": null}),
            ],
        )
    }

    fn ids(collection: &Collection) -> Vec<i64> {
        collection
            .records()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect()
    }

    fn run(filters: Vec<FilterClause>) -> Result<Collection> {
        apply(&trucks(), &filters)
    }

    #[test]
    fn empty_filter_list_returns_collection_unchanged() {
        let original = trucks();
        assert_eq!(apply(&original, &[]).unwrap(), original);
    }

    #[test]
    fn eq_and_ne() {
        let eq = run(vec![FilterClause::new("status", "eq", json!("active"))]).unwrap();
        assert_eq!(ids(&eq), vec![1, 2]);

        let ne = run(vec![FilterClause::new("status", "ne", json!("active"))]).unwrap();
        assert_eq!(ids(&ne), vec![3, 4]);
    }

    #[test]
    fn numeric_equality_ignores_representation() {
        let c = run(vec![FilterClause::new("mileage", "eq", json!(1000.0))]).unwrap();
        assert_eq!(ids(&c), vec![1]);
    }

    #[test]
    fn boolean_filters_match_sqlite_integers() {
        let drivers = Collection::new(
            "drivers",
            vec![json!({"id": 1, "is_active": 1}), json!({"id": 2, "is_active": 0})],
        );
        let active = apply(&drivers, &[FilterClause::new("is_active", "eq", json!(true))]).unwrap();
        assert_eq!(ids(&active), vec![1]);
    }

    #[test]
    fn ordering_operators() {
        let gt = run(vec![FilterClause::new("mileage", "gt", json!(50000))]).unwrap();
        assert_eq!(ids(&gt), vec![3, 4]);
        let gte = run(vec![FilterClause::new("mileage", "gte", json!(50000))]).unwrap();
        assert_eq!(ids(&gte), vec![2, 3, 4]);
        let lt = run(vec![FilterClause::new("mileage", "lt", json!(50000))]).unwrap();
        assert_eq!(ids(&lt), vec![1]);
        let lte = run(vec![FilterClause::new("mileage", "lte", json!(50000))]).unwrap();
        assert_eq!(ids(&lte), vec![1, 2]);
    }

    #[test]
    fn string_ordering_is_lexicographic() {
        let c = run(vec![FilterClause::new("make", "lt", json!("N"))]).unwrap();
        assert_eq!(ids(&c), vec![2, 4]);
    }

    #[test]
    fn ordering_type_mismatch_is_invalid_filter() {
        let err = run(vec![FilterClause::new("mileage", "gt", json!("lots"))]).unwrap_err();
        assert_eq!(err.kind(), "InvalidFilter");
        assert!(err.to_string().contains("mileage"));
    }

    #[test]
    fn in_and_not_in() {
        let c = run(vec![FilterClause::new("status", "in", json!(["repair", "retired"]))]).unwrap();
        assert_eq!(ids(&c), vec![3, 4]);
        let c = run(vec![FilterClause::new("status", "not_in", json!(["repair", "retired"]))])
            .unwrap();
        assert_eq!(ids(&c), vec![1, 2]);
    }

    #[test]
    fn in_requires_a_list() {
        let err = run(vec![FilterClause::new("status", "in", json!("active"))]).unwrap_err();
        assert_eq!(err.kind(), "InvalidFilter");
    }

    #[test]
    fn like_is_case_sensitive_substring() {
        let c = run(vec![FilterClause::new("make", "like", json!("olv"))]).unwrap();
        assert_eq!(ids(&c), vec![1, 3]);
        let c = run(vec![FilterClause::new("make", "like", json!("VOLVO"))]).unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn null_checks_treat_missing_as_null() {
        let c = run(vec![FilterClause::new("plate", "is_null", Value::Null)]).unwrap();
        assert_eq!(ids(&c), vec![1, 2, 3, 4]);
        let c = run(vec![FilterClause::new("specs", "is_not_null", json!("ignored"))]).unwrap();
        assert_eq!(ids(&c), vec![1, 2]);
    }

    #[test]
    fn null_fields_never_match_value_operators() {
        let c = run(vec![FilterClause::new("plate", "ne", json!("ABC-123"))]).unwrap();
        assert!(c.is_empty());
        let c = run(vec![FilterClause::new("plate", "not_in", json!(["ABC-123"]))]).unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn json_paths_descend_into_structured_fields() {
        let c = run(vec![FilterClause::new("json:specs.engine.hp", "gte", json!(480))]).unwrap();
        assert_eq!(ids(&c), vec![2]);
    }

    #[test]
    fn multiple_filters_are_conjunctive() {
        let c = run(vec![
            FilterClause::new("make", "eq", json!("Volvo")),
            FilterClause::new("status", "eq", json!("active")),
        ])
        .unwrap();
        assert_eq!(ids(&c), vec![1]);
    }

    #[test]
    fn unknown_operator_is_named_in_the_error() {
        let err = run(vec![FilterClause::new("status", "between", json!([1, 2]))]).unwrap_err();
        assert_eq!(err.kind(), "InvalidFilter");
        assert!(err.to_string().contains("between"));
    }

    #[test]
    fn input_collection_is_not_mutated() {
        let original = trucks();
        let before = original.clone();
        let _ = apply(&original, &[FilterClause::new("status", "eq", json!("active"))]).unwrap();
        assert_eq!(original, before);
    }

    fn arb_record() -> impl Strategy<Value = Value> {
        (
            prop_oneof![Just("active"), Just("repair"), Just("retired")],
            0i64..200_000,
            proptest::option::of(prop_oneof![Just("Volvo"), Just("Mack")]),
        )
            .prop_map(|(status, mileage, make)| {
                json!({"status": status, "mileage": mileage, "make": make})
            })
    }

    fn arb_clause() -> impl Strategy<Value = FilterClause> {
        prop_oneof![
            prop_oneof![Just("active"), Just("repair")]
                .prop_map(|s| FilterClause::new("status", "eq", json!(s))),
            (0i64..200_000).prop_map(|m| FilterClause::new("mileage", "gt", json!(m))),
            (0i64..200_000).prop_map(|m| FilterClause::new("mileage", "lte", json!(m))),
            Just(FilterClause::new("make", "is_null", Value::Null)),
            Just(FilterClause::new("make", "like", json!("o"))),
            Just(FilterClause::new("status", "not_in", json!(["retired"]))),
        ]
    }

    proptest! {
        #[test]
        fn apply_is_idempotent(
            records in proptest::collection::vec(arb_record(), 0..40),
            filters in proptest::collection::vec(arb_clause(), 0..4),
        ) {
            let collection = Collection::new("trucks", records);
            let once = apply(&collection, &filters).unwrap();
            let twice = apply(&once, &filters).unwrap();
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.len() <= collection.len());
        }
    }
}
