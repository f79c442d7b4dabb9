//! Entity registry: logical entity names to the collections backing them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::metrics::error::{MetricsError, Result};

/// A snapshot of the records behind one entity, each a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    entity: String,
    records: Vec<Value>,
}

impl Collection {
    pub fn new(entity: impl Into<String>, records: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            records,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Something that can produce the current records of an entity.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn load(&self) -> Result<Vec<Value>>;
}

/// Column of a backing table. Structured columns hold JSON text and are
/// exposed to filters as nested JSON.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub structured: bool,
}

const fn col(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, structured: false }
}

const fn json_col(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, structured: true }
}

pub const TRUCK_COLUMNS: &[ColumnSpec] = &[
    col("id"),
    col("assigned_driver"),
    col("make"),
    col("model"),
    col("year"),
    col("color"),
    col("mileage"),
    col("vin"),
    col("plate"),
    col("status"),
    json_col("specs"),
];

pub const DRIVER_COLUMNS: &[ColumnSpec] = &[
    col("id"),
    col("first_name"),
    col("last_name"),
    col("phone_number"),
    col("email"),
    col("license_number"),
    col("license_expiration"),
    col("is_active"),
    json_col("performance"),
    json_col("current_assignment"),
];

pub const JOB_COLUMNS: &[ColumnSpec] = &[
    col("id"),
    col("job_number"),
    col("job_date"),
    col("job_type"),
    col("job_description"),
    col("job_status"),
];

pub const MAINTENANCE_COLUMNS: &[ColumnSpec] = &[
    col("maintenance_id"),
    col("truck_id"),
    col("maintenance_mileage"),
    col("maintenance_description"),
    col("maintenance_type"),
    col("maintenance_date"),
    col("maintenance_next_scheduled"),
];

/// A SQLite table exposed as an entity collection.
pub struct SqliteEntity {
    pool: SqlitePool,
    table: &'static str,
    columns: &'static [ColumnSpec],
}

impl SqliteEntity {
    pub fn new(pool: SqlitePool, table: &'static str, columns: &'static [ColumnSpec]) -> Self {
        Self { pool, table, columns }
    }

    fn select_sql(&self) -> String {
        let pairs: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("'{0}', {0}", c.name))
            .collect();
        format!(
            "SELECT json_object({}) AS record FROM {} ORDER BY rowid ASC",
            pairs.join(", "),
            self.table
        )
    }

    /// Replace JSON text in structured columns with the decoded value.
    /// Text that does not parse is left as is.
    fn expand_structured(&self, record: &mut Value) {
        let Value::Object(map) = record else {
            return;
        };
        for spec in self.columns.iter().filter(|c| c.structured) {
            let decoded = match map.get(spec.name) {
                Some(Value::String(text)) => serde_json::from_str::<Value>(text).ok(),
                _ => None,
            };
            if let Some(decoded) = decoded {
                map.insert(spec.name.to_string(), decoded);
            }
        }
    }

    /// Insert one record given as a JSON object. Unknown keys are rejected,
    /// structured values are stored as JSON text. Returns the new row id.
    pub async fn insert(&self, record: &Value) -> Result<i64> {
        let Value::Object(map) = record else {
            return Err(MetricsError::invalid_config(format!(
                "{} record must be a JSON object",
                self.table
            )));
        };

        let mut names = Vec::with_capacity(map.len());
        for key in map.keys() {
            let spec = self
                .columns
                .iter()
                .find(|c| c.name == key)
                .ok_or_else(|| {
                    MetricsError::invalid_config(format!(
                        "unknown column '{}' for {}",
                        key, self.table
                    ))
                })?;
            names.push(spec);
        }
        if names.is_empty() {
            return Err(MetricsError::invalid_config(format!(
                "{} record has no columns",
                self.table
            )));
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let column_list: Vec<&str> = names.iter().map(|c| c.name).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            column_list.join(", "),
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for spec in &names {
            let value = &map[spec.name];
            query = match value {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(i64::from(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.to_string()),
            };
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl EntitySource for SqliteEntity {
    async fn load(&self) -> Result<Vec<Value>> {
        let rows: Vec<String> = sqlx::query_scalar(&self.select_sql())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|text| {
                let mut record: Value = serde_json::from_str(text).map_err(|e| {
                    MetricsError::invalid_config(format!(
                        "failed to decode {} row: {}",
                        self.table, e
                    ))
                })?;
                self.expand_structured(&mut record);
                Ok(record)
            })
            .collect()
    }
}

/// A fixed in-memory collection.
#[derive(Debug, Clone, Default)]
pub struct StaticEntity {
    records: Vec<Value>,
}

impl StaticEntity {
    pub fn new(records: Vec<Value>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl EntitySource for StaticEntity {
    async fn load(&self) -> Result<Vec<Value>> {
        Ok(self.records.clone())
    }
}

/// Maps entity names to their sources. Populated before it is shared and
/// read-only afterwards.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    sources: BTreeMap<String, Arc<dyn EntitySource>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fleet entities backed by their SQLite tables.
    pub fn fleet(pool: &SqlitePool) -> Self {
        let mut registry = Self::new();
        registry
            .register("trucks", SqliteEntity::new(pool.clone(), "trucks", TRUCK_COLUMNS))
            .register("drivers", SqliteEntity::new(pool.clone(), "drivers", DRIVER_COLUMNS))
            .register("jobs", SqliteEntity::new(pool.clone(), "jobs", JOB_COLUMNS))
            .register(
                "maintenance",
                SqliteEntity::new(pool.clone(), "maintenances", MAINTENANCE_COLUMNS),
            );
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        source: impl EntitySource + 'static,
    ) -> &mut Self {
        self.sources.insert(name.into(), Arc::new(source));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    /// `InvalidEntity` unless `name` is registered. Used by the store.
    pub fn ensure_known(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(MetricsError::InvalidEntity {
                entity: name.to_string(),
                allowed: self.names().join(", "),
            })
        }
    }

    /// Load the current collection for `name`.
    pub async fn resolve(&self, name: &str) -> Result<Collection> {
        let source = self
            .sources
            .get(name)
            .ok_or_else(|| MetricsError::unknown_entity(name))?;
        let records = source.load().await?;
        Ok(Collection::new(name, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::db::create_pool;

    #[tokio::test]
    async fn resolve_unknown_entity_fails() {
        let registry = EntityRegistry::new();
        let err = registry.resolve("boats").await.unwrap_err();
        assert!(matches!(err, MetricsError::UnknownEntity { ref entity } if entity == "boats"));
    }

    #[tokio::test]
    async fn static_entity_round_trips_records() {
        let mut registry = EntityRegistry::new();
        registry.register("trucks", StaticEntity::new(vec![json!({"id": 1}), json!({"id": 2})]));

        let collection = registry.resolve("trucks").await.unwrap();
        assert_eq!(collection.entity(), "trucks");
        assert_eq!(collection.len(), 2);
    }

    #[tokio::test]
    async fn fleet_registry_knows_the_four_entities() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let registry = EntityRegistry::fleet(&pool);
        assert_eq!(registry.names(), vec!["drivers", "jobs", "maintenance", "trucks"]);
        assert!(registry.ensure_known("trucks").is_ok());
        assert_eq!(registry.ensure_known("fleet").unwrap_err().kind(), "InvalidEntity");
    }

    #[tokio::test]
    async fn sqlite_entity_exposes_structured_columns_as_json() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let drivers = SqliteEntity::new(pool.clone(), "drivers", DRIVER_COLUMNS);
        drivers
            .insert(&json!({
                "first_name": "Ana",
                "last_name": "Ruiz",
                "license_number": "L-1",
                "is_active": true,
                "performance": {"fleet_safety_rating": 4.8},
            }))
            .await
            .unwrap();

        let records = drivers.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["is_active"], json!(1));
        assert_eq!(records[0]["performance"]["fleet_safety_rating"], json!(4.8));
        assert_eq!(records[0]["current_assignment"], Value::Null);
    }

    #[tokio::test]
    async fn sqlite_entity_rejects_unknown_columns() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let jobs = SqliteEntity::new(pool, "jobs", JOB_COLUMNS);
        let err = jobs.insert(&json!({"wheels": 18})).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidMetricConfig");
    }
}
