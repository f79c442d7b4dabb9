//! Database repository for metric definitions.
//!
//! All SQLite read/write logic for the `metric` table lives here. Every
//! mutating call is a single statement or a single transaction, so readers
//! see either the old row or the new one.
//!
//! Timestamps are stored as RFC 3339 strings.

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::metrics::{
    CalculationConfig, EntityRegistry, ListQuery, MetricDefinition, MetricRef, MetricStatistics,
    MetricType, MetricUpdate, MetricValue, MetricsError, NewMetric, Result, MAX_LIST_LIMIT,
};

const COLUMNS: &str = "id, name, entity, type, value, calculation_config, \
                       created_at, updated_at, last_calculated_at";

/// Repository for reading and writing metric definitions.
pub struct MetricRepository {
    pool: SqlitePool,
    registry: Arc<EntityRegistry>,
}

impl MetricRepository {
    pub fn new(pool: SqlitePool, registry: Arc<EntityRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    fn validate(&self, name: Option<&str>, metric_type: &str, entity: Option<&str>) -> Result<()> {
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(MetricsError::invalid_config("metric name must not be empty"));
            }
        }
        metric_type.parse::<MetricType>()?;
        if let Some(entity) = entity {
            self.registry.ensure_known(entity)?;
        }
        Ok(())
    }

    /// Insert a new metric. Fails with `DuplicateName` if the name is taken.
    pub async fn add(&self, metric: &NewMetric) -> Result<MetricDefinition> {
        self.validate(Some(&metric.name), &metric.metric_type, metric.entity.as_deref())?;

        let now = Utc::now().to_rfc3339();
        let config = encode_config(metric.calculation_config.as_ref())?;

        let row = sqlx::query(&format!(
            "INSERT INTO metric (name, entity, type, value, calculation_config, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {COLUMNS}"
        ))
        .bind(&metric.name)
        .bind(&metric.entity)
        .bind(&metric.metric_type)
        .bind(metric.value)
        .bind(config)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| duplicate_or_storage(e, &metric.name))?;

        let created = row_to_metric(&row)?;
        tracing::info!(metric = %created.name, id = created.id, "metric created");
        Ok(created)
    }

    /// Look a metric up by id or by name.
    pub async fn get(&self, metric: &MetricRef) -> Result<MetricDefinition> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_ref(&mut conn, metric)
            .await?
            .ok_or_else(|| MetricsError::not_found(metric.to_string()))
    }

    /// List metrics ordered by id. `limit` is clamped to `1..=1000`.
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<MetricDefinition>> {
        let limit = query.limit.clamp(1, MAX_LIST_LIMIT);
        let skip = query.skip.max(0);

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM metric
             WHERE (? IS NULL OR entity = ?)
               AND (? IS NULL OR type = ?)
             ORDER BY id ASC
             LIMIT ? OFFSET ?"
        ))
        .bind(&query.entity)
        .bind(&query.entity)
        .bind(&query.metric_type)
        .bind(&query.metric_type)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_metric).collect()
    }

    /// Every metric bound to an entity, optionally restricted to one entity.
    pub async fn list_calculable(&self, entity: Option<&str>) -> Result<Vec<MetricDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM metric
             WHERE entity IS NOT NULL
               AND (? IS NULL OR entity = ?)
             ORDER BY id ASC"
        ))
        .bind(entity)
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_metric).collect()
    }

    /// Apply a partial update inside one transaction.
    pub async fn update(&self, metric: &MetricRef, update: &MetricUpdate) -> Result<MetricDefinition> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_by_ref(&mut tx, metric)
            .await?
            .ok_or_else(|| MetricsError::not_found(metric.to_string()))?;

        let entity = update.entity.clone().or(current.entity);
        let metric_type = update.metric_type.clone().unwrap_or(current.metric_type);
        let value = update.value.unwrap_or(current.value);
        let config = update
            .calculation_config
            .clone()
            .or(current.calculation_config);

        self.validate(None, &metric_type, entity.as_deref())?;

        let row = sqlx::query(&format!(
            "UPDATE metric
             SET entity = ?, type = ?, value = ?, calculation_config = ?, updated_at = ?
             WHERE id = ?
             RETURNING {COLUMNS}"
        ))
        .bind(&entity)
        .bind(&metric_type)
        .bind(value)
        .bind(encode_config(config.as_ref())?)
        .bind(Utc::now().to_rfc3339())
        .bind(current.id)
        .fetch_one(&mut *tx)
        .await?;

        let updated = row_to_metric(&row)?;
        tx.commit().await?;

        tracing::info!(metric = %updated.name, id = updated.id, "metric updated");
        Ok(updated)
    }

    pub async fn delete(&self, metric: &MetricRef) -> Result<()> {
        let result = match metric {
            MetricRef::Id(id) => {
                sqlx::query("DELETE FROM metric WHERE id = ?")
                    .bind(*id)
                    .execute(&self.pool)
                    .await?
            }
            MetricRef::Name(name) => {
                sqlx::query("DELETE FROM metric WHERE name = ?")
                    .bind(name)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(MetricsError::not_found(metric.to_string()));
        }
        tracing::info!(%metric, "metric deleted");
        Ok(())
    }

    /// Return the metric named `name`, creating it on first reference.
    pub async fn get_or_create(
        &self,
        name: &str,
        entity: Option<&str>,
        metric_type: &str,
        config: Option<CalculationConfig>,
    ) -> Result<MetricDefinition> {
        let by_name = MetricRef::Name(name.to_string());
        match self.get(&by_name).await {
            Ok(existing) => return Ok(existing),
            Err(MetricsError::NotFound { .. }) => {}
            Err(other) => return Err(other),
        }

        let new_metric = NewMetric {
            name: name.to_string(),
            entity: entity.map(str::to_string),
            metric_type: metric_type.to_string(),
            value: 0.0,
            calculation_config: config,
        };
        match self.add(&new_metric).await {
            // Lost a race with a concurrent creator; theirs wins.
            Err(MetricsError::DuplicateName { .. }) => self.get(&by_name).await,
            other => other,
        }
    }

    /// Store a freshly calculated value in one atomic statement.
    pub async fn record_value(&self, id: i64, value: MetricValue) -> Result<MetricDefinition> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(&format!(
            "UPDATE metric
             SET value = ?, last_calculated_at = ?, updated_at = ?
             WHERE id = ?
             RETURNING {COLUMNS}"
        ))
        .bind(value.as_f64())
        .bind(&now)
        .bind(&now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetricsError::not_found(MetricRef::Id(id).to_string()))?;

        row_to_metric(&row)
    }

    /// Counts per type and per entity, optionally for one entity only.
    pub async fn statistics(&self, entity: Option<&str>) -> Result<MetricStatistics> {
        let mut stats = MetricStatistics::default();

        let summary = sqlx::query(
            "SELECT COUNT(*) AS total,
                    SUM(CASE WHEN last_calculated_at IS NULL THEN 1 ELSE 0 END) AS never,
                    MAX(last_calculated_at) AS last_calc
             FROM metric
             WHERE (? IS NULL OR entity = ?)",
        )
        .bind(entity)
        .bind(entity)
        .fetch_one(&self.pool)
        .await?;

        stats.total = summary.try_get("total")?;
        stats.never_calculated = summary.try_get::<Option<i64>, _>("never")?.unwrap_or(0);
        stats.last_calculated_at = summary.try_get("last_calc")?;

        let by_type = sqlx::query(
            "SELECT type AS key, COUNT(*) AS cnt FROM metric
             WHERE (? IS NULL OR entity = ?)
             GROUP BY type",
        )
        .bind(entity)
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;
        for row in &by_type {
            stats.by_type.insert(row.try_get("key")?, row.try_get("cnt")?);
        }

        let by_entity = sqlx::query(
            "SELECT COALESCE(entity, 'manual') AS key, COUNT(*) AS cnt FROM metric
             WHERE (? IS NULL OR entity = ?)
             GROUP BY COALESCE(entity, 'manual')",
        )
        .bind(entity)
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;
        for row in &by_entity {
            stats.by_entity.insert(row.try_get("key")?, row.try_get("cnt")?);
        }

        Ok(stats)
    }
}

async fn fetch_by_ref(
    conn: &mut SqliteConnection,
    metric: &MetricRef,
) -> Result<Option<MetricDefinition>> {
    let row = match metric {
        MetricRef::Id(id) => {
            sqlx::query(&format!("SELECT {COLUMNS} FROM metric WHERE id = ?"))
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await?
        }
        MetricRef::Name(name) => {
            sqlx::query(&format!("SELECT {COLUMNS} FROM metric WHERE name = ?"))
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?
        }
    };
    row.as_ref().map(row_to_metric).transpose()
}

fn row_to_metric(row: &SqliteRow) -> Result<MetricDefinition> {
    let config: Option<String> = row.try_get("calculation_config")?;
    let calculation_config = match config {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            MetricsError::invalid_config(format!("stored calculation_config is invalid: {}", e))
        })?),
        None => None,
    };

    Ok(MetricDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        entity: row.try_get("entity")?,
        metric_type: row.try_get("type")?,
        value: row.try_get("value")?,
        calculation_config,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_calculated_at: row.try_get("last_calculated_at")?,
    })
}

fn encode_config(config: Option<&CalculationConfig>) -> Result<Option<String>> {
    config
        .map(|c| {
            serde_json::to_string(c).map_err(|e| {
                MetricsError::invalid_config(format!("calculation_config is not serialisable: {}", e))
            })
        })
        .transpose()
}

fn duplicate_or_storage(err: sqlx::Error, name: &str) -> MetricsError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => MetricsError::DuplicateName {
            name: name.to_string(),
        },
        _ => MetricsError::Storage(err),
    }
}
