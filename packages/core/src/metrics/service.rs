//! Orchestration over the calculator and the metric store.
//!
//! Calculation never writes; the service pairs each calculation with one
//! atomic `record_value` so a failed calculation leaves the stored value
//! untouched.

use std::sync::Arc;

use tracing::{info, warn};

use crate::metrics::{
    BatchReport, MetricCalculator, MetricDefinition, MetricRef, MetricUpdate, MetricsError,
    NewMetric, Result,
};
use crate::repository::MetricRepository;
use crate::telemetry::AppMetrics;

#[derive(Clone)]
pub struct MetricService {
    repository: Arc<MetricRepository>,
    calculator: MetricCalculator,
    telemetry: Option<Arc<AppMetrics>>,
}

impl MetricService {
    pub fn new(repository: Arc<MetricRepository>, calculator: MetricCalculator) -> Self {
        Self {
            repository,
            calculator,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<AppMetrics>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn repository(&self) -> &MetricRepository {
        &self.repository
    }

    /// Calculate `definition` and persist the result.
    pub async fn recalculate(&self, definition: &MetricDefinition) -> Result<MetricDefinition> {
        if let Some(t) = &self.telemetry {
            t.calculations_total.inc();
        }
        let outcome = match self.calculator.calculate(definition).await {
            Ok(value) => self.repository.record_value(definition.id, value).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            if let Some(t) = &self.telemetry {
                t.calculation_errors_total.inc();
            }
        }
        outcome
    }

    /// Look a metric up by id or name, calculate it and store the value.
    pub async fn calculate_metric(&self, metric: &MetricRef) -> Result<MetricDefinition> {
        let definition = self.repository.get(metric).await?;
        self.recalculate(&definition).await
    }

    /// Recalculate every metric bound to an entity, optionally only those of
    /// `entity`. One failing metric never stops the others.
    pub async fn calculate_all_metrics(&self, entity: Option<&str>) -> Result<BatchReport> {
        if let Some(entity) = entity {
            self.repository.registry().ensure_known(entity)?;
        }

        let definitions = self.repository.list_calculable(entity).await?;
        let mut report = BatchReport::default();
        for definition in &definitions {
            match self.recalculate(definition).await {
                Ok(updated) => report.updated.push(updated),
                Err(e) => {
                    warn!(metric = %definition.name, error = %e, "metric calculation failed");
                    report.record_failure(definition.name.clone(), &e);
                }
            }
        }

        info!(
            entity = entity.unwrap_or("all"),
            updated = report.updated_count(),
            failed = report.failed_count(),
            "metric recalculation finished"
        );
        Ok(report)
    }

    /// Calculate the given metrics, each addressed by id or name.
    pub async fn calculate_batch(&self, identifiers: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for identifier in identifiers {
            match self.calculate_metric(&MetricRef::parse(identifier)).await {
                Ok(updated) => report.updated.push(updated),
                Err(e) => {
                    warn!(%identifier, error = %e, "batch calculation failed");
                    report.record_failure(identifier.clone(), &e);
                }
            }
        }
        report
    }

    /// Create several metrics. Each is inserted on its own, so one bad
    /// definition only fails itself.
    pub async fn bulk_create(&self, metrics: &[NewMetric]) -> BatchReport {
        let mut report = BatchReport::default();
        for metric in metrics {
            match self.repository.add(metric).await {
                Ok(created) => report.updated.push(created),
                Err(e) => report.record_failure(metric.name.clone(), &e),
            }
        }
        report
    }

    /// Apply a partial update, then recalculate when asked to and the
    /// metric is bound to an entity.
    ///
    /// Updating a missing metric by name creates it when the update carries
    /// a type. Missing ids stay `NotFound`.
    pub async fn update_metric(
        &self,
        metric: &MetricRef,
        update: &MetricUpdate,
        recalculate: bool,
    ) -> Result<MetricDefinition> {
        let updated = match self.repository.update(metric, update).await {
            Err(MetricsError::NotFound { .. }) => self.materialize(metric, update).await?,
            other => other?,
        };
        if recalculate && updated.entity.is_some() {
            return self.recalculate(&updated).await;
        }
        Ok(updated)
    }

    async fn materialize(
        &self,
        metric: &MetricRef,
        update: &MetricUpdate,
    ) -> Result<MetricDefinition> {
        let (MetricRef::Name(name), Some(metric_type)) = (metric, update.metric_type.as_deref())
        else {
            return Err(MetricsError::not_found(metric.to_string()));
        };

        let created = self
            .repository
            .get_or_create(
                name,
                update.entity.as_deref(),
                metric_type,
                update.calculation_config.clone(),
            )
            .await?;
        info!(metric = %name, id = created.id, "metric created on update");
        match update.value {
            Some(_) => self.repository.update(&MetricRef::Id(created.id), update).await,
            None => Ok(created),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::SqlitePool;

    use crate::db::create_pool;
    use crate::metrics::registry::{SqliteEntity, TRUCK_COLUMNS};
    use crate::metrics::{CalculationConfig, EntityRegistry, FilterClause, MetricValue};

    async fn make_service() -> (MetricService, SqlitePool, Arc<AppMetrics>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let registry = Arc::new(EntityRegistry::fleet(&pool));
        let repository = Arc::new(MetricRepository::new(pool.clone(), registry.clone()));
        let calculator =
            MetricCalculator::new(registry).with_raw_queries(Arc::new(pool.clone()));
        let telemetry = Arc::new(AppMetrics::new().unwrap());
        let service = MetricService::new(repository, calculator).with_telemetry(telemetry.clone());
        (service, pool, telemetry)
    }

    async fn seed_trucks(pool: &SqlitePool) {
        let trucks = SqliteEntity::new(pool.clone(), "trucks", TRUCK_COLUMNS);
        for (i, (status, mileage)) in [("active", 1000), ("active", 3000), ("maintenance", 500)]
            .into_iter()
            .enumerate()
        {
            trucks
                .insert(&json!({
                    "make": "Volvo",
                    "model": "VNL",
                    "year": 2021,
                    "vin": format!("VIN{i}"),
                    "plate": format!("PL-{i}"),
                    "status": status,
                    "mileage": mileage,
                }))
                .await
                .unwrap();
        }
    }

    fn metric(name: &str, entity: Option<&str>, metric_type: &str) -> NewMetric {
        NewMetric {
            name: name.to_string(),
            entity: entity.map(str::to_string),
            metric_type: metric_type.to_string(),
            value: 0.0,
            calculation_config: None,
        }
    }

    fn active_trucks() -> NewMetric {
        let mut m = metric("active_trucks", Some("trucks"), "count");
        m.calculation_config = Some(CalculationConfig {
            filters: vec![FilterClause::new("status", "eq", json!("active"))],
            ..Default::default()
        });
        m
    }

    #[tokio::test]
    async fn calculate_metric_persists_value_and_timestamp() {
        let (service, pool, telemetry) = make_service().await;
        seed_trucks(&pool).await;
        let created = service.repository().add(&active_trucks()).await.unwrap();

        let updated = service
            .calculate_metric(&MetricRef::Name("active_trucks".into()))
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.value, 2.0);
        assert!(updated.last_calculated_at.is_some());
        assert!((telemetry.calculations_total.get() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failed_calculation_leaves_stored_value_untouched() {
        let (service, _pool, telemetry) = make_service().await;
        let mut broken = metric("broken_sum", Some("trucks"), "sum");
        broken.value = 7.0;
        let created = service.repository().add(&broken).await.unwrap();

        let err = service.calculate_metric(&MetricRef::Id(created.id)).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidMetricConfig");

        let stored = service.repository().get(&MetricRef::Id(created.id)).await.unwrap();
        assert_eq!(stored.value, 7.0);
        assert!(stored.last_calculated_at.is_none());
        assert!((telemetry.calculation_errors_total.get() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn calculate_all_isolates_failures() {
        let (service, pool, _) = make_service().await;
        seed_trucks(&pool).await;
        let repo = service.repository();
        repo.add(&active_trucks()).await.unwrap();
        repo.add(&metric("broken_sum", Some("trucks"), "sum")).await.unwrap();
        repo.add(&metric("manual_kpi", None, "count")).await.unwrap();

        let report = service.calculate_all_metrics(None).await.unwrap();
        assert_eq!(report.updated_count(), 1);
        assert_eq!(report.updated[0].name, "active_trucks");
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.failed[0].identifier, "broken_sum");
        assert_eq!(report.failed[0].error, "InvalidMetricConfig");
    }

    #[tokio::test]
    async fn calculate_all_scopes_to_entity() {
        let (service, pool, _) = make_service().await;
        seed_trucks(&pool).await;
        let repo = service.repository();
        repo.add(&active_trucks()).await.unwrap();
        repo.add(&metric("driver_count", Some("drivers"), "count")).await.unwrap();

        let report = service.calculate_all_metrics(Some("drivers")).await.unwrap();
        assert_eq!(report.updated_count(), 1);
        assert_eq!(report.updated[0].name, "driver_count");
        assert_eq!(report.updated[0].value, 0.0);
    }

    #[tokio::test]
    async fn calculate_all_rejects_unknown_entity() {
        let (service, _, _) = make_service().await;
        let err = service.calculate_all_metrics(Some("boats")).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidEntity");
    }

    #[tokio::test]
    async fn calculate_batch_reports_missing_identifiers() {
        let (service, pool, _) = make_service().await;
        seed_trucks(&pool).await;
        let created = service.repository().add(&active_trucks()).await.unwrap();

        let report = service
            .calculate_batch(&[created.id.to_string(), "ghost".to_string()])
            .await;
        assert_eq!(report.updated_count(), 1);
        assert_eq!(report.failed[0].identifier, "ghost");
        assert_eq!(report.failed[0].error, "NotFound");
    }

    #[tokio::test]
    async fn bulk_create_keeps_good_definitions() {
        let (service, _, _) = make_service().await;
        let report = service
            .bulk_create(&[
                metric("a", Some("trucks"), "count"),
                metric("b", Some("boats"), "count"),
                metric("a", Some("trucks"), "count"),
            ])
            .await;
        assert_eq!(report.updated_count(), 1);
        let kinds: Vec<&str> = report.failed.iter().map(|f| f.error.as_str()).collect();
        assert_eq!(kinds, vec!["InvalidEntity", "DuplicateName"]);
    }

    #[tokio::test]
    async fn update_with_recalculate_refreshes_value() {
        let (service, pool, _) = make_service().await;
        seed_trucks(&pool).await;
        let created = service
            .repository()
            .add(&metric("fleet_mileage", Some("trucks"), "count"))
            .await
            .unwrap();

        let update = MetricUpdate {
            metric_type: Some("sum".into()),
            calculation_config: Some(CalculationConfig {
                field: Some("mileage".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let updated = service
            .update_metric(&MetricRef::Id(created.id), &update, true)
            .await
            .unwrap();
        assert_eq!(updated.metric_type, "sum");
        assert_eq!(updated.value, MetricValue::Float(4500.0).as_f64());

        let plain = service
            .update_metric(&MetricRef::Id(created.id), &MetricUpdate::default(), false)
            .await
            .unwrap();
        assert_eq!(plain.value, 4500.0);
    }

    #[tokio::test]
    async fn update_by_name_creates_missing_metric() {
        let (service, pool, _) = make_service().await;
        seed_trucks(&pool).await;

        let update = MetricUpdate {
            entity: Some("trucks".into()),
            metric_type: Some("count".into()),
            ..Default::default()
        };
        let created = service
            .update_metric(&MetricRef::Name("truck_total".into()), &update, true)
            .await
            .unwrap();
        assert_eq!(created.name, "truck_total");
        assert_eq!(created.value, 3.0);

        // A second update finds the row instead of inserting again.
        let again = service
            .update_metric(&MetricRef::Name("truck_total".into()), &update, false)
            .await
            .unwrap();
        assert_eq!(again.id, created.id);

        // Without a type there is nothing to create from.
        let err = service
            .update_metric(&MetricRef::Name("ghost".into()), &MetricUpdate::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        let err = service
            .update_metric(&MetricRef::Id(999), &update, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}
