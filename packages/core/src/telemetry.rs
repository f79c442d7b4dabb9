//! Prometheus metrics registry for the fleet metrics service.
//!
//! [`AppMetrics`] owns all registered collectors and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and pass it to
//! the metric service and the scheduler.
//!
//! Exposed at `GET /telemetry` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`). `/metrics` belongs to the metric
//! definitions API.

use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Metric calculations attempted (success + failure).
    pub calculations_total: Counter,
    /// Metric calculations that failed.
    pub calculation_errors_total: Counter,
    /// Completed scheduler job runs, labelled by job id and outcome.
    pub job_runs_total: CounterVec,
    /// Firings dropped because the job was still running.
    pub coalesced_firings_total: Counter,
    /// Firings dropped because they were past the misfire grace period.
    pub misfires_total: Counter,
    /// Jobs currently registered with the scheduler.
    pub scheduled_jobs: Gauge,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

impl AppMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let calculations_total = Counter::with_opts(Opts::new(
            "fleet_metrics_calculations_total",
            "Metric calculations attempted",
        ))?;

        let calculation_errors_total = Counter::with_opts(Opts::new(
            "fleet_metrics_calculation_errors_total",
            "Metric calculations that failed",
        ))?;

        let job_runs_total = CounterVec::new(
            Opts::new(
                "fleet_metrics_job_runs_total",
                "Scheduler job runs by job id and outcome",
            ),
            &["job", "outcome"],
        )?;

        let coalesced_firings_total = Counter::with_opts(Opts::new(
            "fleet_metrics_coalesced_firings_total",
            "Firings dropped while the job was still running",
        ))?;

        let misfires_total = Counter::with_opts(Opts::new(
            "fleet_metrics_misfires_total",
            "Firings dropped past the misfire grace period",
        ))?;

        let scheduled_jobs = Gauge::with_opts(Opts::new(
            "fleet_metrics_scheduled_jobs",
            "Jobs registered with the scheduler",
        ))?;

        registry.register(Box::new(calculations_total.clone()))?;
        registry.register(Box::new(calculation_errors_total.clone()))?;
        registry.register(Box::new(job_runs_total.clone()))?;
        registry.register(Box::new(coalesced_firings_total.clone()))?;
        registry.register(Box::new(misfires_total.clone()))?;
        registry.register(Box::new(scheduled_jobs.clone()))?;

        Ok(Self {
            calculations_total,
            calculation_errors_total,
            job_runs_total,
            coalesced_firings_total,
            misfires_total,
            scheduled_jobs,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register_without_error() {
        let metrics = AppMetrics::new();
        assert!(metrics.is_ok(), "AppMetrics::new() failed: {:?}", metrics.err());
    }

    #[test]
    fn render_includes_incremented_counters() {
        let metrics = AppMetrics::new().unwrap();
        metrics.calculations_total.inc_by(3.0);
        let output = metrics.render().unwrap();
        assert!(output.contains("fleet_metrics_calculations_total 3"));
    }

    #[test]
    fn job_runs_are_labelled_by_outcome() {
        let metrics = AppMetrics::new().unwrap();
        metrics
            .job_runs_total
            .with_label_values(&["all_metrics_5min", "succeeded"])
            .inc();
        let val = metrics
            .job_runs_total
            .with_label_values(&["all_metrics_5min", "succeeded"])
            .get();
        assert!((val - 1.0).abs() < f64::EPSILON);
        assert!(metrics.render().unwrap().contains("outcome=\"succeeded\""));
    }

    #[test]
    fn gauge_tracks_registered_jobs() {
        let metrics = AppMetrics::new().unwrap();
        metrics.scheduled_jobs.set(5.0);
        assert!((metrics.scheduled_jobs.get() - 5.0).abs() < f64::EPSILON);
    }
}
