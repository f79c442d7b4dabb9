use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tokio::signal;

use fleet_metrics::api::{self, AppState};
use fleet_metrics::cli::Cli;
use fleet_metrics::config::Config;
use fleet_metrics::db;
use fleet_metrics::error::AppError;
use fleet_metrics::logging::init_logging;
use fleet_metrics::metrics::{EntityRegistry, MetricCalculator, MetricService};
use fleet_metrics::repository::MetricRepository;
use fleet_metrics::scheduler::{MetricScheduler, SchedulerLock, SchedulerSettings};
use fleet_metrics::telemetry::AppMetrics;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    if let Err(err) = run().await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = Config::from_env().map_err(AppError::Config)?.apply_cli(&cli);
    tracing::info!(
        port = config.api_port,
        scheduler = config.scheduler.enabled,
        "Service starting"
    );

    let pool = db::create_pool(&config.database_url).await?;
    let registry = Arc::new(EntityRegistry::fleet(&pool));
    let repository = Arc::new(MetricRepository::new(pool.clone(), registry.clone()));
    let calculator = MetricCalculator::new(registry).with_raw_queries(Arc::new(pool.clone()));
    let telemetry = Arc::new(
        AppMetrics::new().map_err(|e| AppError::Config(format!("telemetry: {}", e)))?,
    );
    let service = MetricService::new(repository, calculator).with_telemetry(telemetry.clone());

    let scheduler = if config.scheduler.enabled {
        start_scheduler(&config, &service, &telemetry)?
    } else {
        tracing::info!("Scheduler disabled by configuration");
        None
    };

    let state = AppState {
        service,
        scheduler: scheduler.clone(),
        telemetry,
    };
    let app = api::create_router(state, api::cors_layer(&config.cors_origins));

    let listener = TcpListener::bind(("0.0.0.0", config.api_port)).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown(config.scheduler.shutdown_grace).await;
    }
    tracing::info!("Service stopped cleanly");
    Ok(())
}

/// Take the scheduler lock and start the scheduler. Another process
/// holding the lock, or a lock file that cannot be opened, leaves this
/// process serving the API without a scheduler.
fn start_scheduler(
    config: &Config,
    service: &MetricService,
    telemetry: &Arc<AppMetrics>,
) -> Result<Option<MetricScheduler>, AppError> {
    let lock = match SchedulerLock::acquire(&config.scheduler.lock_path) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::info!(
                path = %config.scheduler.lock_path,
                "Scheduler already running in another process"
            );
            return Ok(None);
        }
        Err(e) => {
            tracing::error!(
                path = %config.scheduler.lock_path,
                error = %e,
                "Failed to take scheduler lock; running without a scheduler"
            );
            return Ok(None);
        }
    };

    let settings = SchedulerSettings {
        tick: config.scheduler.tick,
        misfire_grace: config.scheduler.misfire_grace,
    };
    let scheduler = MetricScheduler::new(Arc::new(service.clone()), settings)
        .with_telemetry(telemetry.clone())
        .with_lock(lock);

    if config.scheduler.default_jobs {
        scheduler
            .install_default_jobs()
            .map_err(|e| AppError::Config(e.to_string()))?;
    }
    scheduler.start();
    Ok(Some(scheduler))
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_metrics::config::SchedulerConfig;

    async fn service() -> MetricService {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        let registry = Arc::new(EntityRegistry::fleet(&pool));
        let repository = Arc::new(MetricRepository::new(pool.clone(), registry.clone()));
        MetricService::new(repository, MetricCalculator::new(registry))
    }

    fn config_with_lock(lock_path: String) -> Config {
        Config {
            database_url: "sqlite::memory:".into(),
            api_port: 0,
            scheduler: SchedulerConfig {
                enabled: true,
                lock_path,
                tick: Duration::from_secs(1),
                misfire_grace: Duration::from_secs(60),
                shutdown_grace: Duration::from_secs(1),
                default_jobs: true,
            },
            cors_origins: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unusable_lock_path_serves_without_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("scheduler.lock");
        let config = config_with_lock(path.display().to_string());
        let telemetry = Arc::new(AppMetrics::new().unwrap());

        let scheduler = start_scheduler(&config, &service().await, &telemetry).unwrap();
        assert!(scheduler.is_none());
    }

    #[tokio::test]
    async fn free_lock_starts_scheduler_with_default_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");
        let config = config_with_lock(path.display().to_string());
        let telemetry = Arc::new(AppMetrics::new().unwrap());

        let scheduler = start_scheduler(&config, &service().await, &telemetry)
            .unwrap()
            .unwrap();
        assert!(scheduler.status().running);
        assert_eq!(scheduler.status().jobs_count, 5);

        // A second process finds the lock taken.
        assert!(start_scheduler(&config, &service().await, &telemetry)
            .unwrap()
            .is_none());
        scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
