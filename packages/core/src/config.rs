use std::env;
use std::time::Duration;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api_port: u16,
    pub scheduler: SchedulerConfig,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub lock_path: String,
    pub tick: Duration,
    pub misfire_grace: Duration,
    pub shutdown_grace: Duration,
    pub default_jobs: bool,
}

const DEFAULT_API_PORT: u16 = 8000;
const DEFAULT_LOCK_PATH: &str = "scheduler.lock";
const DEFAULT_CORS_ORIGINS: &[&str] = &["http://localhost:3000", "http://localhost:5173"];

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool, String> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(format!("Invalid {}: {}", name, other)),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is required")?;

        let api_port = parse_var("API_PORT", DEFAULT_API_PORT)?;

        let tick_ms: u64 = parse_var("SCHEDULER_TICK_MS", 1000)?;
        if tick_ms == 0 {
            return Err("SCHEDULER_TICK_MS must be positive".to_string());
        }
        let misfire_grace_seconds: u64 = parse_var("MISFIRE_GRACE_SECONDS", 60)?;
        let shutdown_grace_seconds: u64 = parse_var("SHUTDOWN_GRACE_SECONDS", 30)?;

        let cors_origins = match env::var("CORS_ORIGINS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => DEFAULT_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
        };

        Ok(Self {
            database_url,
            api_port,
            scheduler: SchedulerConfig {
                enabled: true,
                lock_path: env::var("SCHEDULER_LOCK_PATH")
                    .unwrap_or_else(|_| DEFAULT_LOCK_PATH.to_string()),
                tick: Duration::from_millis(tick_ms),
                misfire_grace: Duration::from_secs(misfire_grace_seconds),
                shutdown_grace: Duration::from_secs(shutdown_grace_seconds),
                default_jobs: parse_bool("DEFAULT_JOBS_ENABLED", true)?,
            },
            cors_origins,
        })
    }

    /// Command-line flags win over the environment.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(url) = &cli.database_url {
            self.database_url = url.clone();
        }
        if let Some(port) = cli.port {
            self.api_port = port;
        }
        if let Some(path) = &cli.lock_path {
            self.scheduler.lock_path = path.clone();
        }
        if cli.no_scheduler {
            self.scheduler.enabled = false;
        }
        self
    }
}
