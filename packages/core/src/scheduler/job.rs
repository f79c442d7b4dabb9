//! Job descriptions, triggers and the views the scheduler reports.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::metrics::{MetricsError, Result};
use crate::scheduler::cron::CronSchedule;

/// When a job fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Interval(Duration),
    Cron(CronSchedule),
}

impl Trigger {
    /// Build a trigger from exactly one of a cron expression or an interval.
    pub fn from_parts(cron: Option<&str>, interval_minutes: Option<u64>) -> Result<Self> {
        match (cron, interval_minutes) {
            (Some(_), Some(_)) => Err(MetricsError::invalid_trigger(
                "give either cron or interval_minutes, not both",
            )),
            (None, None) => Err(MetricsError::invalid_trigger(
                "either cron or interval_minutes must be given",
            )),
            (None, Some(0)) => Err(MetricsError::invalid_trigger(
                "interval_minutes must be positive",
            )),
            (None, Some(minutes)) => Ok(Trigger::Interval(Duration::from_secs(minutes * 60))),
            (Some(expr), None) => Ok(Trigger::Cron(expr.parse()?)),
        }
    }

    /// First due time for a job registered at `now`.
    pub(crate) fn first_due(&self, now: Instant) -> Option<Instant> {
        match self {
            Trigger::Interval(every) => Some(now + *every),
            Trigger::Cron(cron) => cron.next_after(Utc::now()).map(instant_at),
        }
    }

    /// Next due time after a firing that was due at `previous`. Interval
    /// jobs stay aligned to their original phase, skipping any slots that
    /// already passed.
    pub(crate) fn next_due(&self, previous: Instant, now: Instant) -> Option<Instant> {
        match self {
            Trigger::Interval(every) => {
                let behind = now.saturating_duration_since(previous);
                let slots = behind.as_nanos() / every.as_nanos() + 1;
                let slots = u32::try_from(slots).unwrap_or(u32::MAX);
                Some(previous + every.saturating_mul(slots))
            }
            Trigger::Cron(cron) => cron.next_after(Utc::now()).map(instant_at),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(every) => write!(f, "interval[{}m]", every.as_secs() / 60),
            Trigger::Cron(cron) => write!(f, "cron[{}]", cron),
        }
    }
}

/// Map a wall-clock time onto the runtime clock. Past times map to now.
pub(crate) fn instant_at(at: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    match (at - Utc::now()).to_std() {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}

/// Map a runtime instant back onto the wall clock.
pub(crate) fn wall_time(at: Instant) -> DateTime<Utc> {
    let now = Instant::now();
    let wall = Utc::now();
    if at >= now {
        chrono::Duration::from_std(at - now)
            .map(|ahead| wall + ahead)
            .unwrap_or(wall)
    } else {
        chrono::Duration::from_std(now - at)
            .map(|behind| wall - behind)
            .unwrap_or(wall)
    }
}

/// Registration request for a recurring recalculation job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Entity whose metrics are recalculated; `None` means all of them.
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_minutes: Option<u64>,
}

impl JobSpec {
    pub fn interval(id: impl Into<String>, entity: Option<&str>, minutes: u64) -> Self {
        Self {
            id: id.into(),
            name: None,
            entity: entity.map(str::to_string),
            cron: None,
            interval_minutes: Some(minutes),
        }
    }

    pub fn cron(id: impl Into<String>, entity: Option<&str>, expression: &str) -> Self {
        Self {
            id: id.into(),
            name: None,
            entity: entity.map(str::to_string),
            cron: Some(expression.to_string()),
            interval_minutes: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Custom metric job: {}", self.id))
    }
}

/// The recurring jobs a fresh deployment starts with.
pub fn default_jobs() -> Vec<JobSpec> {
    vec![
        JobSpec::interval("all_metrics_5min", None, 5)
            .named("Calculate all metrics every 5 minutes"),
        JobSpec::cron("driver_metrics_hourly", Some("drivers"), "1 * * * *")
            .named("Calculate driver metrics hourly"),
        JobSpec::cron("truck_metrics_daily", Some("trucks"), "0 2 * * *")
            .named("Calculate truck metrics daily"),
        JobSpec::interval("job_metrics_30min", Some("jobs"), 30)
            .named("Calculate job metrics every 30 minutes"),
        JobSpec::cron("maintenance_metrics_daily", Some("maintenance"), "0 3 * * *")
            .named("Calculate maintenance metrics daily"),
    ]
}

/// Result of the most recent completed run of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { updated: usize, failed: usize },
    Failed { error: String },
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded { .. } => "succeeded",
            JobOutcome::Failed { .. } => "failed",
        }
    }
}

/// What happened to a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireOutcome {
    Started,
    /// The job was still running; the firing was dropped.
    Coalesced,
}

/// Snapshot of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub entity: Option<String>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger: String,
    pub running: bool,
    pub run_count: u64,
    pub coalesced_count: u64,
    pub last_outcome: Option<JobOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs_count: usize,
    pub current_time: DateTime<Utc>,
}

/// Tuning for the trigger loop.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// How often due jobs are checked.
    pub tick: Duration,
    /// Firings later than this behind their due time are skipped.
    pub misfire_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            misfire_grace: Duration::from_secs(60),
        }
    }
}
