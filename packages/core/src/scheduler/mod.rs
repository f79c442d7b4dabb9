//! Recurring metric recalculation.
//!
//! [`MetricScheduler`] owns a table of jobs, each a [`Trigger`] plus an
//! optional entity scope. A single trigger loop checks the table every
//! tick and spawns a task per due job. A job is never run twice at once:
//! a firing that arrives while the previous run is still going is dropped
//! and counted as coalesced. Firings that come later than the misfire
//! grace period behind their due time are skipped.
//!
//! Only one process should run jobs against a database. Callers take a
//! [`SchedulerLock`] first and hand it to the scheduler, which releases it
//! on [`shutdown`](MetricScheduler::shutdown).

pub mod cron;
pub mod job;
pub mod lock;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::metrics::{BatchReport, MetricService, MetricsError, Result};
use crate::telemetry::AppMetrics;

pub use cron::CronSchedule;
pub use job::{
    default_jobs, FireOutcome, JobInfo, JobOutcome, JobSpec, SchedulerSettings, SchedulerStatus,
    Trigger,
};
pub use lock::SchedulerLock;

/// The work a job performs when it fires.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, entity: Option<&str>) -> Result<BatchReport>;
}

#[async_trait]
impl JobRunner for MetricService {
    async fn run(&self, entity: Option<&str>) -> Result<BatchReport> {
        self.calculate_all_metrics(entity).await
    }
}

struct JobEntry {
    name: String,
    entity: Option<String>,
    trigger: Trigger,
    /// `None` once the trigger has no future firing.
    next_due: Option<Instant>,
    run_count: u64,
    coalesced_count: u64,
    last_outcome: Option<JobOutcome>,
    /// Identifies this registration so runs of a removed job do not
    /// update a later job with the same id.
    generation: u64,
}

impl JobEntry {
    fn info(&self, id: &str, running: bool) -> JobInfo {
        JobInfo {
            id: id.to_string(),
            name: self.name.clone(),
            entity: self.entity.clone(),
            next_run_time: self.next_due.map(job::wall_time),
            trigger: self.trigger.to_string(),
            running,
            run_count: self.run_count,
            coalesced_count: self.coalesced_count,
            last_outcome: self.last_outcome.clone(),
        }
    }
}

#[derive(Default)]
struct JobTable {
    entries: HashMap<String, JobEntry>,
    /// Ids with a run in progress. Outlives the entry, so removing and
    /// re-adding a job cannot start a second run beside the first.
    active: HashSet<String>,
}

impl JobTable {
    fn info(&self, id: &str) -> Option<JobInfo> {
        self.entries
            .get(id)
            .map(|entry| entry.info(id, self.active.contains(id)))
    }
}

/// A spawned run. The body is a separate task and has to be aborted on
/// its own.
struct RunHandle {
    task: JoinHandle<()>,
    body: AbortHandle,
}

struct Inner {
    runner: Arc<dyn JobRunner>,
    settings: SchedulerSettings,
    telemetry: Option<Arc<AppMetrics>>,
    jobs: Mutex<JobTable>,
    in_flight: Mutex<Vec<RunHandle>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    lock: Mutex<Option<SchedulerLock>>,
    generations: AtomicU64,
}

/// Handle to the scheduler. Cheap to clone; all clones share one job table.
#[derive(Clone)]
pub struct MetricScheduler {
    inner: Arc<Inner>,
}

/// Recover the guard even if a job task panicked while holding it. The
/// table holds plain bookkeeping that stays consistent between statements.
fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricScheduler {
    pub fn new(runner: Arc<dyn JobRunner>, settings: SchedulerSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                runner,
                settings,
                telemetry: None,
                jobs: Mutex::new(JobTable::default()),
                in_flight: Mutex::new(Vec::new()),
                loop_handle: Mutex::new(None),
                shutdown_tx,
                lock: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a telemetry registry. Must be called before the handle is cloned.
    pub fn with_telemetry(mut self, telemetry: Arc<AppMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.telemetry = Some(telemetry);
        }
        self
    }

    /// Hold `lock` until shutdown.
    pub fn with_lock(self, lock: SchedulerLock) -> Self {
        *guard(&self.inner.lock) = Some(lock);
        self
    }

    /// Register a job, replacing any job with the same id. A replaced job
    /// keeps its run history.
    pub fn add_job(&self, spec: JobSpec) -> Result<JobInfo> {
        if spec.id.trim().is_empty() {
            return Err(MetricsError::invalid_trigger("job id must not be empty"));
        }
        let trigger = Trigger::from_parts(spec.cron.as_deref(), spec.interval_minutes)?;
        let next_due = trigger.first_due(Instant::now());

        let mut table = guard(&self.inner.jobs);
        let mut entry = JobEntry {
            name: spec.display_name(),
            entity: spec.entity.clone(),
            trigger,
            next_due,
            run_count: 0,
            coalesced_count: 0,
            last_outcome: None,
            generation: self.inner.generations.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(previous) = table.entries.remove(&spec.id) {
            entry.run_count = previous.run_count;
            entry.coalesced_count = previous.coalesced_count;
            entry.last_outcome = previous.last_outcome;
            entry.generation = previous.generation;
            tracing::info!(job = %spec.id, "replacing scheduled job");
        }

        let info = entry.info(&spec.id, table.active.contains(&spec.id));
        table.entries.insert(spec.id.clone(), entry);
        self.inner.set_job_gauge(table.entries.len());

        tracing::info!(
            job = %info.id,
            trigger = %info.trigger,
            entity = info.entity.as_deref().unwrap_or("all"),
            "job scheduled"
        );
        Ok(info)
    }

    /// Stop future firings of `id`. A run already in progress finishes.
    pub fn remove_job(&self, id: &str) -> Result<()> {
        let mut table = guard(&self.inner.jobs);
        if table.entries.remove(id).is_none() {
            tracing::warn!(job = %id, "job not found for removal");
            return Err(MetricsError::not_found(format!("Job {}", id)));
        }
        self.inner.set_job_gauge(table.entries.len());
        tracing::info!(job = %id, "job removed");
        Ok(())
    }

    /// Registered jobs ordered by id.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let table = guard(&self.inner.jobs);
        let mut infos: Vec<JobInfo> = table
            .entries
            .iter()
            .map(|(id, entry)| entry.info(id, table.active.contains(id)))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn job(&self, id: &str) -> Option<JobInfo> {
        guard(&self.inner.jobs).info(id)
    }

    /// Register the default recalculation jobs.
    pub fn install_default_jobs(&self) -> Result<()> {
        for spec in default_jobs() {
            self.add_job(spec)?;
        }
        Ok(())
    }

    /// Fire `id` right away, outside its schedule. Single-flight still
    /// applies. The job's next scheduled time is left alone.
    pub fn run_job_now(&self, id: &str) -> Result<FireOutcome> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(MetricsError::SchedulerUnavailable);
        }

        let mut table = guard(&self.inner.jobs);
        let JobTable { entries, active } = &mut *table;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| MetricsError::not_found(format!("Job {}", id)))?;

        if active.contains(id) {
            entry.coalesced_count += 1;
            self.inner.count_coalesced(id);
            return Ok(FireOutcome::Coalesced);
        }

        active.insert(id.to_string());
        let run = (id.to_string(), entry.entity.clone(), entry.generation);
        drop(table);

        self.inner.spawn_run(run);
        Ok(FireOutcome::Started)
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = guard(&self.inner.loop_handle).is_some() && !*self.inner.shutdown_tx.borrow();
        SchedulerStatus {
            running,
            jobs_count: guard(&self.inner.jobs).entries.len(),
            current_time: Utc::now(),
        }
    }

    /// Start the trigger loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut handle = guard(&self.inner.loop_handle);
        if handle.is_some() || *self.inner.shutdown_tx.borrow() {
            return;
        }

        let inner = self.inner.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(run_trigger_loop(inner, shutdown_rx)));
        tracing::info!(
            tick_ms = self.inner.settings.tick.as_millis() as u64,
            "scheduler started"
        );
    }

    /// Stop the trigger loop and wait up to `grace` for running jobs.
    /// Runs still going after that are aborted. Releases the lock.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown_tx.send_replace(true);

        let loop_handle = guard(&self.inner.loop_handle).take();
        if let Some(handle) = loop_handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler loop ended abnormally");
            }
        }

        let runs = std::mem::take(&mut *guard(&self.inner.in_flight));
        let pending = runs.iter().filter(|r| !r.task.is_finished()).count();
        if pending > 0 {
            tracing::info!(pending, "waiting for running jobs");
        }

        let mut abort_handles = Vec::with_capacity(runs.len() * 2);
        let mut tasks = Vec::with_capacity(runs.len());
        for run in runs {
            abort_handles.push(run.body);
            abort_handles.push(run.task.abort_handle());
            tasks.push(run.task);
        }
        let drained = time::timeout(grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("running jobs did not finish within the grace period; abandoning them");
            for handle in abort_handles {
                handle.abort();
            }
        }

        if let Some(lock) = guard(&self.inner.lock).take() {
            tracing::info!(path = %lock.path().display(), "releasing scheduler lock");
        }
        tracing::info!("scheduler stopped");
    }

    /// Run every job due at `now`. Exposed to tests to drive the table
    /// without the loop.
    pub(crate) fn fire_due(&self, now: Instant) -> usize {
        self.inner.fire_due(now)
    }
}

impl Inner {
    fn set_job_gauge(&self, count: usize) {
        if let Some(t) = &self.telemetry {
            t.scheduled_jobs.set(count as f64);
        }
    }

    fn count_coalesced(&self, id: &str) {
        tracing::info!(job = %id, "job still running; firing coalesced");
        if let Some(t) = &self.telemetry {
            t.coalesced_firings_total.inc();
        }
    }

    fn fire_due(self: &Arc<Self>, now: Instant) -> usize {
        let mut to_start = Vec::new();
        {
            let mut table = guard(&self.jobs);
            let JobTable { entries, active } = &mut *table;
            for (id, entry) in entries.iter_mut() {
                let Some(due) = entry.next_due else { continue };
                if due > now {
                    continue;
                }
                entry.next_due = entry.trigger.next_due(due, now);

                let late = now.duration_since(due);
                if late > self.settings.misfire_grace {
                    tracing::warn!(
                        job = %id,
                        late_secs = late.as_secs(),
                        "job missed its run time; skipping"
                    );
                    if let Some(t) = &self.telemetry {
                        t.misfires_total.inc();
                    }
                    continue;
                }

                if active.contains(id) {
                    entry.coalesced_count += 1;
                    self.count_coalesced(id);
                    continue;
                }

                active.insert(id.clone());
                to_start.push((id.clone(), entry.entity.clone(), entry.generation));
            }
        }

        let started = to_start.len();
        for run in to_start {
            self.spawn_run(run);
        }
        started
    }

    fn spawn_run(self: &Arc<Self>, (id, entity, generation): (String, Option<String>, u64)) {
        let runner = self.runner.clone();
        // The body runs on its own task so a panic surfaces as a
        // JoinError instead of unwinding through the bookkeeping.
        let body = tokio::spawn(async move { runner.run(entity.as_deref()).await });
        let body_abort = body.abort_handle();

        let inner = self.clone();
        let task = tokio::spawn(async move {
            tracing::info!(job = %id, "job started");
            let outcome = match body.await {
                Ok(Ok(report)) => JobOutcome::Succeeded {
                    updated: report.updated_count(),
                    failed: report.failed_count(),
                },
                Ok(Err(e)) => {
                    tracing::error!(job = %id, error = %e, "job failed");
                    JobOutcome::Failed { error: e.public_message() }
                }
                Err(e) => {
                    tracing::error!(job = %id, error = %e, "job panicked");
                    JobOutcome::Failed { error: "job panicked".to_string() }
                }
            };
            inner.finish_run(&id, generation, outcome);
        });

        let mut in_flight = guard(&self.in_flight);
        in_flight.retain(|r| !r.task.is_finished());
        in_flight.push(RunHandle {
            task,
            body: body_abort,
        });
    }

    fn finish_run(&self, id: &str, generation: u64, outcome: JobOutcome) {
        if let Some(t) = &self.telemetry {
            t.job_runs_total.with_label_values(&[id, outcome.label()]).inc();
        }

        let mut table = guard(&self.jobs);
        table.active.remove(id);
        match table.entries.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.run_count += 1;
                tracing::info!(job = %id, outcome = outcome.label(), runs = entry.run_count, "job finished");
                entry.last_outcome = Some(outcome);
            }
            _ => tracing::debug!(job = %id, "finished run of a removed job"),
        }
    }
}

async fn run_trigger_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = time::interval(inner.settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.fire_due(Instant::now());
            }

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("shutdown requested; stopping trigger loop");
                    break;
                }
            }
        }
    }
}
