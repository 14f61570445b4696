use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_cron_scheduler::{Job, JobScheduler as CronScheduler, JobSchedulerError};

use crate::{
    config::{SchedulerConfig, RUN_ALL_JOB_ID},
    crawl::{CrawlContext, Crawlable},
    db::{PersistedState, StateStore},
    domain::{
        cadence::{is_misfire, plan_catch_up},
        AlertEvent, AlertKind, Cadence, CrawlJobSpec, JobRunMetadata, JobStateRecord, RunResult,
        Tier,
    },
    infrastructure::notifier::Alerts,
};

/// Why a job was asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Cadence fire; `at` is the fire time the job was due.
    Scheduled { at: DateTime<Utc> },
    /// Coalesced run for fire times missed while the process was down.
    CatchUp,
    Recovery,
    Startup,
    Manual,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled { .. } => "scheduled",
            Trigger::CatchUp => "catch_up",
            Trigger::Recovery => "recovery",
            Trigger::Startup => "startup",
            Trigger::Manual => "manual",
        }
    }

    fn bypasses_pause(&self) -> bool {
        matches!(self, Trigger::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireOutcome {
    Started,
    /// The job is already running; this fire was dropped.
    Busy,
    /// The fire was older than the job's misfire grace and was discarded.
    Misfired,
    Paused,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerStatus::Stopped => "stopped",
            SchedulerStatus::Running => "running",
            SchedulerStatus::Stopping => "stopping",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub tier: Tier,
    pub cadence: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_runs: u64,
    pub paused: bool,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerInfo {
    pub status: SchedulerStatus,
    pub jobs: Vec<JobInfo>,
}

/// Outcome of one maintenance pass over the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub tracked_domains: usize,
    pub open_circuits: Vec<String>,
    pub failing_jobs: Vec<String>,
    pub opportunities: Option<usize>,
    pub issues: Vec<String>,
}

type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Tick = Arc<dyn Fn() -> TickFuture + Send + Sync>;

fn cadence_job(cadence: &Cadence, tick: Tick) -> Result<Job, JobSchedulerError> {
    match cadence {
        Cadence::Cron { expr, .. } => Job::new_async(expr.as_str(), move |_id, _l| tick()),
        Cadence::Every(interval) => Job::new_repeated_async(*interval, move |_id, _l| tick()),
    }
}

#[derive(Debug, Default)]
struct JobEntry {
    metadata: JobRunMetadata,
    next_run: Option<DateTime<Utc>>,
    paused: bool,
}

struct SchedulerCore {
    order: Vec<String>,
    specs: HashMap<String, CrawlJobSpec>,
    registry: HashMap<String, Arc<dyn Crawlable>>,
    ctx: Arc<CrawlContext>,
    state: Arc<dyn StateStore>,
    alerts: Alerts,
    config: SchedulerConfig,
    notify_on_success: bool,
    entries: RwLock<HashMap<String, JobEntry>>,
    running: Mutex<HashSet<String>>,
    idle: Notify,
    status: RwLock<SchedulerStatus>,
}

/// Drives crawl jobs on their cadences with single-instance execution,
/// durable run metadata, misfire handling and failure recovery.
pub struct JobScheduler {
    core: Arc<SchedulerCore>,
    cron: AsyncMutex<Option<CronScheduler>>,
}

impl JobScheduler {
    pub fn new(
        specs: Vec<CrawlJobSpec>,
        registry: HashMap<String, Arc<dyn Crawlable>>,
        ctx: Arc<CrawlContext>,
        state: Arc<dyn StateStore>,
        alerts: Alerts,
        config: SchedulerConfig,
        notify_on_success: bool,
    ) -> Self {
        let order = specs.iter().map(|spec| spec.id.clone()).collect();
        let entries = specs
            .iter()
            .map(|spec| (spec.id.clone(), JobEntry::default()))
            .collect();
        let specs = specs
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        Self {
            core: Arc::new(SchedulerCore {
                order,
                specs,
                registry,
                ctx,
                state,
                alerts,
                config,
                notify_on_success,
                entries: RwLock::new(entries),
                running: Mutex::new(HashSet::new()),
                idle: Notify::new(),
                status: RwLock::new(SchedulerStatus::Stopped),
            }),
            cron: AsyncMutex::new(None),
        }
    }

    /// Seeds run metadata from persisted rows. Rows for unknown jobs are ignored.
    pub fn restore(&self, state: &PersistedState) {
        let mut entries = self.core.entries.write();
        for row in &state.jobs {
            match entries.get_mut(&row.job_id) {
                Some(entry) => entry.metadata = row.metadata.clone(),
                None => tracing::debug!(
                    target: "scheduler",
                    job_id = %row.job_id,
                    "ignoring persisted state for unknown job"
                ),
            }
        }
    }

    /// Registers every cadence and the recovery job with the cron runtime and
    /// starts it.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.cron.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let cron = CronScheduler::new()
            .await
            .context("failed to create cron scheduler")?;
        let now = Utc::now();

        for id in &self.core.order {
            let Some(spec) = self.core.specs.get(id) else {
                continue;
            };
            let job = self.site_job(spec)?;
            cron.add(job)
                .await
                .with_context(|| format!("failed to register job {id}"))?;
            if let Some(entry) = self.core.entries.write().get_mut(id) {
                entry.next_run = spec.cadence.next_after(now);
            }
            tracing::info!(
                target: "scheduler",
                job_id = %id,
                tier = %spec.tier,
                cadence = %spec.cadence,
                "job registered"
            );
        }

        let core = self.core.clone();
        let recovery = Job::new_repeated_async(self.core.config.recovery_interval, move |_id, _l| {
            let core = core.clone();
            Box::pin(async move {
                core.recovery_tick();
            })
        })
        .context("failed to build recovery job")?;
        cron.add(recovery)
            .await
            .context("failed to register recovery job")?;
        cron.add(self.maintenance_job()?)
            .await
            .context("failed to register maintenance job")?;

        cron.start().await.context("failed to start cron scheduler")?;
        *slot = Some(cron);
        *self.core.status.write() = SchedulerStatus::Running;
        tracing::info!(
            target: "scheduler",
            jobs = self.core.order.len(),
            recovery_interval_secs = self.core.config.recovery_interval.as_secs(),
            "scheduler started"
        );
        Ok(())
    }

    fn site_job(&self, spec: &CrawlJobSpec) -> Result<Job> {
        let core = self.core.clone();
        let job_id = spec.id.clone();
        let tick: Tick = Arc::new(move || -> TickFuture {
            let core = core.clone();
            let job_id = job_id.clone();
            Box::pin(async move {
                core.scheduled_fire(&job_id);
            })
        });
        cadence_job(&spec.cadence, tick)
            .with_context(|| format!("invalid cadence for job {}", spec.id))
    }

    fn maintenance_job(&self) -> Result<Job> {
        let cadence: Cadence = self
            .core
            .config
            .maintenance
            .cron
            .parse()
            .context("invalid maintenance cadence")?;
        let core = self.core.clone();
        let tick: Tick = Arc::new(move || -> TickFuture {
            let core = core.clone();
            Box::pin(async move {
                core.maintenance_tick().await;
            })
        });
        cadence_job(&cadence, tick).context("failed to build maintenance job")
    }

    /// Collapses fire times missed while the process was down into at most one
    /// run per job.
    pub fn catch_up(&self, now: DateTime<Utc>) -> Vec<(String, FireOutcome)> {
        let mut fired = Vec::new();
        for id in &self.core.order {
            let Some(spec) = self.core.specs.get(id) else {
                continue;
            };
            let last_run = self
                .core
                .entries
                .read()
                .get(id)
                .and_then(|entry| entry.metadata.last_run);
            let plan = plan_catch_up(&spec.cadence, last_run, now, spec.misfire_grace);
            if plan.missed == 0 {
                continue;
            }
            if plan.run_now {
                tracing::info!(
                    target: "scheduler",
                    job_id = %id,
                    missed = plan.missed,
                    "coalescing missed runs into one catch-up run"
                );
                fired.push((id.clone(), self.core.fire(id, Trigger::CatchUp)));
            } else {
                tracing::info!(
                    target: "scheduler",
                    job_id = %id,
                    missed = plan.missed,
                    latest_missed = ?plan.latest_missed,
                    "missed runs are past the grace window; skipping"
                );
            }
        }
        fired
    }

    pub fn fire_startup_job(&self) -> Option<FireOutcome> {
        let id = self.core.config.startup_job.as_deref()?;
        let outcome = self.core.fire(id, Trigger::Startup);
        if outcome == FireOutcome::NotFound {
            tracing::warn!(target: "scheduler", job_id = %id, "startup job is not registered");
        }
        Some(outcome)
    }

    #[cfg(test)]
    pub fn fire(&self, job_id: &str, trigger: Trigger) -> FireOutcome {
        self.core.fire(job_id, trigger)
    }

    pub fn run_job_now(&self, job_id: &str) -> FireOutcome {
        self.core.fire(job_id, Trigger::Manual)
    }

    pub fn run_all_now(&self) -> FireOutcome {
        self.core.fire(RUN_ALL_JOB_ID, Trigger::Manual)
    }

    #[cfg(test)]
    pub fn recovery_tick(&self) -> Vec<(String, FireOutcome)> {
        self.core.recovery_tick()
    }

    /// Reviews circuits, failing jobs and the opportunity count; emits a
    /// `system_health` alert when any limit is crossed.
    pub async fn maintenance_tick(&self) -> MaintenanceReport {
        self.core.maintenance_tick().await
    }

    /// Returns false for unknown jobs.
    pub fn pause(&self, job_id: &str) -> bool {
        self.set_paused(job_id, true)
    }

    pub fn resume(&self, job_id: &str) -> bool {
        self.set_paused(job_id, false)
    }

    fn set_paused(&self, job_id: &str, paused: bool) -> bool {
        let mut entries = self.core.entries.write();
        let Some(entry) = entries.get_mut(job_id) else {
            return false;
        };
        entry.paused = paused;
        tracing::info!(target: "scheduler", job_id, paused, "job pause state changed");
        true
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.core.status.read()
    }

    pub fn info(&self) -> SchedulerInfo {
        let entries = self.core.entries.read();
        let running = self.core.running.lock().clone();
        let jobs = self
            .core
            .order
            .iter()
            .filter_map(|id| {
                let spec = self.core.specs.get(id)?;
                let entry = entries.get(id)?;
                let meta = &entry.metadata;
                Some(JobInfo {
                    id: id.clone(),
                    tier: spec.tier,
                    cadence: spec.cadence.to_string(),
                    next_run: entry.next_run,
                    last_run: meta.last_run,
                    last_success: meta.last_success,
                    last_failure: meta.last_failure,
                    last_error: meta.last_error.clone(),
                    consecutive_failures: meta.consecutive_failures,
                    total_runs: meta.total_runs,
                    paused: entry.paused,
                    running: running.contains(id),
                })
            })
            .collect();
        SchedulerInfo {
            status: self.status(),
            jobs,
        }
    }

    #[cfg(test)]
    pub fn metadata(&self, job_id: &str) -> Option<JobRunMetadata> {
        self.core
            .entries
            .read()
            .get(job_id)
            .map(|entry| entry.metadata.clone())
    }

    /// Job rows plus current site health, for a full snapshot.
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            jobs: self.core.job_records(),
            sites: self.core.ctx.health.snapshot().into_values().collect(),
        }
    }

    /// Waits until no job is running, up to `limit`. Returns false on timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.core.wait_idle())
            .await
            .is_ok()
    }

    /// Stops new fires, then gives in-flight runs a bounded time to finish.
    pub async fn shutdown(&self) {
        *self.core.status.write() = SchedulerStatus::Stopping;
        if let Some(mut cron) = self.cron.lock().await.take() {
            if let Err(err) = cron.shutdown().await {
                tracing::warn!(target: "scheduler", error = %err, "cron scheduler shutdown failed");
            }
        }
        if !self.wait_idle(self.core.config.shutdown_timeout).await {
            let running: Vec<String> = self.core.running.lock().iter().cloned().collect();
            tracing::warn!(target: "scheduler", ?running, "jobs still running at shutdown; abandoning");
        }
        *self.core.status.write() = SchedulerStatus::Stopped;
        tracing::info!(target: "scheduler", "scheduler stopped");
    }
}

impl SchedulerCore {
    fn scheduled_fire(self: &Arc<Self>, job_id: &str) {
        let now = Utc::now();
        let due = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(job_id) else {
                return;
            };
            let due = entry.next_run.unwrap_or(now);
            entry.next_run = self
                .specs
                .get(job_id)
                .and_then(|spec| spec.cadence.next_after(now));
            due
        };
        self.fire(job_id, Trigger::Scheduled { at: due });
    }

    fn fire(self: &Arc<Self>, job_id: &str, trigger: Trigger) -> FireOutcome {
        let (Some(spec), Some(crawl)) = (self.specs.get(job_id), self.registry.get(job_id)) else {
            return FireOutcome::NotFound;
        };

        let paused = self
            .entries
            .read()
            .get(job_id)
            .is_some_and(|entry| entry.paused);
        if paused && !trigger.bypasses_pause() {
            tracing::debug!(target: "scheduler", job_id, trigger = trigger.as_str(), "job paused; fire ignored");
            return FireOutcome::Paused;
        }

        if let Trigger::Scheduled { at } = trigger {
            let now = Utc::now();
            if is_misfire(at, now, spec.misfire_grace) {
                tracing::warn!(
                    target: "scheduler",
                    job_id,
                    due = %at,
                    grace_secs = spec.misfire_grace.as_secs(),
                    "fire is past its grace window; discarded"
                );
                return FireOutcome::Misfired;
            }
        }

        if !self.running.lock().insert(job_id.to_string()) {
            tracing::info!(
                target: "scheduler",
                job_id,
                trigger = trigger.as_str(),
                "job already running; fire dropped"
            );
            return FireOutcome::Busy;
        }

        let guard = RunningGuard {
            core: self.clone(),
            job_id: job_id.to_string(),
        };
        let core = self.clone();
        let crawl = crawl.clone();
        let job_id = job_id.to_string();
        tracing::info!(target: "scheduler", job_id = %job_id, trigger = trigger.as_str(), "job started");
        tokio::spawn(async move {
            let _guard = guard;
            let started_at = Utc::now();
            let ctx = core.ctx.clone();
            let result = match tokio::spawn(async move { crawl.run(&ctx).await }).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(target: "scheduler", job_id = %job_id, error = %err, "job crashed");
                    RunResult::failure(format!("job crashed: {err}"))
                }
            };
            core.complete(&job_id, started_at, Utc::now(), &result).await;
        });
        FireOutcome::Started
    }

    async fn complete(
        &self,
        job_id: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: &RunResult,
    ) {
        let error = (!result.success).then(|| {
            result
                .error
                .clone()
                .unwrap_or_else(|| "job failed".to_string())
        });

        let record = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(job_id) else {
                return;
            };
            if !entry.metadata.record(started_at, finished_at, error.as_deref()) {
                tracing::debug!(target: "scheduler", job_id, "completion already recorded");
                return;
            }
            JobStateRecord {
                job_id: job_id.to_string(),
                tier: self.specs.get(job_id).map(|s| s.tier).unwrap_or(Tier::System),
                metadata: entry.metadata.clone(),
            }
        };

        if let Err(err) = self.state.save_job(&record).await {
            tracing::warn!(
                target: "state",
                job_id,
                backend = self.state.name(),
                error = %err,
                "failed to persist job state; keeping in-memory copy"
            );
        }
        self.persist_health().await;

        let elapsed_ms = (finished_at - started_at).num_milliseconds();
        match error {
            Some(err) => {
                tracing::error!(
                    target: "scheduler",
                    job_id,
                    consecutive_failures = record.metadata.consecutive_failures,
                    elapsed_ms,
                    error = %err,
                    "job failed"
                );
                self.alerts.emit(
                    AlertEvent::new(AlertKind::SchedulerError)
                        .with("Job", job_id)
                        .with("Tier", record.tier)
                        .with("Error", &err)
                        .with("Consecutive failures", record.metadata.consecutive_failures),
                );
            }
            None => {
                tracing::info!(
                    target: "scheduler",
                    job_id,
                    found = result.opportunities_found,
                    skipped = result.skipped,
                    elapsed_ms,
                    "job succeeded"
                );
                if self.notify_on_success {
                    self.alerts.emit(
                        AlertEvent::new(AlertKind::ScraperSuccess)
                            .with("Job", job_id)
                            .with("Opportunities found", result.opportunities_found)
                            .with("Duration", format!("{:.1}s", elapsed_ms as f64 / 1_000.0)),
                    );
                }
            }
        }
    }

    async fn persist_health(&self) {
        let dirty = self.ctx.health.take_dirty();
        if dirty.is_empty() {
            return;
        }
        if let Err(err) = self.state.save_site_health(&dirty).await {
            tracing::warn!(
                target: "state",
                backend = self.state.name(),
                records = dirty.len(),
                error = %err,
                "failed to persist site health; will retry after the next run"
            );
            self.ctx
                .health
                .mark_dirty(dirty.iter().map(|record| record.domain.as_str()));
        }
    }

    fn recovery_tick(self: &Arc<Self>) -> Vec<(String, FireOutcome)> {
        let threshold = self.config.recovery_threshold.max(1);
        let failing: Vec<(String, u32)> = {
            let entries = self.entries.read();
            self.order
                .iter()
                .filter_map(|id| {
                    let entry = entries.get(id)?;
                    (entry.metadata.consecutive_failures >= threshold)
                        .then(|| (id.clone(), entry.metadata.consecutive_failures))
                })
                .collect()
        };

        failing
            .into_iter()
            .map(|(id, failures)| {
                let outcome = self.fire(&id, Trigger::Recovery);
                tracing::info!(
                    target: "scheduler",
                    job_id = %id,
                    consecutive_failures = failures,
                    outcome = ?outcome,
                    "recovery run requested"
                );
                (id, outcome)
            })
            .collect()
    }

    async fn maintenance_tick(&self) -> MaintenanceReport {
        let limits = &self.config.maintenance;
        let threshold = self.config.recovery_threshold.max(1);

        let health = self.ctx.health.snapshot();
        let open_circuits: Vec<String> = health
            .values()
            .filter(|record| record.circuit_open)
            .map(|record| record.domain.clone())
            .collect();
        let failing_jobs: Vec<String> = {
            let entries = self.entries.read();
            self.order
                .iter()
                .filter(|id| {
                    entries
                        .get(*id)
                        .is_some_and(|entry| entry.metadata.consecutive_failures >= threshold)
                })
                .cloned()
                .collect()
        };

        let mut issues = Vec::new();
        let opportunities = match self.ctx.store.count().await {
            Ok(count) => {
                if count < limits.min_opportunities {
                    issues.push(format!(
                        "opportunity count is low: {count} (threshold: {})",
                        limits.min_opportunities
                    ));
                }
                Some(count)
            }
            Err(err) => {
                issues.push(format!("opportunity store unavailable: {err}"));
                None
            }
        };
        if open_circuits.len() > limits.max_open_circuits {
            issues.push(format!(
                "{} circuits open (max {}): {}",
                open_circuits.len(),
                limits.max_open_circuits,
                open_circuits.join(", ")
            ));
        }
        if !failing_jobs.is_empty() {
            issues.push(format!("jobs failing repeatedly: {}", failing_jobs.join(", ")));
        }

        let report = MaintenanceReport {
            tracked_domains: health.len(),
            open_circuits,
            failing_jobs,
            opportunities,
            issues,
        };
        tracing::info!(
            target: "scheduler",
            tracked_domains = report.tracked_domains,
            open_circuits = report.open_circuits.len(),
            failing_jobs = report.failing_jobs.len(),
            opportunities = ?report.opportunities,
            issues = report.issues.len(),
            "maintenance check finished"
        );
        if !report.issues.is_empty() {
            self.alerts.emit(
                AlertEvent::new(AlertKind::SystemHealth)
                    .with("Issues", report.issues.join("; "))
                    .with("Open circuits", report.open_circuits.len())
                    .with("Failing jobs", report.failing_jobs.len())
                    .with(
                        "Opportunities",
                        report
                            .opportunities
                            .map_or_else(|| "unknown".to_string(), |count| count.to_string()),
                    )
                    .with("Tracked domains", report.tracked_domains),
            );
        }
        report
    }

    fn job_records(&self) -> Vec<JobStateRecord> {
        let entries = self.entries.read();
        self.order
            .iter()
            .filter_map(|id| {
                let entry = entries.get(id)?;
                Some(JobStateRecord {
                    job_id: id.clone(),
                    tier: self.specs.get(id)?.tier,
                    metadata: entry.metadata.clone(),
                })
            })
            .collect()
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.running.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Clears the job's running flag when its run task ends, panics included.
struct RunningGuard {
    core: Arc<SchedulerCore>,
    job_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.core.running.lock();
        running.remove(&self.job_id);
        if running.is_empty() {
            self.core.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        config::test_config,
        crawl::{
            build_registry,
            fetch::RawResponse,
            job::testing::{harness, harness_with_latency, listing_page, Harness},
        },
        db::{MemoryStateStore, OpportunityStore},
        domain::JobKind,
    };

    fn spec(id: &str, url: &str, cadence: &str) -> CrawlJobSpec {
        CrawlJobSpec {
            id: id.to_string(),
            tier: Tier::Free,
            kind: JobKind::Site,
            target_urls: vec![url.to_string()],
            cadence: cadence.parse().unwrap(),
            misfire_grace: Duration::from_secs(3_600),
        }
    }

    struct Setup {
        scheduler: JobScheduler,
        harness: Harness,
        state: Arc<MemoryStateStore>,
    }

    fn setup(specs: Vec<CrawlJobSpec>) -> Setup {
        setup_with(specs, harness())
    }

    fn setup_with(specs: Vec<CrawlJobSpec>, harness: Harness) -> Setup {
        setup_config(specs, harness, test_config().scheduler)
    }

    fn setup_config(specs: Vec<CrawlJobSpec>, harness: Harness, config: SchedulerConfig) -> Setup {
        let state = Arc::new(MemoryStateStore::default());
        let registry = build_registry(&specs);
        let scheduler = JobScheduler::new(
            specs,
            registry,
            harness.ctx.clone(),
            state.clone(),
            harness.alert_handle.clone(),
            config,
            false,
        );
        Setup {
            scheduler,
            harness,
            state,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<AlertEvent>) -> Vec<AlertEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn second_fire_while_running_is_dropped() {
        let s = setup_with(
            vec![spec("free_social", "https://social.example/", "@every 6h")],
            harness_with_latency(Duration::from_secs(5)),
        );
        s.harness.transport.script(
            "https://social.example/",
            vec![Ok(RawResponse {
                status: 200,
                body: listing_page("Open call", "/a"),
            })],
        );

        assert_eq!(s.scheduler.run_job_now("free_social"), FireOutcome::Started);
        assert_eq!(s.scheduler.run_job_now("free_social"), FireOutcome::Busy);
        assert!(s.scheduler.info().jobs[0].running);
        assert!(s.scheduler.wait_idle(Duration::from_secs(60)).await);

        assert_eq!(s.harness.transport.calls_for("https://social.example/"), 1);
        let meta = s.scheduler.metadata("free_social").unwrap();
        assert_eq!(meta.total_runs, 1);
        assert_eq!(meta.total_successes, 1);
        assert!(!s.scheduler.info().jobs[0].running);
    }

    #[tokio::test(start_paused = true)]
    async fn five_missed_fires_produce_one_catch_up_run() {
        let s = setup(vec![
            spec("special_residencies", "https://special.example/", "@every 1h"),
            spec("never_ran", "https://never.example/", "@every 1h"),
        ]);
        let now = Utc::now();
        let last_run = now - chrono::Duration::minutes(5 * 60 + 30);
        s.scheduler.restore(&PersistedState {
            jobs: vec![JobStateRecord {
                job_id: "special_residencies".to_string(),
                tier: Tier::Special,
                metadata: JobRunMetadata {
                    total_runs: 7,
                    last_run: Some(last_run),
                    ..Default::default()
                },
            }],
            sites: Vec::new(),
        });

        let fired = s.scheduler.catch_up(now);
        assert_eq!(
            fired,
            vec![("special_residencies".to_string(), FireOutcome::Started)]
        );
        assert!(s.scheduler.wait_idle(Duration::from_secs(60)).await);
        assert_eq!(s.scheduler.metadata("special_residencies").unwrap().total_runs, 8);
        assert_eq!(s.scheduler.metadata("never_ran").unwrap().total_runs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_reruns_jobs_with_three_consecutive_failures() {
        let s = setup(vec![
            spec("free_social", "https://social.example/", "@every 6h"),
            spec("premium_texas", "https://texas.example/", "0 0 11 * * Mon,Wed,Fri"),
        ]);
        s.scheduler.restore(&PersistedState {
            jobs: vec![JobStateRecord {
                job_id: "free_social".to_string(),
                tier: Tier::Free,
                metadata: JobRunMetadata {
                    consecutive_failures: 3,
                    total_runs: 3,
                    total_failures: 3,
                    ..Default::default()
                },
            }],
            sites: Vec::new(),
        });

        let fired = s.scheduler.recovery_tick();
        assert_eq!(fired, vec![("free_social".to_string(), FireOutcome::Started)]);
        assert!(s.scheduler.wait_idle(Duration::from_secs(60)).await);
        // still unreachable: the counter keeps growing
        assert_eq!(
            s.scheduler.metadata("free_social").unwrap().consecutive_failures,
            4
        );
        assert_eq!(s.harness.transport.calls_for("https://texas.example/"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_persisted_and_alerted() {
        let mut s = setup(vec![spec("other_oregon", "https://oregon.example/", "@every 1h")]);

        assert_eq!(s.scheduler.run_job_now("other_oregon"), FireOutcome::Started);
        assert!(s.scheduler.wait_idle(Duration::from_secs(60)).await);

        let persisted = s.state.load().await.unwrap();
        assert_eq!(persisted.jobs.len(), 1);
        assert_eq!(persisted.jobs[0].metadata.consecutive_failures, 1);
        assert_eq!(persisted.sites.len(), 1);
        assert_eq!(persisted.sites[0].domain, "oregon.example");

        let alerts = drain(&mut s.harness.alerts);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SchedulerError);
        assert_eq!(
            alerts[0].payload.get("Job").map(String::as_str),
            Some("other_oregon")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn paused_jobs_ignore_schedule_but_accept_manual_runs() {
        let s = setup(vec![spec("supporter_florida", "https://fl.example/", "@every 1h")]);
        assert!(s.scheduler.pause("supporter_florida"));
        assert!(!s.scheduler.pause("missing"));

        let now = Utc::now();
        assert_eq!(
            s.scheduler.fire("supporter_florida", Trigger::Scheduled { at: now }),
            FireOutcome::Paused
        );
        assert!(s.scheduler.recovery_tick().is_empty());
        assert_eq!(
            s.scheduler.run_job_now("supporter_florida"),
            FireOutcome::Started
        );
        assert!(s.scheduler.wait_idle(Duration::from_secs(60)).await);

        assert!(s.scheduler.resume("supporter_florida"));
        assert_eq!(
            s.scheduler.fire("supporter_florida", Trigger::Scheduled { at: now }),
            FireOutcome::Started
        );
        assert!(s.scheduler.info().jobs.iter().all(|j| !j.paused));
        assert!(s.scheduler.wait_idle(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_scheduled_fire_is_discarded() {
        let s = setup(vec![spec("premium_newyork", "https://ny.example/", "@every 1h")]);
        let due = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(
            s.scheduler.fire("premium_newyork", Trigger::Scheduled { at: due }),
            FireOutcome::Misfired
        );
        assert_eq!(s.scheduler.run_job_now("nope"), FireOutcome::NotFound);
        assert_eq!(s.harness.transport.calls.lock().len(), 0);
    }

    fn stored_candidate(url: &str) -> crate::domain::OpportunityCandidate {
        crate::domain::OpportunityCandidate {
            title: "Open call".to_string(),
            description: String::new(),
            url: url.to_string(),
            deadline: None,
            location: None,
            image_url: None,
            source_domain: "listings.example".to_string(),
            source_url: "https://listings.example/".to_string(),
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn maintenance_flags_low_inventory_and_failing_jobs() {
        let mut s = setup(vec![
            spec("free_social", "https://social.example/", "@every 6h"),
            spec("premium_texas", "https://texas.example/", "@every 1h"),
        ]);
        s.scheduler.restore(&PersistedState {
            jobs: vec![JobStateRecord {
                job_id: "premium_texas".to_string(),
                tier: Tier::Premium,
                metadata: JobRunMetadata {
                    consecutive_failures: 3,
                    ..Default::default()
                },
            }],
            sites: Vec::new(),
        });

        let report = s.scheduler.maintenance_tick().await;
        assert_eq!(report.opportunities, Some(0));
        assert_eq!(report.failing_jobs, vec!["premium_texas".to_string()]);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[0].starts_with("opportunity count is low: 0"));

        let alerts = drain(&mut s.harness.alerts);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SystemHealth);
        assert_eq!(
            alerts[0].payload.get("Failing jobs").map(String::as_str),
            Some("1")
        );
    }

    #[tokio::test]
    async fn maintenance_counts_open_circuits_against_the_limit() {
        let mut config = test_config().scheduler;
        config.maintenance.min_opportunities = 1;
        config.maintenance.max_open_circuits = 3;
        let mut s = setup_config(
            vec![spec("free_social", "https://social.example/", "@every 6h")],
            harness(),
            config,
        );
        s.harness
            .store
            .upsert(&stored_candidate("https://listings.example/grant"))
            .await
            .unwrap();
        for domain in ["a.example", "b.example", "c.example"] {
            for _ in 0..3 {
                s.harness.ctx.health.report_failure(domain, "refused");
            }
        }

        let report = s.scheduler.maintenance_tick().await;
        assert!(report.issues.is_empty(), "{:?}", report.issues);
        assert_eq!(report.open_circuits.len(), 3);
        assert!(drain(&mut s.harness.alerts)
            .iter()
            .all(|alert| alert.kind != AlertKind::SystemHealth));

        for _ in 0..3 {
            s.harness.ctx.health.report_failure("d.example", "refused");
        }
        let report = s.scheduler.maintenance_tick().await;
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].starts_with("4 circuits open (max 3)"));
        assert!(drain(&mut s.harness.alerts)
            .iter()
            .any(|alert| alert.kind == AlertKind::SystemHealth));
    }

    struct Exploding;

    #[async_trait]
    impl Crawlable for Exploding {
        fn id(&self) -> &str {
            "exploding"
        }

        async fn run(&self, _ctx: &CrawlContext) -> RunResult {
            panic!("selector blew up");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_is_recorded_as_failure() {
        let harness = harness();
        let specs = vec![
            spec("exploding", "https://boom.example/", "@every 1h"),
            spec("steady", "https://steady.example/", "@every 1h"),
        ];
        let mut registry = build_registry(&specs);
        registry.insert("exploding".to_string(), Arc::new(Exploding));
        let scheduler = JobScheduler::new(
            specs,
            registry,
            harness.ctx.clone(),
            Arc::new(MemoryStateStore::default()),
            harness.alert_handle.clone(),
            test_config().scheduler,
            false,
        );

        assert_eq!(scheduler.run_job_now("exploding"), FireOutcome::Started);
        assert!(scheduler.wait_idle(Duration::from_secs(60)).await);
        let meta = scheduler.metadata("exploding").unwrap();
        assert_eq!(meta.total_failures, 1);
        assert!(meta.last_error.unwrap().contains("crashed"));

        // the scheduler keeps working after a crash
        assert_eq!(scheduler.run_job_now("steady"), FireOutcome::Started);
        assert!(scheduler.wait_idle(Duration::from_secs(60)).await);
        assert_eq!(scheduler.metadata("steady").unwrap().total_runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_uses_the_composite_job() {
        let config = test_config();
        let specs = crate::config::load_job_specs(&config).unwrap();
        let s = setup(specs);
        assert_eq!(s.scheduler.run_all_now(), FireOutcome::Started);
        assert!(s.scheduler.wait_idle(Duration::from_secs(600)).await);

        let meta = s.scheduler.metadata(RUN_ALL_JOB_ID).unwrap();
        assert_eq!(meta.total_runs, 1);
        // every site is unreachable in the scripted network
        assert_eq!(meta.total_failures, 1);
        assert_eq!(s.scheduler.metadata("free_social").unwrap().total_runs, 0);
    }

    #[test]
    fn info_lists_jobs_in_registry_order() {
        let harness = harness();
        let specs = vec![
            spec("b", "https://b.example/", "@every 1h"),
            spec("a", "https://a.example/", "@every 2h"),
        ];
        let registry = build_registry(&specs);
        let scheduler = JobScheduler::new(
            specs,
            registry,
            harness.ctx.clone(),
            Arc::new(MemoryStateStore::default()),
            harness.alert_handle.clone(),
            test_config().scheduler,
            false,
        );
        let info = scheduler.info();
        assert_eq!(info.status, SchedulerStatus::Stopped);
        let ids: Vec<_> = info.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(info.jobs[1].cadence, "@every 7200s");
    }
}
