use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use tokio::time::timeout;

use crate::{
    admin,
    config::{load_job_specs, AppConfig, StateBackend},
    crawl::{
        build_registry, CrawlContext, Extractor, FetchClient, HealthTracker, ReqwestTransport,
        Transport,
    },
    db::{
        self, load_first_available, JsonStateStore, MemoryOpportunityStore, MemoryStateStore,
        SqliteStateStore, StateStore,
    },
    domain::{AlertEvent, AlertKind, SiteHealthRecord},
    infrastructure::{
        directories::ResolvedPaths,
        notifier::{AlertDispatcher, AlertSink, Alerts, LogAlertSink, WebhookAlertSink},
        shutdown::Shutdown,
    },
    tasks::{FireOutcome, JobScheduler, MaintenanceReport, SchedulerInfo, SchedulerStatus},
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns every long-lived component of the crawler and exposes the query and
/// trigger surface the admin API is built on.
pub struct CrawlEngine {
    config: Arc<AppConfig>,
    paths: ResolvedPaths,
    scheduler: JobScheduler,
    ctx: Arc<CrawlContext>,
    opportunities: Arc<MemoryOpportunityStore>,
    state: Arc<dyn StateStore>,
    snapshot: Arc<JsonStateStore>,
    sqlite: Option<SqliteStateStore>,
    alerts: Alerts,
    dispatcher: Option<AlertDispatcher>,
    shutdown: Shutdown,
}

impl CrawlEngine {
    pub async fn initialize(
        config: AppConfig,
        paths: ResolvedPaths,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>> {
        let sink: Arc<dyn AlertSink> = match &config.alerts.webhook_url {
            Some(url) => {
                let client = Client::builder()
                    .user_agent(format!("opportunity-crawler/{}", env!("CARGO_PKG_VERSION")))
                    .timeout(Duration::from_secs(10))
                    .build()?;
                Arc::new(WebhookAlertSink::new(client, url.clone(), &config.timezone))
            }
            None => Arc::new(LogAlertSink),
        };
        let (alerts, dispatcher) = Alerts::spawn(sink);

        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.fetch)?);
        let mut engine = Self::assemble(config, paths, transport, alerts, shutdown).await?;
        engine.dispatcher = Some(dispatcher);
        Ok(Arc::new(engine))
    }

    /// Wires the engine around an injected network and alert handle.
    pub async fn assemble(
        config: AppConfig,
        paths: ResolvedPaths,
        transport: Arc<dyn Transport>,
        alerts: Alerts,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let snapshot = Arc::new(JsonStateStore::new(&paths.state_json_path));
        let (state, sqlite): (Arc<dyn StateStore>, Option<SqliteStateStore>) =
            match config.state.backend {
                StateBackend::Sqlite => {
                    let pool = db::init_pool(&paths.state_db_path)
                        .await
                        .with_context(|| {
                            format!("failed to open {}", paths.state_db_path.display())
                        })?;
                    let store = SqliteStateStore::new(pool);
                    (Arc::new(store.clone()), Some(store))
                }
                StateBackend::Json => (snapshot.clone(), None),
                StateBackend::Memory => (Arc::new(MemoryStateStore::default()), None),
            };

        let mut sources: Vec<Arc<dyn StateStore>> = vec![state.clone()];
        if config.state.backend != StateBackend::Json {
            sources.push(snapshot.clone());
        }
        let persisted = load_first_available(&sources).await;

        let health = Arc::new(HealthTracker::new(&config.health, alerts.clone()));
        health.restore(persisted.sites.iter().cloned());

        let opportunities = Arc::new(MemoryOpportunityStore::new());
        match opportunities.load_snapshot(&paths.snapshot_path).await {
            Ok(count) if count > 0 => {
                tracing::info!(target: "lifecycle", count, "opportunity snapshot loaded")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(
                target: "lifecycle",
                error = %err,
                "ignoring unreadable opportunity snapshot"
            ),
        }

        let ctx = Arc::new(CrawlContext {
            fetch: Arc::new(FetchClient::new(transport, &config.fetch)),
            extractor: Arc::new(Extractor::new(&config.extract)),
            health,
            store: opportunities.clone(),
            crawl: config.crawl.clone(),
        });

        let specs = load_job_specs(&config)?;
        let registry = build_registry(&specs);
        let scheduler = JobScheduler::new(
            specs,
            registry,
            ctx.clone(),
            state.clone(),
            alerts.clone(),
            config.scheduler.clone(),
            config.alerts.notify_on_success,
        );
        scheduler.restore(&persisted);

        Ok(Self {
            config,
            paths,
            scheduler,
            ctx,
            opportunities,
            state,
            snapshot,
            sqlite,
            alerts,
            dispatcher: None,
            shutdown,
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut stop = self.shutdown.subscribe();

        if self.config.scheduler.enabled {
            let caught_up = self.scheduler.catch_up(Utc::now());
            self.scheduler.start().await?;
            if let Some(outcome) = self.scheduler.fire_startup_job() {
                tracing::info!(target: "lifecycle", ?outcome, "startup job fired");
            }
            tracing::info!(
                target: "lifecycle",
                catch_up_runs = caught_up.len(),
                "crawl scheduler running"
            );
        } else {
            tracing::warn!(target: "lifecycle", "scheduler disabled; only manual runs will execute");
        }

        let admin_task = match &self.config.admin.bind {
            Some(bind) => {
                let listener = tokio::net::TcpListener::bind(bind)
                    .await
                    .with_context(|| format!("failed to bind admin API on {bind}"))?;
                tracing::info!(target: "admin", bind = %bind, "admin API listening");
                let router = admin::router(self.clone());
                let admin_stop = self.shutdown.subscribe();
                Some(tokio::spawn(admin::serve(listener, router, admin_stop)))
            }
            None => None,
        };

        self.alerts.emit(
            AlertEvent::new(AlertKind::SystemHealth)
                .with("Status", "started")
                .with("Jobs", self.scheduler.info().jobs.len())
                .with("Tracked domains", self.ctx.health.snapshot().len()),
        );

        stop.notified().await;
        tracing::info!(target: "lifecycle", "shutting down");

        self.scheduler.shutdown().await;
        if let Some(task) = admin_task {
            match timeout(FLUSH_TIMEOUT, task).await {
                Ok(Ok(Err(err))) => tracing::warn!(target: "admin", error = %err, "admin API stopped with error"),
                Err(_) => tracing::warn!(target: "admin", "admin API did not stop in time"),
                _ => {}
            }
        }
        self.flush().await;
        tracing::info!(target: "lifecycle", "shutdown complete");
        Ok(())
    }

    /// Writes everything that must survive a restart. Failures are logged.
    async fn flush(&self) {
        let dirty = self.ctx.health.take_dirty();
        if let Err(err) = self.state.save_site_health(&dirty).await {
            tracing::warn!(target: "state", error = %err, "failed to persist site health");
        }

        let full = self.scheduler.persisted_state();
        match timeout(FLUSH_TIMEOUT, self.snapshot.save_all(&full)).await {
            Ok(Ok(())) => tracing::info!(
                target: "state",
                path = %self.snapshot.path().display(),
                jobs = full.jobs.len(),
                "state snapshot written"
            ),
            Ok(Err(err)) => tracing::warn!(target: "state", error = %err, "failed to write state snapshot"),
            Err(_) => tracing::warn!(target: "state", "state snapshot timed out"),
        }

        match self.opportunities.save_snapshot(&self.paths.snapshot_path).await {
            Ok(count) => tracing::info!(target: "lifecycle", count, "opportunity snapshot written"),
            Err(err) => tracing::warn!(target: "lifecycle", error = %err, "failed to write opportunity snapshot"),
        }

        if let Some(sqlite) = &self.sqlite {
            if timeout(FLUSH_TIMEOUT, sqlite.close()).await.is_err() {
                tracing::warn!(target: "state", "sqlite pool did not close in time");
            }
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.drain(FLUSH_TIMEOUT).await;
        }
    }

    pub fn site_health(&self) -> BTreeMap<String, SiteHealthRecord> {
        self.ctx.health.snapshot()
    }

    pub fn site_health_for(&self, domain: &str) -> Option<SiteHealthRecord> {
        self.ctx.health.get(&domain.to_ascii_lowercase())
    }

    pub fn fetch_slots(&self) -> usize {
        self.ctx.fetch.available_slots()
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.scheduler.maintenance_tick().await
    }

    pub fn scheduler_info(&self) -> SchedulerInfo {
        self.scheduler.info()
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn run_job_now(&self, job_id: &str) -> FireOutcome {
        self.scheduler.run_job_now(job_id)
    }

    pub fn run_all_now(&self) -> FireOutcome {
        self.scheduler.run_all_now()
    }

    pub fn pause_job(&self, job_id: &str) -> bool {
        self.scheduler.pause(job_id)
    }

    pub fn resume_job(&self, job_id: &str) -> bool {
        self.scheduler.resume(job_id)
    }

    pub fn opportunity_count(&self) -> usize {
        self.opportunities.len()
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::{
        config::test_config,
        db::PersistedState,
        domain::{JobRunMetadata, JobStateRecord, Tier},
    };

    #[tokio::test]
    async fn json_snapshot_backs_up_an_empty_primary_store() {
        let mut config = test_config();
        config.state.backend = StateBackend::Sqlite;
        let dir = tempfile::tempdir().unwrap();
        config.directories.data_dir = dir.path().display().to_string();
        config.directories.logs_dir = dir.path().join("logs").display().to_string();
        let paths = crate::infrastructure::directories::ensure_directories(&config.directories)
            .unwrap();

        JsonStateStore::new(&paths.state_json_path)
            .save_all(&PersistedState {
                jobs: vec![JobStateRecord {
                    job_id: "free_social".to_string(),
                    tier: Tier::Free,
                    metadata: JobRunMetadata {
                        total_runs: 12,
                        consecutive_failures: 2,
                        ..Default::default()
                    },
                }],
                sites: vec![SiteHealthRecord::new("instagram.com")],
            })
            .await
            .unwrap();

        let (alerts, _rx) = Alerts::channel();
        let (shutdown, _) = Shutdown::new();
        let engine = CrawlEngine::assemble(
            config,
            paths,
            Arc::new(crate::crawl::fetch::testing::ScriptedTransport::default()),
            alerts,
            shutdown,
        )
        .await
        .unwrap();

        let info = engine.scheduler_info();
        let social = info.jobs.iter().find(|j| j.id == "free_social").unwrap();
        assert_eq!(social.total_runs, 12);
        assert_eq!(social.consecutive_failures, 2);
        assert!(engine.site_health().contains_key("instagram.com"));
    }

    #[tokio::test]
    async fn shutdown_writes_snapshots() {
        let mut config = test_config();
        config.scheduler.enabled = false;
        let t = engine_with(config).await;
        t.shutdown.trigger();
        t.engine.clone().run().await.unwrap();

        let data_dir = t._dir.path().join("data");
        assert!(data_dir.join("scheduler_state.json").exists());
        assert!(data_dir.join("opportunities.json").exists());
        let state = JsonStateStore::new(data_dir.join("scheduler_state.json"))
            .load()
            .await
            .unwrap();
        assert!(state
            .jobs
            .iter()
            .any(|j| j.job_id == crate::config::RUN_ALL_JOB_ID));
    }
}
