use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::domain::{JobStateRecord, SiteHealthRecord};

pub mod json;
pub mod memory;
pub mod opportunities;
pub mod sqlite;

pub use json::JsonStateStore;
pub use memory::MemoryStateStore;
pub use opportunities::{MemoryOpportunityStore, OpportunityStore};
pub use sqlite::SqliteStateStore;

pub async fn init_pool(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_state (
            job_id TEXT PRIMARY KEY,
            tier TEXT NOT NULL,
            total_runs INTEGER NOT NULL DEFAULT 0,
            total_successes INTEGER NOT NULL DEFAULT 0,
            total_failures INTEGER NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_run TEXT,
            last_success TEXT,
            last_failure TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS site_health (
            domain TEXT PRIMARY KEY,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            avg_response_time_ms REAL NOT NULL DEFAULT 0,
            circuit_open INTEGER NOT NULL DEFAULT 0,
            last_check TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("stored row for `{key}` is invalid: {reason}")]
    Decode { key: String, reason: String },
}

/// Everything the engine persists between restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub jobs: Vec<JobStateRecord>,
    #[serde(default)]
    pub sites: Vec<SiteHealthRecord>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.sites.is_empty()
    }

    pub(crate) fn upsert_job(&mut self, record: &JobStateRecord) {
        match self.jobs.iter_mut().find(|j| j.job_id == record.job_id) {
            Some(existing) => *existing = record.clone(),
            None => self.jobs.push(record.clone()),
        }
    }

    pub(crate) fn upsert_sites(&mut self, records: &[SiteHealthRecord]) {
        for record in records {
            match self.sites.iter_mut().find(|s| s.domain == record.domain) {
                Some(existing) => *existing = record.clone(),
                None => self.sites.push(record.clone()),
            }
        }
    }
}

/// Durable home of job metadata and site health.
#[async_trait]
pub trait StateStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self) -> Result<PersistedState, StateError>;

    async fn save_job(&self, record: &JobStateRecord) -> Result<(), StateError>;

    async fn save_site_health(&self, records: &[SiteHealthRecord]) -> Result<(), StateError>;

    /// Replaces everything with `state`; used for shutdown snapshots.
    async fn save_all(&self, state: &PersistedState) -> Result<(), StateError> {
        for job in &state.jobs {
            self.save_job(job).await?;
        }
        self.save_site_health(&state.sites).await
    }
}

/// Tries each source in order and returns the first non-empty state. Sources
/// that fail are logged and skipped; when none has data the engine starts
/// from zeroed state.
pub async fn load_first_available(sources: &[Arc<dyn StateStore>]) -> PersistedState {
    for source in sources {
        match source.load().await {
            Ok(state) if !state.is_empty() => {
                tracing::info!(
                    target: "state",
                    source = source.name(),
                    jobs = state.jobs.len(),
                    sites = state.sites.len(),
                    "restored persisted state"
                );
                return state;
            }
            Ok(_) => {
                tracing::debug!(target: "state", source = source.name(), "state source is empty");
            }
            Err(err) => {
                tracing::warn!(
                    target: "state",
                    source = source.name(),
                    error = %err,
                    "state source unavailable; trying next"
                );
            }
        }
    }
    tracing::info!(target: "state", "no persisted state found; starting fresh");
    PersistedState::default()
}
