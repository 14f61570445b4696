use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use super::{PersistedState, StateError, StateStore};
use crate::domain::{JobRunMetadata, JobStateRecord, SiteHealthRecord, Tier};

#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self) -> Result<PersistedState, StateError> {
        let jobs = sqlx::query(
            r#"SELECT job_id, tier, total_runs, total_successes, total_failures,
                      consecutive_failures, last_run, last_success, last_failure, last_error
               FROM job_state ORDER BY job_id"#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(job_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let sites = sqlx::query(
            r#"SELECT domain, success_count, failure_count, consecutive_failures,
                      avg_response_time_ms, circuit_open, last_check
               FROM site_health ORDER BY domain"#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(site_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(PersistedState { jobs, sites })
    }

    async fn save_job(&self, record: &JobStateRecord) -> Result<(), StateError> {
        let meta = &record.metadata;
        sqlx::query(
            r#"INSERT OR REPLACE INTO job_state
                (job_id, tier, total_runs, total_successes, total_failures,
                 consecutive_failures, last_run, last_success, last_failure, last_error)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
        )
        .bind(&record.job_id)
        .bind(record.tier.as_str())
        .bind(meta.total_runs as i64)
        .bind(meta.total_successes as i64)
        .bind(meta.total_failures as i64)
        .bind(meta.consecutive_failures as i64)
        .bind(meta.last_run)
        .bind(meta.last_success)
        .bind(meta.last_failure)
        .bind(meta.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_site_health(&self, records: &[SiteHealthRecord]) -> Result<(), StateError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"INSERT OR REPLACE INTO site_health
                    (domain, success_count, failure_count, consecutive_failures,
                     avg_response_time_ms, circuit_open, last_check)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            )
            .bind(&record.domain)
            .bind(record.success_count as i64)
            .bind(record.failure_count as i64)
            .bind(record.consecutive_failures as i64)
            .bind(record.avg_response_time_ms)
            .bind(record.circuit_open)
            .bind(record.last_check)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<JobStateRecord, StateError> {
    let job_id: String = row.try_get("job_id")?;
    let tier: String = row.try_get("tier")?;
    let tier: Tier = tier.parse().map_err(|reason| StateError::Decode {
        key: job_id.clone(),
        reason,
    })?;
    Ok(JobStateRecord {
        metadata: JobRunMetadata {
            total_runs: count(row, "total_runs")?,
            total_successes: count(row, "total_successes")?,
            total_failures: count(row, "total_failures")?,
            consecutive_failures: count(row, "consecutive_failures")? as u32,
            last_run: row.try_get::<Option<DateTime<Utc>>, _>("last_run")?,
            last_success: row.try_get::<Option<DateTime<Utc>>, _>("last_success")?,
            last_failure: row.try_get::<Option<DateTime<Utc>>, _>("last_failure")?,
            last_error: row.try_get("last_error")?,
        },
        job_id,
        tier,
    })
}

fn site_from_row(row: &SqliteRow) -> Result<SiteHealthRecord, StateError> {
    Ok(SiteHealthRecord {
        domain: row.try_get("domain")?,
        success_count: count(row, "success_count")?,
        failure_count: count(row, "failure_count")?,
        consecutive_failures: count(row, "consecutive_failures")? as u32,
        avg_response_time_ms: row.try_get("avg_response_time_ms")?,
        circuit_open: row.try_get("circuit_open")?,
        last_check: row.try_get::<Option<DateTime<Utc>>, _>("last_check")?,
    })
}

fn count(row: &SqliteRow, column: &str) -> Result<u64, StateError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_pool;

    #[tokio::test]
    async fn job_and_site_rows_round_trip_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(&dir.path().join("crawler_state.db")).await.unwrap();
        let store = SqliteStateStore::new(pool);

        let started = Utc::now();
        let mut metadata = JobRunMetadata::default();
        metadata.record(started, started, Some("connection refused"));
        let record = JobStateRecord {
            job_id: "free_social".to_string(),
            tier: Tier::Free,
            metadata,
        };
        store.save_job(&record).await.unwrap();
        // replace, not duplicate
        store.save_job(&record).await.unwrap();

        let mut site = SiteHealthRecord::new("instagram.com");
        site.failure_count = 3;
        site.consecutive_failures = 3;
        site.circuit_open = true;
        site.last_check = Some(started);
        store.save_site_health(&[site.clone()]).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.jobs.len(), 1);
        let loaded = &state.jobs[0];
        assert_eq!(loaded.tier, Tier::Free);
        assert_eq!(loaded.metadata.consecutive_failures, 1);
        assert_eq!(loaded.metadata.last_error.as_deref(), Some("connection refused"));
        assert_eq!(
            loaded.metadata.last_run.map(|t| t.timestamp_millis()),
            Some(started.timestamp_millis())
        );
        assert_eq!(state.sites.len(), 1);
        assert!(state.sites[0].circuit_open);
        assert_eq!(state.sites[0].failure_count, 3);
        store.close().await;
    }
}
