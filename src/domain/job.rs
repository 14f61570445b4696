use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{cadence::Cadence, types::Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Crawls its own `target_urls`.
    Site,
    /// Runs every site job in sequence and aggregates the results.
    RunAll,
}

/// Immutable description of one scheduled crawl, built at config load.
#[derive(Debug, Clone)]
pub struct CrawlJobSpec {
    pub id: String,
    pub tier: Tier,
    pub kind: JobKind,
    pub target_urls: Vec<String>,
    pub cadence: Cadence,
    pub misfire_grace: Duration,
}

/// Durable per-job counters, written by the scheduler's completion listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunMetadata {
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRunMetadata {
    /// Applies one run completion. Returns false when this run (identified by
    /// its start time) was already recorded.
    pub fn record(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> bool {
        if self.last_run == Some(started_at) {
            return false;
        }
        self.total_runs += 1;
        self.last_run = Some(started_at);
        match error {
            None => {
                self.total_successes += 1;
                self.consecutive_failures = 0;
                self.last_success = Some(finished_at);
            }
            Some(err) => {
                self.total_failures += 1;
                self.consecutive_failures += 1;
                self.last_failure = Some(finished_at);
                self.last_error = Some(err.to_string());
            }
        }
        true
    }
}

/// One persisted row: the job's metadata plus its tier tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub job_id: String,
    pub tier: Tier,
    #[serde(flatten)]
    pub metadata: JobRunMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_and_success_resets() {
        let mut meta = JobRunMetadata::default();
        let t0 = Utc::now();
        for i in 0..3 {
            let at = t0 + chrono::Duration::minutes(i);
            assert!(meta.record(at, at, Some("connection refused")));
        }
        assert_eq!(meta.consecutive_failures, 3);
        assert_eq!(meta.total_failures, 3);
        assert_eq!(meta.last_error.as_deref(), Some("connection refused"));

        let later = t0 + chrono::Duration::hours(1);
        assert!(meta.record(later, later, None));
        assert_eq!(meta.consecutive_failures, 0);
        assert_eq!(meta.total_runs, 4);
        assert_eq!(meta.last_success, Some(later));
    }

    #[test]
    fn replayed_completion_is_ignored() {
        let mut meta = JobRunMetadata::default();
        let started = Utc::now();
        assert!(meta.record(started, started, Some("boom")));
        assert!(!meta.record(started, started, Some("boom")));
        assert_eq!(meta.total_runs, 1);
        assert_eq!(meta.consecutive_failures, 1);
    }
}
