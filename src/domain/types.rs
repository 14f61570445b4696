use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling priority class of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Premium,
    Supporter,
    Free,
    Special,
    System,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Premium => "premium",
            Tier::Supporter => "supporter",
            Tier::Free => "free",
            Tier::Special => "special",
            Tier::System => "system",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "premium" => Ok(Tier::Premium),
            "supporter" => Ok(Tier::Supporter),
            "free" => Ok(Tier::Free),
            "special" => Ok(Tier::Special),
            "system" => Ok(Tier::System),
            other => Err(format!("unknown tier `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ScraperError,
    ScraperSuccess,
    SchedulerError,
    SystemHealth,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ScraperError => "scraper_error",
            AlertKind::ScraperSuccess => "scraper_success",
            AlertKind::SchedulerError => "scheduler_error",
            AlertKind::SystemHealth => "system_health",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub payload: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind) -> Self {
        Self {
            kind,
            payload: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.payload.insert(key.to_string(), value.to_string());
        self
    }
}

/// Outcome of one crawl run, as reported to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub opportunities_found: usize,
    pub error: Option<String>,
    /// URLs actually fetched (circuit-open skips excluded).
    pub attempted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
