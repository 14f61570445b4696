use std::time::Duration;

use thiserror::Error;

use crate::domain::CadenceError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub directories: DirectoryConfig,
    pub logging: LoggingConfig,
    pub timezone: String,
    pub fetch: FetchConfig,
    pub crawl: CrawlConfig,
    pub health: HealthConfig,
    pub extract: ExtractConfig,
    pub scheduler: SchedulerConfig,
    pub state: StateConfig,
    pub alerts: AlertConfig,
    pub admin: AdminConfig,
    pub sites_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub logs_dir: String,
    pub data_dir: String,
    pub state_db_filename: String,
    pub state_json_filename: String,
    pub snapshot_filename: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.110 Safari/537.36";

/// Politeness delay between sequential requests of one job.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub polite_delay_min: Duration,
    pub polite_delay_max: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            polite_delay_min: Duration::from_millis(1_500),
            polite_delay_max: Duration::from_millis(3_500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub open_threshold: u32,
    pub open_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            open_threshold: 3,
            open_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub keywords: Vec<String>,
}

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "call for",
    "opportunity",
    "submission",
    "apply",
    "application",
    "deadline",
    "residency",
    "grant",
    "funding",
    "fellowship",
    "exhibition",
    "contest",
    "competition",
    "commission",
    "award",
    "stipend",
    "scholarship",
    "open call",
    "artists wanted",
    "seeking artists",
];

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Cadence expressions per tier slot. Sites refer to a slot by name.
#[derive(Debug, Clone)]
pub struct TierCadences {
    pub premium: String,
    pub supporter: String,
    pub free: String,
    pub social: String,
    pub special: String,
    pub run_all: String,
}

impl TierCadences {
    pub fn lookup(&self, slot: &str) -> Option<&str> {
        match slot {
            "premium" => Some(&self.premium),
            "supporter" => Some(&self.supporter),
            "free" => Some(&self.free),
            "social" => Some(&self.social),
            "special" => Some(&self.special),
            "run_all" => Some(&self.run_all),
            _ => None,
        }
    }
}

impl Default for TierCadences {
    fn default() -> Self {
        Self {
            premium: "0 0 11 * * Mon,Wed,Fri".to_string(),
            supporter: "0 0 11 * * Tue,Thu".to_string(),
            free: "0 0 11 * * Sat".to_string(),
            social: "@every 6h".to_string(),
            special: "@every 1h".to_string(),
            run_all: "0 0 1 * * Sun".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cadences: TierCadences,
    pub misfire_grace: Duration,
    pub run_all_grace: Duration,
    pub recovery_interval: Duration,
    pub recovery_threshold: u32,
    pub startup_job: Option<String>,
    pub shutdown_timeout: Duration,
    pub maintenance: MaintenanceConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cadences: TierCadences::default(),
            misfire_grace: Duration::from_secs(3_600),
            run_all_grace: Duration::from_secs(7_200),
            recovery_interval: Duration::from_secs(30 * 60),
            recovery_threshold: 3,
            startup_job: None,
            shutdown_timeout: Duration::from_secs(10),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Daily health review of the whole engine.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Six-field cron expression, UTC.
    pub cron: String,
    pub min_opportunities: usize,
    pub max_open_circuits: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cron: "0 5 0 * * *".to_string(),
            min_opportunities: 50,
            max_open_circuits: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    Sqlite,
    Json,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StateConfig {
    pub backend: StateBackend,
}

#[derive(Debug, Clone, Default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    pub notify_on_success: bool,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub bind: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("failed to read site registry {path}: {reason}")]
    Sites { path: String, reason: String },
    #[error("job `{job}` has an invalid cadence: {source}")]
    Cadence {
        job: String,
        #[source]
        source: CadenceError,
    },
    #[error("job `{0}` is defined more than once")]
    DuplicateJob(String),
    #[error("job `{job}` has an invalid target url `{url}`")]
    TargetUrl { job: String, url: String },
}
