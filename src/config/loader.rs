use std::{env, str::FromStr, time::Duration};

use super::env::{
    AdminConfig, AlertConfig, AppConfig, ConfigError, CrawlConfig, DirectoryConfig,
    ExtractConfig, FetchConfig, HealthConfig, LoggingConfig, MaintenanceConfig, SchedulerConfig,
    StateBackend, StateConfig, TierCadences, DEFAULT_USER_AGENT,
};
use crate::domain::Cadence;

pub fn load_config() -> Result<AppConfig, ConfigError> {
    AppConfig::from_env()
}

impl AppConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let directories = DirectoryConfig {
            logs_dir: env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            state_db_filename: env::var("STATE_DB_FILENAME")
                .unwrap_or_else(|_| "crawler_state.db".to_string()),
            state_json_filename: env::var("STATE_JSON_FILENAME")
                .unwrap_or_else(|_| "scheduler_state.json".to_string()),
            snapshot_filename: env::var("SNAPSHOT_FILENAME")
                .unwrap_or_else(|_| "opportunities.json".to_string()),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        let timezone = env::var("ALERT_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());

        let fetch_defaults = FetchConfig::default();
        let fetch = FetchConfig {
            max_concurrency: parse_or("FETCH_MAX_CONCURRENCY", fetch_defaults.max_concurrency)?
                .max(1),
            max_retries: parse_or("FETCH_MAX_RETRIES", fetch_defaults.max_retries)?,
            backoff_base: millis_or("FETCH_BACKOFF_BASE_MS", fetch_defaults.backoff_base)?,
            timeout: millis_or("FETCH_TIMEOUT_MS", fetch_defaults.timeout)?,
            user_agent: env::var("FETCH_USER_AGENT")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        };

        let crawl_defaults = CrawlConfig::default();
        let crawl = CrawlConfig {
            polite_delay_min: millis_or("POLITE_DELAY_MIN_MS", crawl_defaults.polite_delay_min)?,
            polite_delay_max: millis_or("POLITE_DELAY_MAX_MS", crawl_defaults.polite_delay_max)?,
        };
        if crawl.polite_delay_max < crawl.polite_delay_min {
            return Err(ConfigError::Invalid {
                key: "POLITE_DELAY_MAX_MS",
                value: crawl.polite_delay_max.as_millis().to_string(),
            });
        }

        let health_defaults = HealthConfig::default();
        let health = HealthConfig {
            open_threshold: parse_or("CIRCUIT_OPEN_THRESHOLD", health_defaults.open_threshold)?
                .max(1),
            open_cooldown: secs_or("CIRCUIT_COOLDOWN_SECS", health_defaults.open_cooldown)?,
        };

        let extract = env::var("EXTRACT_KEYWORDS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(|part| part.trim().to_lowercase())
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|keywords| !keywords.is_empty())
            .map(|keywords| ExtractConfig { keywords })
            .unwrap_or_default();

        let cadence_defaults = TierCadences::default();
        let cadences = TierCadences {
            premium: env::var("PREMIUM_CRON").unwrap_or(cadence_defaults.premium),
            supporter: env::var("SUPPORTER_CRON").unwrap_or(cadence_defaults.supporter),
            free: env::var("FREE_CRON").unwrap_or(cadence_defaults.free),
            social: env::var("SOCIAL_CADENCE").unwrap_or(cadence_defaults.social),
            special: env::var("SPECIAL_CADENCE").unwrap_or(cadence_defaults.special),
            run_all: env::var("RUN_ALL_CRON").unwrap_or(cadence_defaults.run_all),
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: parse_or("ENABLE_SCHEDULER", scheduler_defaults.enabled)?,
            cadences,
            misfire_grace: secs_or("MISFIRE_GRACE_SECS", scheduler_defaults.misfire_grace)?,
            run_all_grace: secs_or("RUN_ALL_GRACE_SECS", scheduler_defaults.run_all_grace)?,
            recovery_interval: secs_or(
                "RECOVERY_INTERVAL_SECS",
                scheduler_defaults.recovery_interval,
            )?,
            recovery_threshold: parse_or(
                "RECOVERY_THRESHOLD",
                scheduler_defaults.recovery_threshold,
            )?
            .max(1),
            startup_job: match env::var("STARTUP_JOB") {
                Ok(value) if value.trim().is_empty() || value == "none" => None,
                Ok(value) => Some(value.trim().to_string()),
                Err(_) => Some("free_social".to_string()),
            },
            shutdown_timeout: secs_or(
                "SHUTDOWN_TIMEOUT_SECS",
                scheduler_defaults.shutdown_timeout,
            )?,
            maintenance: maintenance_from_env(scheduler_defaults.maintenance)?,
        };

        let backend = match env::var("STATE_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_lowercase()
            .as_str()
        {
            "sqlite" => StateBackend::Sqlite,
            "json" => StateBackend::Json,
            "memory" => StateBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "STATE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let alerts = AlertConfig {
            webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            notify_on_success: parse_or("ALERT_ON_SUCCESS", false)?,
        };

        let admin = AdminConfig {
            bind: match env::var("ADMIN_BIND") {
                Ok(value) if value.trim().is_empty() || value == "off" => None,
                Ok(value) => Some(value),
                Err(_) => Some("127.0.0.1:8088".to_string()),
            },
        };

        Ok(Self {
            directories,
            logging,
            timezone,
            fetch,
            crawl,
            health,
            extract,
            scheduler,
            state: StateConfig { backend },
            alerts,
            admin,
            sites_file: env::var("SITES_FILE").ok().filter(|v| !v.is_empty()),
        })
    }
}

fn maintenance_from_env(defaults: MaintenanceConfig) -> Result<MaintenanceConfig, ConfigError> {
    let cron = env::var("MAINTENANCE_CRON")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(defaults.cron);
    cron.parse::<Cadence>()
        .map_err(|source| ConfigError::Cadence {
            job: "maintenance".to_string(),
            source,
        })?;
    Ok(MaintenanceConfig {
        cron,
        min_opportunities: parse_or("MAINTENANCE_MIN_OPPORTUNITIES", defaults.min_opportunities)?,
        max_open_circuits: parse_or("MAINTENANCE_MAX_OPEN_CIRCUITS", defaults.max_open_circuits)?,
    })
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { key, value })
        }
        _ => Ok(default),
    }
}

fn millis_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(key, default.as_secs()).map(Duration::from_secs)
}
