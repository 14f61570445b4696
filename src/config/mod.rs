pub mod env;
mod loader;
pub mod sites;

pub use env::{
    AppConfig, CrawlConfig, DirectoryConfig, ExtractConfig, FetchConfig, HealthConfig,
    SchedulerConfig, StateBackend,
};
pub use loader::load_config;
pub use sites::{load_job_specs, RUN_ALL_JOB_ID};

/// Defaults for tests: no delays, no alerts, memory state.
#[cfg(test)]
pub fn test_config() -> AppConfig {
    use std::time::Duration;

    use env::{AdminConfig, AlertConfig, LoggingConfig, StateConfig};

    AppConfig {
        directories: DirectoryConfig {
            logs_dir: "logs".to_string(),
            data_dir: "data".to_string(),
            state_db_filename: "crawler_state.db".to_string(),
            state_json_filename: "scheduler_state.json".to_string(),
            snapshot_filename: "opportunities.json".to_string(),
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
        timezone: "UTC".to_string(),
        fetch: FetchConfig {
            backoff_base: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            ..FetchConfig::default()
        },
        crawl: CrawlConfig {
            polite_delay_min: Duration::ZERO,
            polite_delay_max: Duration::ZERO,
        },
        health: HealthConfig::default(),
        extract: ExtractConfig::default(),
        scheduler: SchedulerConfig::default(),
        state: StateConfig {
            backend: StateBackend::Memory,
        },
        alerts: AlertConfig::default(),
        admin: AdminConfig { bind: None },
        sites_file: None,
    }
}
