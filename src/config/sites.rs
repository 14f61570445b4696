use std::{collections::HashSet, fs};

use serde::Deserialize;
use url::Url;

use super::env::{AppConfig, ConfigError};
use crate::domain::{Cadence, CrawlJobSpec, JobKind, Tier};

const BUILTIN_SITES: &str = include_str!("../../config/sites.json");

pub const RUN_ALL_JOB_ID: &str = "weekly_all";

#[derive(Debug, Deserialize)]
struct SiteRegistry {
    sites: Vec<SiteEntry>,
}

#[derive(Debug, Deserialize)]
struct SiteEntry {
    id: String,
    tier: Tier,
    /// A cadence slot name (`premium`, `social`, ...) or a literal expression.
    #[serde(default)]
    schedule: Option<String>,
    urls: Vec<String>,
}

/// Builds the static job registry: every configured site plus the composite
/// run-all job.
pub fn load_job_specs(config: &AppConfig) -> Result<Vec<CrawlJobSpec>, ConfigError> {
    let raw = match &config.sites_file {
        Some(path) => fs::read_to_string(path).map_err(|err| ConfigError::Sites {
            path: path.clone(),
            reason: err.to_string(),
        })?,
        None => BUILTIN_SITES.to_string(),
    };
    let source = config.sites_file.as_deref().unwrap_or("<builtin>");
    parse_job_specs(&raw, source, config)
}

fn parse_job_specs(
    raw: &str,
    source: &str,
    config: &AppConfig,
) -> Result<Vec<CrawlJobSpec>, ConfigError> {
    let registry: SiteRegistry = serde_json::from_str(raw).map_err(|err| ConfigError::Sites {
        path: source.to_string(),
        reason: err.to_string(),
    })?;

    let cadences = &config.scheduler.cadences;
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(registry.sites.len() + 1);

    for entry in registry.sites {
        if !seen.insert(entry.id.clone()) || entry.id == RUN_ALL_JOB_ID {
            return Err(ConfigError::DuplicateJob(entry.id));
        }
        for url in &entry.urls {
            let valid = Url::parse(url)
                .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::TargetUrl {
                    job: entry.id.clone(),
                    url: url.clone(),
                });
            }
        }

        let slot = entry
            .schedule
            .clone()
            .unwrap_or_else(|| entry.tier.as_str().to_string());
        let expr = cadences.lookup(&slot).unwrap_or(slot.as_str());
        let cadence: Cadence = expr.parse().map_err(|source| ConfigError::Cadence {
            job: entry.id.clone(),
            source,
        })?;

        specs.push(CrawlJobSpec {
            id: entry.id,
            tier: entry.tier,
            kind: JobKind::Site,
            target_urls: entry.urls,
            cadence,
            misfire_grace: config.scheduler.misfire_grace,
        });
    }

    let run_all: Cadence =
        cadences
            .run_all
            .parse()
            .map_err(|source| ConfigError::Cadence {
                job: RUN_ALL_JOB_ID.to_string(),
                source,
            })?;
    specs.push(CrawlJobSpec {
        id: RUN_ALL_JOB_ID.to_string(),
        tier: Tier::System,
        kind: JobKind::RunAll,
        target_urls: Vec::new(),
        cadence: run_all,
        misfire_grace: config.scheduler.run_all_grace,
    });

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn builtin_registry_loads_with_run_all_last() {
        let config = test_config();
        let specs = load_job_specs(&config).unwrap();
        let last = specs.last().unwrap();
        assert_eq!(last.id, RUN_ALL_JOB_ID);
        assert_eq!(last.kind, JobKind::RunAll);
        assert_eq!(last.misfire_grace, config.scheduler.run_all_grace);

        let social = specs.iter().find(|s| s.id == "free_social").unwrap();
        assert!(matches!(social.cadence, Cadence::Every(_)));
        assert!(specs
            .iter()
            .filter(|s| s.kind == JobKind::Site)
            .all(|s| !s.target_urls.is_empty()));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = r#"{"sites": [
            {"id": "a", "tier": "free", "urls": ["https://a.example/"]},
            {"id": "a", "tier": "free", "urls": ["https://b.example/"]}
        ]}"#;
        let err = parse_job_specs(raw, "test", &test_config()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateJob(id) if id == "a"));
    }

    #[test]
    fn literal_schedule_and_bad_urls() {
        let raw = r#"{"sites": [
            {"id": "x", "tier": "special", "schedule": "@every 15m", "urls": ["https://x.example/"]}
        ]}"#;
        let specs = parse_job_specs(raw, "test", &test_config()).unwrap();
        assert_eq!(specs[0].cadence.to_string(), "@every 900s");

        let raw = r#"{"sites": [{"id": "y", "tier": "free", "urls": ["ftp://y.example/"]}]}"#;
        let err = parse_job_specs(raw, "test", &test_config()).unwrap_err();
        assert!(matches!(err, ConfigError::TargetUrl { .. }));
    }
}
