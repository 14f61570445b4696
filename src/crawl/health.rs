use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
    config::HealthConfig,
    domain::{cadence::to_chrono, AlertEvent, AlertKind, SiteHealthRecord},
    infrastructure::notifier::Alerts,
};

/// Per-domain circuit breaker.
///
/// A domain's circuit opens once `open_threshold` consecutive failures have
/// been reported and closes on the next success. While open, `is_open` keeps
/// the domain out of crawls until `open_cooldown` has passed since the last
/// failure, after which a single trial request is admitted again.
pub struct HealthTracker {
    records: RwLock<HashMap<String, SiteHealthRecord>>,
    dirty: Mutex<HashSet<String>>,
    open_threshold: u32,
    open_cooldown: Duration,
    alerts: Alerts,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig, alerts: Alerts) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            open_threshold: config.open_threshold.max(1),
            open_cooldown: config.open_cooldown,
            alerts,
        }
    }

    /// Seeds the tracker with records loaded from durable storage.
    pub fn restore(&self, records: impl IntoIterator<Item = SiteHealthRecord>) {
        let mut map = self.records.write();
        for record in records {
            map.insert(record.domain.clone(), record);
        }
    }

    pub fn report_success(&self, domain: &str, latency_ms: f64) {
        let was_open = {
            let mut map = self.records.write();
            let record = map
                .entry(domain.to_string())
                .or_insert_with(|| SiteHealthRecord::new(domain));
            record.success_count += 1;
            record.avg_response_time_ms +=
                (latency_ms - record.avg_response_time_ms) / record.success_count as f64;
            record.consecutive_failures = 0;
            record.last_check = Some(Utc::now());
            std::mem::replace(&mut record.circuit_open, false)
        };
        self.dirty.lock().insert(domain.to_string());
        if was_open {
            tracing::info!(target: "health", domain, "circuit closed after successful fetch");
        }
    }

    pub fn report_failure(&self, domain: &str, error: &str) {
        let tripped = {
            let mut map = self.records.write();
            let record = map
                .entry(domain.to_string())
                .or_insert_with(|| SiteHealthRecord::new(domain));
            record.failure_count += 1;
            record.consecutive_failures += 1;
            record.last_check = Some(Utc::now());
            if !record.circuit_open && record.consecutive_failures >= self.open_threshold {
                record.circuit_open = true;
                Some(record.consecutive_failures)
            } else {
                None
            }
        };
        self.dirty.lock().insert(domain.to_string());

        if let Some(failures) = tripped {
            tracing::warn!(
                target: "health",
                domain,
                failures,
                cooldown_secs = self.open_cooldown.as_secs(),
                "circuit opened"
            );
            self.alerts.emit(
                AlertEvent::new(AlertKind::ScraperError)
                    .with("Domain", domain)
                    .with("Error", error)
                    .with("Consecutive failures", failures)
                    .with("Circuit", "open"),
            );
        } else {
            tracing::debug!(target: "health", domain, error, "failure recorded");
        }
    }

    pub fn is_open(&self, domain: &str) -> bool {
        self.is_open_at(domain, Utc::now())
    }

    pub fn is_open_at(&self, domain: &str, now: DateTime<Utc>) -> bool {
        let map = self.records.read();
        let Some(record) = map.get(domain) else {
            return false;
        };
        if !record.circuit_open {
            return false;
        }
        match record.last_check {
            Some(last) => now - last < to_chrono(self.open_cooldown),
            None => true,
        }
    }

    pub fn get(&self, domain: &str) -> Option<SiteHealthRecord> {
        self.records.read().get(domain).cloned()
    }

    /// Read-only view for the admin surface.
    pub fn snapshot(&self) -> BTreeMap<String, SiteHealthRecord> {
        self.records
            .read()
            .iter()
            .map(|(domain, record)| (domain.clone(), record.clone()))
            .collect()
    }

    /// Records changed since the last call, for persistence.
    pub fn take_dirty(&self) -> Vec<SiteHealthRecord> {
        let domains: Vec<String> = self.dirty.lock().drain().collect();
        let map = self.records.read();
        domains
            .iter()
            .filter_map(|domain| map.get(domain).cloned())
            .collect()
    }

    /// Puts records back on the dirty list after a failed write.
    pub fn mark_dirty<'a>(&self, domains: impl IntoIterator<Item = &'a str>) {
        let mut dirty = self.dirty.lock();
        for domain in domains {
            dirty.insert(domain.to_string());
        }
    }
}
