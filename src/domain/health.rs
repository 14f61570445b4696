use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit-breaker record for one site domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteHealthRecord {
    pub domain: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: f64,
    pub circuit_open: bool,
    pub last_check: Option<DateTime<Utc>>,
}

impl SiteHealthRecord {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_response_time_ms: 0.0,
            circuit_open: false,
            last_check: None,
        }
    }
}
