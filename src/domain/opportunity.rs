use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A posting extracted from one page. Identity is the canonical `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityCandidate {
    pub title: String,
    pub description: String,
    pub url: String,
    pub deadline: Option<String>,
    pub location: Option<String>,
    pub image_url: Option<String>,
    pub source_domain: String,
    pub source_url: String,
    pub scraped_at: DateTime<Utc>,
}
