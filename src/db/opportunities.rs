use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::OpportunityCandidate;

/// Sink for extracted opportunities, keyed by canonical URL.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Inserts or refreshes the record for `candidate.url`. Returns true when
    /// a new record was created.
    async fn upsert(&self, candidate: &OpportunityCandidate) -> Result<bool>;

    async fn count(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryOpportunityStore {
    items: RwLock<HashMap<String, OpportunityCandidate>>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    #[cfg(test)]
    pub fn get(&self, url: &str) -> Option<OpportunityCandidate> {
        self.items.read().get(url).cloned()
    }

    /// Records ordered by scrape time, newest first.
    pub fn all(&self) -> Vec<OpportunityCandidate> {
        let mut items: Vec<_> = self.items.read().values().cloned().collect();
        items.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at).then_with(|| a.url.cmp(&b.url)));
        items
    }

    /// Seeds the store from a snapshot written by `save_snapshot`. A missing
    /// file is not an error.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let items: Vec<OpportunityCandidate> = serde_json::from_slice(&raw)
            .with_context(|| format!("malformed opportunity snapshot {}", path.display()))?;
        let count = items.len();
        let mut map = self.items.write();
        for item in items {
            map.insert(item.url.clone(), item);
        }
        Ok(count)
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let items = self.all();
        let encoded = serde_json::to_vec_pretty(&items)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(items.len())
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn upsert(&self, candidate: &OpportunityCandidate) -> Result<bool> {
        let previous = self
            .items
            .write()
            .insert(candidate.url.clone(), candidate.clone());
        Ok(previous.is_none())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn candidate(url: &str, title: &str) -> OpportunityCandidate {
        OpportunityCandidate {
            title: title.to_string(),
            description: String::new(),
            url: url.to_string(),
            deadline: None,
            location: None,
            image_url: None,
            source_domain: "example.org".to_string(),
            source_url: "https://example.org/".to_string(),
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn same_url_updates_instead_of_duplicating() {
        let store = MemoryOpportunityStore::new();
        assert!(store
            .upsert(&candidate("https://example.org/a", "Grant"))
            .await
            .unwrap());
        assert!(!store
            .upsert(&candidate("https://example.org/a", "Grant (updated)"))
            .await
            .unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("https://example.org/a").unwrap().title,
            "Grant (updated)"
        );
    }

    #[tokio::test]
    async fn snapshot_reseeds_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opportunities.json");
        let store = MemoryOpportunityStore::new();
        store.upsert(&candidate("https://example.org/a", "A")).await.unwrap();
        store.upsert(&candidate("https://example.org/b", "B")).await.unwrap();
        assert_eq!(store.save_snapshot(&path).await.unwrap(), 2);

        let fresh = MemoryOpportunityStore::new();
        assert_eq!(fresh.load_snapshot(&path).await.unwrap(), 2);
        assert!(!fresh
            .upsert(&candidate("https://example.org/b", "B"))
            .await
            .unwrap());

        let missing = MemoryOpportunityStore::new();
        assert_eq!(
            missing
                .load_snapshot(&dir.path().join("absent.json"))
                .await
                .unwrap(),
            0
        );
    }
}
