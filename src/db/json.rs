use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{fs, sync::Mutex};

use super::{PersistedState, StateError, StateStore};
use crate::domain::{JobStateRecord, SiteHealthRecord};

/// Whole-document JSON persistence. Every write rewrites the file through a
/// temporary sibling and a rename, so readers never see a torn document.
pub struct JsonStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<PersistedState, StateError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_slice(&raw).map_err(|source| StateError::Malformed {
            path: self.path.display().to_string(),
            source,
        })
    }

    async fn write(&self, state: &PersistedState) -> Result<(), StateError> {
        let encoded = serde_json::to_vec_pretty(state).map_err(|source| StateError::Malformed {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded)
            .await
            .map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn load(&self) -> Result<PersistedState, StateError> {
        self.read().await
    }

    async fn save_job(&self, record: &JobStateRecord) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read().await?;
        state.upsert_job(record);
        self.write(&state).await
    }

    async fn save_site_health(&self, records: &[SiteHealthRecord]) -> Result<(), StateError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut state = self.read().await?;
        state.upsert_sites(records);
        self.write(&state).await
    }

    async fn save_all(&self, state: &PersistedState) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        self.write(state).await
    }
}
