use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PersistedState, StateError, StateStore};
use crate::domain::{JobStateRecord, SiteHealthRecord};

/// Process-local state; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<PersistedState, StateError> {
        Ok(self.state.lock().clone())
    }

    async fn save_job(&self, record: &JobStateRecord) -> Result<(), StateError> {
        self.state.lock().upsert_job(record);
        Ok(())
    }

    async fn save_site_health(&self, records: &[SiteHealthRecord]) -> Result<(), StateError> {
        self.state.lock().upsert_sites(records);
        Ok(())
    }
}
