//! In-memory recovery store for tests and the simulator.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{RecoveryStore, SessionRecoveryRecord};
use crate::error::Result;

/// Records kept in a process-local map. Lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SessionRecoveryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecoveryStore for MemoryStore {
    async fn save(&self, record: &SessionRecoveryRecord) -> Result<()> {
        self.records
            .write()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecoveryRecord>> {
        Ok(self.records.read().get(session_id).cloned())
    }

    async fn take(&self, session_id: &str) -> Result<Option<SessionRecoveryRecord>> {
        Ok(self.records.write().remove(session_id))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::tests::sample_record;

    #[tokio::test]
    async fn test_round_trip_and_take() {
        let store = MemoryStore::new();
        let record = sample_record();
        store.save(&record).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("sess-1").await.unwrap().as_ref(), Some(&record));
        assert_eq!(store.list().await.unwrap(), vec!["sess-1"]);
        assert_eq!(store.take("sess-1").await.unwrap(), Some(record));
        assert!(store.take("sess-1").await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
