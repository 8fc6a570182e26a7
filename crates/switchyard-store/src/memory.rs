use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{ExchangeRecord, RecordStore, SessionRecord, StoreError};

const DEFAULT_EXCHANGE_CAPACITY: usize = 10_000;

/// Process-local record store
///
/// Keeps the most recent exchange records in a bounded ring so long-running
/// single-instance deployments do not grow without limit.
pub struct MemoryStore {
    sessions: DashMap<(String, String), SessionRecord>,
    exchanges: Mutex<VecDeque<ExchangeRecord>>,
    exchange_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_exchange_capacity(DEFAULT_EXCHANGE_CAPACITY)
    }
}

impl MemoryStore {
    pub fn with_exchange_capacity(exchange_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            exchanges: Mutex::new(VecDeque::new()),
            exchange_capacity: exchange_capacity.max(1),
        }
    }

    /// Snapshot of retained exchange records, oldest first
    pub fn exchanges(&self) -> Vec<ExchangeRecord> {
        self.exchanges
            .lock()
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.sessions.insert(
            (record.backend.clone(), record.conversation_key.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn get_session(&self, backend: &str, conversation_key: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .sessions
            .get(&(backend.to_owned(), conversation_key.to_owned()))
            .map(|entry| entry.value().clone()))
    }

    async fn delete_session(&self, backend: &str, conversation_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .sessions
            .remove(&(backend.to_owned(), conversation_key.to_owned()))
            .is_some())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.sessions.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn put_exchange(&self, record: &ExchangeRecord) -> Result<(), StoreError> {
        let mut log = self
            .exchanges
            .lock()
            .map_err(|_| StoreError::Backend("exchange log lock poisoned".to_owned()))?;

        if log.len() == self.exchange_capacity {
            log.pop_front();
        }
        log.push_back(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use jiff::{SignedDuration, Timestamp};
    use uuid::Uuid;

    use super::*;

    fn session(backend: &str, key: &str) -> SessionRecord {
        let now = Timestamp::now();
        SessionRecord {
            backend: backend.to_owned(),
            conversation_key: key.to_owned(),
            conversation_id: "conv-1".to_owned(),
            continuation_token: Some("msg-1".to_owned()),
            turn_count: 1,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + SignedDuration::from_mins(30),
        }
    }

    fn exchange(request_id: &str) -> ExchangeRecord {
        ExchangeRecord {
            id: Uuid::new_v4(),
            request_id: request_id.to_owned(),
            started_at: Timestamp::now(),
            duration_ms: 3,
            backend: Some("primary".to_owned()),
            conversation_key: None,
            stream: false,
            public_request: serde_json::json!({"model": "m"}),
            native_request: None,
            native_response: None,
            public_response: None,
            usage: None,
            attempts: Vec::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn sessions_are_keyed_by_backend_and_key() {
        let store = MemoryStore::default();
        store.put_session(&session("a", "ck:1")).await.unwrap();
        store.put_session(&session("b", "ck:1")).await.unwrap();

        assert_eq!(store.session_count(), 2);
        assert!(store.get_session("a", "ck:1").await.unwrap().is_some());
        assert!(store.get_session("a", "ck:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_replaces_existing_record() {
        let store = MemoryStore::default();
        store.put_session(&session("a", "ck:1")).await.unwrap();

        let mut updated = session("a", "ck:1");
        updated.continuation_token = Some("msg-2".to_owned());
        updated.turn_count = 2;
        store.put_session(&updated).await.unwrap();

        let stored = store.get_session("a", "ck:1").await.unwrap().unwrap();
        assert_eq!(stored.continuation_token.as_deref(), Some("msg-2"));
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_record_existed() {
        let store = MemoryStore::default();
        store.put_session(&session("a", "ck:1")).await.unwrap();

        assert!(store.delete_session("a", "ck:1").await.unwrap());
        assert!(!store.delete_session("a", "ck:1").await.unwrap());
        assert!(store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exchange_log_is_bounded() {
        let store = MemoryStore::with_exchange_capacity(2);
        for id in ["r1", "r2", "r3"] {
            store.put_exchange(&exchange(id)).await.unwrap();
        }

        let ids: Vec<_> = store.exchanges().into_iter().map(|e| e.request_id).collect();
        assert_eq!(ids, ["r2", "r3"]);
    }
}
