use async_trait::async_trait;
use jiff::Timestamp;
use redis::AsyncCommands;

use crate::{ExchangeRecord, RecordStore, SessionRecord, StoreError};

/// Exchange records retained in the Redis list
const EXCHANGE_LOG_LENGTH: isize = 100_000;

/// Records stored as JSON values in Redis
///
/// Session keys carry an expiry matching the record's `expires_at`, so
/// Redis evicts abandoned chains even if no sweep runs.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisStore {
    /// Create a store for the given Redis URL
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid
    pub fn new(url: &str, key_prefix: String) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(format!("invalid URL: {e}")))?;

        Ok(Self { client, key_prefix })
    }

    fn session_key(&self, backend: &str, conversation_key: &str) -> String {
        format!("{}:session:{backend}:{conversation_key}", self.key_prefix)
    }

    fn exchange_key(&self) -> String {
        format!("{}:exchanges", self.key_prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("connection failed: {e}")))
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn put_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = self.session_key(&record.backend, &record.conversation_key);
        let data = serde_json::to_string(record)?;

        let remaining = record.expires_at.duration_since(Timestamp::now()).as_secs();
        let ttl_secs = u64::try_from(remaining.max(1)).unwrap_or(1);

        let _: () = conn
            .set_ex(&key, &data, ttl_secs)
            .await
            .map_err(|e| StoreError::Backend(format!("SET failed: {e}")))?;

        tracing::debug!(key, ttl_secs, "stored session record");
        Ok(())
    }

    async fn get_session(&self, backend: &str, conversation_key: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let data: Option<String> = conn
            .get(self.session_key(backend, conversation_key))
            .await
            .map_err(|e| StoreError::Backend(format!("GET failed: {e}")))?;

        data.map(|raw| serde_json::from_str(&raw)).transpose().map_err(Into::into)
    }

    async fn delete_session(&self, backend: &str, conversation_key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .del(self.session_key(backend, conversation_key))
            .await
            .map_err(|e| StoreError::Backend(format!("DEL failed: {e}")))?;

        Ok(removed > 0)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:session:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(format!("SCAN failed: {e}")))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let data: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| StoreError::Backend(format!("GET failed: {e}")))?;

            // Key may expire between SCAN and GET
            if let Some(raw) = data {
                records.push(serde_json::from_str(&raw)?);
            }
        }

        Ok(records)
    }

    async fn put_exchange(&self, record: &ExchangeRecord) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = self.exchange_key();
        let data = serde_json::to_string(record)?;

        let _: () = redis::pipe()
            .lpush(&key, &data)
            .ignore()
            .ltrim(&key, 0, EXCHANGE_LOG_LENGTH - 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("LPUSH failed: {e}")))?;

        Ok(())
    }
}
