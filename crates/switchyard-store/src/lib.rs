//! Durable record store for session chains and exchange audit records
//!
//! The gateway only reads and writes through [`RecordStore`]; the storage
//! format belongs to the implementation.

#![allow(clippy::must_use_candidate)]

mod error;
mod memory;
mod record;
mod redis_store;

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_config::StoreConfig;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use record::{AttemptRecord, ExchangeRecord, ExchangeUsage, SessionRecord};
pub use redis_store::RedisStore;

/// Persistence collaborator used by the session manager and audit sink
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace the session record for its `(backend, conversation_key)` pair
    async fn put_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Fetch the session record for a pair, expired or not
    async fn get_session(&self, backend: &str, conversation_key: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Remove a session record, returning whether one existed
    async fn delete_session(&self, backend: &str, conversation_key: &str) -> Result<bool, StoreError>;

    /// Every stored session record, in no particular order
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Append an immutable exchange record
    async fn put_exchange(&self, record: &ExchangeRecord) -> Result<(), StoreError>;
}

/// Build the store selected by configuration
///
/// # Errors
///
/// Returns an error if the Redis URL is invalid
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn RecordStore>, StoreError> {
    use secrecy::ExposeSecret;

    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::default())),
        StoreConfig::Redis(redis) => Ok(Arc::new(RedisStore::new(
            redis.url.expose_secret(),
            redis.key_prefix.clone(),
        )?)),
    }
}
