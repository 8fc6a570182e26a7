use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use jiff::{SignedDuration, Timestamp};
use switchyard_config::{BusyPolicy, SessionConfig};
use switchyard_store::{RecordStore, SessionRecord};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::clock::Clock;
use super::{SessionContext, key};
use crate::error::LlmError;
use crate::types::Continuation;

type LockKey = (String, String);
type LockMap = DashMap<LockKey, Arc<Mutex<()>>>;

/// Owns every session record and serializes turns per conversation
pub struct SessionManager {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    ttl: SignedDuration,
    busy: BusyPolicy,
    wait_timeout: Duration,
    locks: Arc<LockMap>,
}

/// Exclusive right to run one turn of a conversation
///
/// Released on drop, including when the caller goes away mid-stream.
pub struct TurnGuard {
    backend: String,
    conversation_key: String,
    permit: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl TurnGuard {
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn conversation_key(&self) -> &str {
        &self.conversation_key
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        // Waiters hold a clone, so a count of one means nobody else wants it
        self.locks.remove_if(&(self.backend.clone(), self.conversation_key.clone()), |_, lock| {
            Arc::strong_count(lock) == 1
        });
    }
}

impl std::fmt::Debug for TurnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnGuard")
            .field("backend", &self.backend)
            .field("conversation_key", &self.conversation_key)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, config: &SessionConfig) -> Self {
        Self {
            store,
            clock,
            ttl: SignedDuration::try_from(config.ttl).unwrap_or(SignedDuration::MAX),
            busy: config.busy,
            wait_timeout: config.wait_timeout,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the turn lock for a conversation on a backend
    ///
    /// # Errors
    ///
    /// Returns `LlmError::ConversationBusy` if another turn holds the lock and
    /// the busy policy rejects, or the wait times out.
    pub async fn begin(&self, backend: &str, conversation_key: &str) -> Result<TurnGuard, LlmError> {
        self.lock(backend, conversation_key, self.busy).await
    }

    async fn lock(&self, backend: &str, conversation_key: &str, policy: BusyPolicy) -> Result<TurnGuard, LlmError> {
        let lock = self
            .locks
            .entry((backend.to_owned(), conversation_key.to_owned()))
            .or_default()
            .clone();

        let mut guard = TurnGuard {
            backend: backend.to_owned(),
            conversation_key: conversation_key.to_owned(),
            permit: None,
            locks: Arc::clone(&self.locks),
        };

        let acquired = match policy {
            BusyPolicy::Reject => lock.try_lock_owned().ok(),
            BusyPolicy::Wait => tokio::time::timeout(self.wait_timeout, lock.lock_owned()).await.ok(),
        };

        // Dropping an unacquired guard still prunes the lock entry
        guard.permit = Some(acquired.ok_or_else(|| LlmError::ConversationBusy {
            conversation_key: conversation_key.to_owned(),
        })?);

        Ok(guard)
    }

    /// Live session record for a pair, deleting it first if it has expired
    pub async fn get(&self, backend: &str, conversation_key: &str) -> Result<Option<SessionRecord>, LlmError> {
        let Some(record) = self.store.get_session(backend, conversation_key).await? else {
            return Ok(None);
        };

        if record.is_expired(self.clock.now()) {
            tracing::debug!(backend, conversation_key, "session expired on access");
            self.store.delete_session(backend, conversation_key).await?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Session context for the turn held by `turn`
    ///
    /// With `restart` set any live record is ignored and the turn starts a
    /// new chain; the old record is replaced when that turn commits.
    pub async fn context(&self, turn: &TurnGuard, restart: bool) -> Result<SessionContext, LlmError> {
        if restart {
            return Ok(SessionContext::fresh(&turn.conversation_key));
        }

        Ok(self
            .get(&turn.backend, &turn.conversation_key)
            .await?
            .map_or_else(
                || SessionContext::fresh(&turn.conversation_key),
                |record| SessionContext {
                    conversation_key: record.conversation_key,
                    conversation_id: Some(record.conversation_id),
                    continuation_token: record.continuation_token,
                },
            ))
    }

    /// Record the continuation produced by a successful turn
    ///
    /// Committing the token already stored is a no-op.
    pub async fn commit(&self, turn: &TurnGuard, continuation: &Continuation) -> Result<SessionRecord, LlmError> {
        let now = self.clock.now();
        let expires_at = now.checked_add(self.ttl).unwrap_or(Timestamp::MAX);
        let existing = self.get(&turn.backend, &turn.conversation_key).await?;

        let record = match existing {
            Some(record)
                if record.conversation_id == continuation.conversation_id
                    && record.continuation_token.as_deref() == Some(continuation.token.as_str()) =>
            {
                return Ok(record);
            }
            Some(mut record) if record.conversation_id == continuation.conversation_id => {
                record.continuation_token = Some(continuation.token.clone());
                record.turn_count = record.turn_count.saturating_add(1);
                record.last_accessed_at = now;
                record.expires_at = expires_at;
                record
            }
            _ => SessionRecord {
                backend: turn.backend.clone(),
                conversation_key: turn.conversation_key.clone(),
                conversation_id: continuation.conversation_id.clone(),
                continuation_token: Some(continuation.token.clone()),
                turn_count: 1,
                created_at: now,
                last_accessed_at: now,
                expires_at,
            },
        };

        self.store.put_session(&record).await?;
        tracing::debug!(
            backend = %record.backend,
            conversation_key = %record.conversation_key,
            turn_count = record.turn_count,
            "session committed"
        );

        Ok(record)
    }

    /// Delete the records of an explicit session id on every backend
    ///
    /// Waits up to the busy wait timeout for an in-flight turn on the
    /// session to finish, so the delete lands after that turn's commit.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::ConversationBusy` if a turn still holds the session
    /// when the wait runs out. Records on backends already visited stay
    /// deleted.
    pub async fn end_explicit(&self, session_id: &str) -> Result<usize, LlmError> {
        let conversation_key = key::explicit(session_id);
        let mut deleted = 0;

        for record in self.store.list_sessions().await? {
            if record.conversation_key != conversation_key {
                continue;
            }

            let _turn = self.lock(&record.backend, &conversation_key, BusyPolicy::Wait).await?;
            if self.store.delete_session(&record.backend, &conversation_key).await? {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    /// Delete every expired record, returning how many were removed
    ///
    /// Conversations with a turn in flight are skipped until the next sweep.
    pub async fn sweep_expired(&self) -> Result<usize, LlmError> {
        let mut deleted = 0;

        for listed in self.store.list_sessions().await? {
            if !listed.is_expired(self.clock.now()) {
                continue;
            }

            let Ok(_turn) = self.lock(&listed.backend, &listed.conversation_key, BusyPolicy::Reject).await else {
                tracing::debug!(
                    backend = %listed.backend,
                    conversation_key = %listed.conversation_key,
                    "sweep skipped busy session"
                );
                continue;
            };

            // A commit may have refreshed the record since it was listed
            let Some(record) = self.store.get_session(&listed.backend, &listed.conversation_key).await? else {
                continue;
            };
            if record.is_expired(self.clock.now())
                && self.store.delete_session(&record.backend, &record.conversation_key).await?
            {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    /// Conversations with a turn currently in flight or queued
    pub fn active_turns(&self) -> usize {
        self.locks.len()
    }
}
