//! Asynchronous audit sink
//!
//! Exchange records are queued on a bounded channel and written by a
//! background task. A full queue drops the record and bumps a counter;
//! the response path never waits on the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use switchyard_store::{ExchangeRecord, RecordStore};
use tokio::sync::mpsc;

/// Fire-and-forget writer of exchange records
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<ExchangeRecord>>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Create a sink and spawn its background writer
    ///
    /// The writer runs until every clone of the sink is dropped. Must be
    /// called from within a tokio runtime.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, capacity: usize) -> Self {
        let (sink, rx) = Self::channel(capacity);
        tokio::spawn(write_records(rx, store));
        sink
    }

    /// A sink that discards every record without counting it
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn channel(capacity: usize) -> (Self, mpsc::Receiver<ExchangeRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Queue a record without waiting
    pub fn submit(&self, record: ExchangeRecord) {
        let Some(ref tx) = self.tx else {
            return;
        };

        if let Err(e) = tx.try_send(record) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            tracing::debug!(dropped, reason, "audit record dropped");
        }
    }

    /// Records dropped since the sink was created
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("enabled", &self.is_enabled())
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn write_records(mut rx: mpsc::Receiver<ExchangeRecord>, store: Arc<dyn RecordStore>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = store.put_exchange(&record).await {
            tracing::warn!(
                error = %e,
                request_id = %record.request_id,
                "failed to write audit record"
            );
        }
    }

    tracing::debug!("audit writer shutting down");
}
