//! Provider Registry: the active backend set and its health
//!
//! The set is an immutable [`Snapshot`] swapped atomically on reload.
//! In-flight calls keep the `Arc` of the client they started with, so a
//! reload never disturbs them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use indexmap::IndexMap;
use jiff::Timestamp;
use serde::Serialize;
use switchyard_config::{CircuitBreakerConfig, Config};

use crate::backend::{self, Backend, BackendDescriptor};
use crate::error::LlmError;
use crate::health::{BackendHealth, HealthTracker};

/// Configuration store collaborator
#[async_trait]
pub trait BackendSource: Send + Sync {
    async fn list_enabled_backends(&self) -> anyhow::Result<Vec<BackendDescriptor>>;
}

/// Reads the `[backends]` table of a config file on every call
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BackendSource for FileSource {
    async fn list_enabled_backends(&self) -> anyhow::Result<Vec<BackendDescriptor>> {
        let config = Config::load(&self.path)?;
        Ok(config
            .backends
            .iter()
            .filter(|(_, backend)| backend.enabled)
            .map(|(id, backend)| BackendDescriptor::from_config(id.clone(), backend))
            .collect())
    }
}

/// In-memory source, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticSource {
    backends: RwLock<Vec<BackendDescriptor>>,
}

impl StaticSource {
    pub fn new(backends: Vec<BackendDescriptor>) -> Self {
        Self {
            backends: RwLock::new(backends),
        }
    }

    /// Replace the descriptors returned by the next load
    pub fn set(&self, backends: Vec<BackendDescriptor>) {
        *self.backends.write().unwrap_or_else(std::sync::PoisonError::into_inner) = backends;
    }
}

#[async_trait]
impl BackendSource for StaticSource {
    async fn list_enabled_backends(&self) -> anyhow::Result<Vec<BackendDescriptor>> {
        Ok(self
            .backends
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|b| b.enabled)
            .cloned()
            .collect())
    }
}

/// Builds one client per descriptor
pub type BackendFactory = Arc<dyn Fn(&BackendDescriptor) -> Result<Arc<dyn Backend>, LlmError> + Send + Sync>;

/// Factory for the built-in HTTP clients
pub fn http_factory() -> BackendFactory {
    Arc::new(|descriptor: &BackendDescriptor| backend::build(descriptor.clone()))
}

/// One complete, consistent set of active backends
pub struct Snapshot {
    backends: IndexMap<String, Arc<dyn Backend>>,
    generation: u64,
    loaded_at: Timestamp,
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Increments on every successful reload, starting at 1
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub const fn loaded_at(&self) -> Timestamp {
        self.loaded_at
    }

    /// Backends most-preferred first: priority descending, then id
    pub fn by_preference(&self) -> Vec<Arc<dyn Backend>> {
        let mut backends: Vec<_> = self.backends.values().cloned().collect();
        backends.sort_by(|a, b| {
            b.descriptor()
                .priority
                .cmp(&a.descriptor().priority)
                .then_with(|| a.id().cmp(b.id()))
        });
        backends
    }
}

/// A model and the most-preferred backend serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub owned_by: String,
}

/// One row of the health report
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub kind: &'static str,
    pub priority: i32,
    pub models: Vec<String>,
    #[serde(flatten)]
    pub health: BackendHealth,
}

pub struct Registry {
    source: Arc<dyn BackendSource>,
    factory: BackendFactory,
    active: ArcSwap<Snapshot>,
    health: HealthTracker,
    reloading: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Load the initial backend set
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or a client cannot be built
    pub async fn load(
        source: Arc<dyn BackendSource>,
        factory: BackendFactory,
        breaker: CircuitBreakerConfig,
    ) -> Result<Self, LlmError> {
        Self::load_with_health(source, factory, HealthTracker::new(breaker)).await
    }

    /// Load with a preconfigured health tracker
    pub async fn load_with_health(
        source: Arc<dyn BackendSource>,
        factory: BackendFactory,
        health: HealthTracker,
    ) -> Result<Self, LlmError> {
        let snapshot = build_snapshot(source.as_ref(), &factory, 1).await?;
        tracing::info!(backends = ?snapshot.ids(), "backend registry loaded");

        Ok(Self {
            source,
            factory,
            active: ArcSwap::from_pointee(snapshot),
            health,
            reloading: tokio::sync::Mutex::new(()),
        })
    }

    /// Re-read the source and swap in a new snapshot
    ///
    /// On failure the previous snapshot stays active.
    pub async fn reload(&self) -> Result<Vec<String>, LlmError> {
        let _serialized = self.reloading.lock().await;
        let generation = self.active.load().generation + 1;

        match build_snapshot(self.source.as_ref(), &self.factory, generation).await {
            Ok(snapshot) => {
                let ids = snapshot.ids();
                self.active.store(Arc::new(snapshot));
                tracing::info!(backends = ?ids, generation, "backend registry reloaded");
                Ok(ids)
            }
            Err(e) => {
                tracing::warn!(error = %e, "backend reload failed, keeping previous set");
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.active.load_full()
    }

    /// Look up an active backend by id
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Backend>, LlmError> {
        self.active
            .load()
            .get(id)
            .cloned()
            .ok_or_else(|| LlmError::BackendNotFound { backend: id.to_owned() })
    }

    /// Every backend advertising `model`, most-preferred first
    pub fn by_model(&self, model: &str) -> Vec<Arc<dyn Backend>> {
        self.active
            .load()
            .by_preference()
            .into_iter()
            .filter(|b| b.descriptor().serves(model))
            .collect()
    }

    /// Every served model once, owned by its most-preferred backend
    pub fn models(&self) -> Vec<ModelEntry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for backend in self.active.load().by_preference() {
            for model in &backend.descriptor().models {
                if seen.insert(model.clone()) {
                    entries.push(ModelEntry {
                        id: model.clone(),
                        owned_by: backend.id().to_owned(),
                    });
                }
            }
        }

        entries
    }

    pub const fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn health_report(&self) -> Vec<BackendStatus> {
        self.active
            .load()
            .by_preference()
            .iter()
            .map(|backend| {
                let descriptor = backend.descriptor();
                BackendStatus {
                    id: descriptor.id.clone(),
                    kind: descriptor.kind.as_str(),
                    priority: descriptor.priority,
                    models: descriptor.models.clone(),
                    health: self.health.snapshot(&descriptor.id),
                }
            })
            .collect()
    }

    /// Run an explicit health probe and record its outcome
    pub async fn probe(&self, id: &str) -> Result<BackendHealth, LlmError> {
        let backend = self.resolve(id)?;

        match backend.probe().await {
            Ok(()) => self.health.record_success(id),
            Err(e) => {
                tracing::warn!(backend = id, error = %e, "health probe failed");
                self.health.record_failure(id, &e.to_string());
            }
        }

        Ok(self.health.snapshot(id))
    }
}

async fn build_snapshot(
    source: &dyn BackendSource,
    factory: &BackendFactory,
    generation: u64,
) -> Result<Snapshot, LlmError> {
    let descriptors = source.list_enabled_backends().await?;
    let mut backends = IndexMap::with_capacity(descriptors.len());

    for descriptor in descriptors.iter().filter(|d| d.enabled) {
        let client = factory(descriptor)?;
        backends.insert(descriptor.id.clone(), client);
    }

    Ok(Snapshot {
        backends,
        generation,
        loaded_at: Timestamp::now(),
    })
}
