#![allow(clippy::must_use_candidate)]

pub mod admin;
pub mod audit;
pub mod backend;
mod duration;
mod env;
pub mod health;
mod loader;
pub mod routing;
pub mod server;
pub mod session;
pub mod store;
pub mod telemetry;

use indexmap::IndexMap;
use serde::Deserialize;

pub use admin::*;
pub use audit::*;
pub use backend::*;
pub use env::expand_env;
pub use health::*;
pub use routing::*;
pub use server::*;
pub use session::*;
pub use store::*;
pub use telemetry::*;

/// Top-level Switchyard configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Candidate selection and circuit breaking
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Stateful conversation handling
    #[serde(default)]
    pub session: SessionConfig,
    /// Audit sink configuration
    #[serde(default)]
    pub audit: AuditConfig,
    /// Durable record store
    #[serde(default)]
    pub store: StoreConfig,
    /// Administrative trigger routes
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    /// Logging configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Backend descriptors keyed by backend id
    #[serde(default)]
    pub backends: IndexMap<String, BackendConfig>,
}
