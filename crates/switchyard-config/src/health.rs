use serde::Deserialize;

/// Health endpoints exposed by the server
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Serve the liveness endpoint at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Liveness path, answers 200 without touching any backend
    #[serde(default = "default_path")]
    pub path: String,
    /// Per-backend circuit and failure report
    #[serde(default = "default_backends_path")]
    pub backends_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            path: default_path(),
            backends_path: default_backends_path(),
        }
    }
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}

fn default_path() -> String {
    "/health".to_owned()
}

fn default_backends_path() -> String {
    "/health/backends".to_owned()
}
