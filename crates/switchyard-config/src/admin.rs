use secrecy::SecretString;
use serde::Deserialize;

/// Administrative trigger routes (`/internal/*`)
///
/// The routes are only mounted when this section is present.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    /// Bearer token required on every admin request
    pub token: SecretString,
}
