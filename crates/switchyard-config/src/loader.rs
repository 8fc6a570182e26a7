use std::path::Path;

use secrecy::ExposeSecret;

use crate::{BackendKind, Config};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, placeholder expansion
    /// fails, parsing fails or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    ///
    /// Returns an error if placeholder expansion, parsing or validation fails
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let expanded = crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_backends()?;
        self.validate_routing()?;

        if self.audit.queue_capacity == 0 {
            anyhow::bail!("audit.queue_capacity must be greater than 0");
        }

        if let Some(ref admin) = self.admin
            && admin.token.expose_secret().is_empty()
        {
            anyhow::bail!("admin.token must not be empty");
        }

        Ok(())
    }

    fn validate_backends(&self) -> anyhow::Result<()> {
        for (id, backend) in &self.backends {
            if id.is_empty() || id.contains('/') {
                anyhow::bail!("backend id '{id}' must be non-empty and must not contain '/'");
            }

            if let Some(ref default_model) = backend.default_model
                && !backend.models.is_empty()
                && !backend.models.contains(default_model)
            {
                anyhow::bail!("backend '{id}': default_model '{default_model}' is not listed in models");
            }

            if backend.tool_priming && backend.kind != BackendKind::Threaded {
                anyhow::bail!("backend '{id}': tool_priming is only supported on threaded backends");
            }

            if backend.kind == BackendKind::Threaded && backend.base_url.is_none() {
                anyhow::bail!("backend '{id}': threaded backends require base_url");
            }

            if backend.timeout.is_zero() {
                anyhow::bail!("backend '{id}': timeout must be greater than 0");
            }
        }

        Ok(())
    }

    fn validate_routing(&self) -> anyhow::Result<()> {
        if let Some(ref default_backend) = self.routing.default_backend
            && !self.backends.contains_key(default_backend)
        {
            anyhow::bail!("routing.default_backend '{default_backend}' is not a configured backend");
        }

        let breaker = &self.routing.circuit_breaker;
        if breaker.enabled && breaker.error_threshold == 0 {
            anyhow::bail!("routing.circuit_breaker.error_threshold must be greater than 0");
        }

        Ok(())
    }
}
