//! Configuration builder for integration tests
//!
//! Renders TOML rather than building `Config` directly, since reload tests
//! need the backend list to live in a file the server can re-read.

use std::fmt::Write as _;
use std::path::Path;

use switchyard_config::Config;

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    sections: Vec<String>,
    backends: Vec<String>,
}

impl ConfigBuilder {
    /// Create a builder listening on an ephemeral port
    pub fn new() -> Self {
        Self {
            sections: vec!["[server]\nlisten_address = \"127.0.0.1:0\"\n".to_owned()],
            backends: Vec::new(),
        }
    }

    /// Add an OpenAI-compatible backend pointed at a mock
    pub fn with_openai_backend(mut self, id: &str, base_url: &str, priority: i32, models: &[&str]) -> Self {
        self.backends.push(backend_section(id, "openai", base_url, priority, models, ""));
        self
    }

    /// Add a stateful conversation backend pointed at a mock
    pub fn with_threaded_backend(mut self, id: &str, base_url: &str, models: &[&str]) -> Self {
        self.backends.push(backend_section(id, "threaded", base_url, 0, models, ""));
        self
    }

    /// Add a backend with extra raw TOML lines in its table
    pub fn with_backend_extra(
        mut self,
        id: &str,
        kind: &str,
        base_url: &str,
        priority: i32,
        models: &[&str],
        extra: &str,
    ) -> Self {
        self.backends
            .push(backend_section(id, kind, base_url, priority, models, extra));
        self
    }

    pub fn with_session_ttl(mut self, ttl: &str) -> Self {
        self.sections.push(format!("[session]\nttl = \"{ttl}\"\n"));
        self
    }

    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.sections.push(format!("[admin]\ntoken = \"{token}\"\n"));
        self
    }

    pub fn with_default_backend(mut self, id: &str) -> Self {
        self.sections
            .push(format!("[routing]\ndefault_backend = \"{id}\"\n"));
        self
    }

    /// Render the configuration as TOML text
    pub fn to_toml(&self) -> String {
        let mut out = String::new();
        for section in self.sections.iter().chain(&self.backends) {
            out.push_str(section);
            out.push('\n');
        }
        out
    }

    /// Write the configuration to `path` and parse it back
    pub fn write(&self, path: &Path) -> anyhow::Result<Config> {
        let toml = self.to_toml();
        std::fs::write(path, &toml)?;
        Config::from_toml_str(&toml)
    }
}

fn backend_section(id: &str, kind: &str, base_url: &str, priority: i32, models: &[&str], extra: &str) -> String {
    let models = models.iter().map(|m| format!("\"{m}\"")).collect::<Vec<_>>().join(", ");

    let mut section = String::new();
    let _ = writeln!(section, "[backends.{id}]");
    let _ = writeln!(section, "type = \"{kind}\"");
    let _ = writeln!(section, "base_url = \"{base_url}\"");
    let _ = writeln!(section, "priority = {priority}");
    let _ = writeln!(section, "timeout = \"5s\"");
    let _ = writeln!(section, "models = [{models}]");
    if !extra.is_empty() {
        section.push_str(extra);
        section.push('\n');
    }
    section
}
