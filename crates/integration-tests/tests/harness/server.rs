//! Test server wrapper that starts Switchyard on a random port

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use switchyard_llm::FileSource;
use switchyard_server::Server;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::config::ConfigBuilder;

/// A running test server instance
///
/// The configuration lives in a temporary file that the server re-reads on
/// reload, so tests can rewrite it through [`TestServer::rewrite_config`].
pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    client: reqwest::Client,
    config_path: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    /// Start a test server with the given configuration
    ///
    /// Binds to port 0 for automatic port assignment
    pub async fn start(builder: ConfigBuilder) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("switchyard.toml");
        let config = builder.write(&config_path)?;

        let server = Server::new(&config, Arc::new(FileSource::new(&config_path))).await?;
        let shutdown = CancellationToken::new();

        // Bind the listener here so we know the actual port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            server.serve_on(listener, serve_shutdown).await.ok();
        });

        Ok(Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
            config_path,
            _dir: dir,
        })
    }

    /// Base URL of the running test server
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Replace the configuration file the server reloads from
    pub fn rewrite_config(&self, builder: &ConfigBuilder) -> anyhow::Result<()> {
        builder.write(&self.config_path).map(drop)
    }

    /// Send a chat completion request, optionally with extra headers
    pub async fn chat(&self, body: &serde_json::Value, headers: &[(&str, &str)]) -> reqwest::Response {
        let mut request = self.client.post(self.url("/v1/chat/completions")).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
