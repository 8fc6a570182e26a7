//! HTTP server assembly for Switchyard

mod admin;
mod health;
mod request_context;
mod sweep;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use switchyard_audit::AuditSink;
use switchyard_config::Config;
use switchyard_llm::registry::http_factory;
use switchyard_llm::{BackendSource, Registry, RequestRouter, SessionManager, SystemClock};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Assembled server with all routes and middleware
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
    requests: Arc<RequestRouter>,
    sweep_interval: Duration,
}

impl Server {
    /// Build the server from configuration
    ///
    /// Backends are read from `source`, which is consulted again on every
    /// reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store or the initial backend set
    /// cannot be built
    pub async fn new(config: &Config, source: Arc<dyn BackendSource>) -> anyhow::Result<Self> {
        let listen_address = config
            .server
            .listen_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let store = switchyard_store::from_config(&config.store)?;

        let audit = if config.audit.enabled {
            AuditSink::new(Arc::clone(&store), config.audit.queue_capacity)
        } else {
            AuditSink::disabled()
        };

        let registry = Registry::load(source, http_factory(), config.routing.circuit_breaker.clone()).await?;
        let sessions = SessionManager::new(store, Arc::new(SystemClock), &config.session);

        let requests = Arc::new(RequestRouter::new(
            Arc::new(registry),
            Arc::new(sessions),
            audit,
            config.routing.default_backend.clone(),
        ));

        let mut app = Router::new();

        // Health check
        if config.server.health.enabled {
            app = app.route(&config.server.health.path, axum::routing::get(health::health_handler));
        }

        app = app.route(
            &config.server.health.backends_path,
            axum::routing::get(health::backends_handler).with_state(Arc::clone(&requests)),
        );

        // Chat completion routes
        app = app.merge(switchyard_llm::llm_router(Arc::clone(&requests)));

        // Admin triggers
        if let Some(ref admin_config) = config.admin {
            let token = admin_config.token.clone();
            let admin_routes = Router::new()
                .route("/internal/reload", axum::routing::post(admin::reload_handler))
                .route("/internal/backends/{id}/probe", axum::routing::post(admin::probe_handler))
                .with_state(Arc::clone(&requests))
                .layer(axum::middleware::from_fn(move |req, next| {
                    let token = token.clone();
                    async move { admin::admin_auth_middleware(token, req, next).await }
                }));
            app = app.merge(admin_routes);
        }

        // Request context (innermost, runs just before handlers)
        app = app.layer(axum::middleware::from_fn(request_context::request_context_middleware));

        // Tracing
        app = app.layer(TraceLayer::new_for_http());

        Ok(Self {
            router: app,
            listen_address,
            requests,
            sweep_interval: config.session.sweep_interval,
        })
    }

    /// Get the configured listen address
    #[must_use]
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Handle to the request router, for out-of-band reload triggers
    #[must_use]
    pub fn request_router(&self) -> Arc<RequestRouter> {
        Arc::clone(&self.requests)
    }

    /// Consume the server and return the inner router
    ///
    /// Useful for testing when the caller manages the listener
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Start serving requests on the configured address
    ///
    /// Blocks until the cancellation token is triggered.
    ///
    /// # Errors
    ///
    /// Returns an error if binding the TCP listener or serving fails
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// Also runs the session expiry sweep until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if serving fails
    pub async fn serve_on(self, listener: tokio::net::TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        let sweep = sweep::spawn_session_sweep(
            Arc::clone(self.requests.sessions()),
            self.sweep_interval,
            shutdown.clone(),
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("graceful shutdown initiated");
            })
            .await?;

        sweep.abort();
        Ok(())
    }
}
