#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::sync::Arc;

use args::Args;
use clap::Parser;
use switchyard_config::Config;
use switchyard_llm::{FileSource, RequestRouter};
use switchyard_server::Server;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen_address = Some(listen);
    }

    switchyard_telemetry::init(&config.telemetry, args.log.as_deref())?;

    tracing::info!(
        config_path = %args.config.display(),
        "starting switchyard"
    );

    let source = Arc::new(FileSource::new(&args.config));
    let server = Box::pin(Server::new(&config, source)).await?;

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(server.request_router(), shutdown.clone()));

    server.serve(shutdown).await?;

    tracing::info!("switchyard stopped");
    Ok(())
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}

/// Re-read backends from the config file on every `SIGHUP`
#[cfg(unix)]
async fn reload_on_hangup(router: Arc<RequestRouter>, shutdown: CancellationToken) {
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGHUP handler, reload only via admin route");
            return;
        }
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                tracing::info!("SIGHUP received, reloading backends");
                // Failures are logged by the registry and keep the previous set
                let _ = router.reload().await;
            }
        }
    }
}
