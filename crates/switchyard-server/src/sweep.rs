use std::sync::Arc;
use std::time::Duration;

use switchyard_llm::SessionManager;
use tokio_util::sync::CancellationToken;

/// Periodically delete expired session records until `shutdown` fires
pub fn spawn_session_sweep(
    sessions: Arc<SessionManager>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => match sessions.sweep_expired().await {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "expired sessions swept"),
                    Err(e) => tracing::warn!(error = %e, "session sweep failed"),
                },
            }
        }

        tracing::debug!("session sweep stopped");
    })
}
