use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::AppState;

/// Start the background expiration cleaner task
pub fn start_expiration_cleaner(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = Duration::from_secs(state.config.tokens.cleanup_interval_seconds);

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);

        loop {
            interval_timer.tick().await;
            run_cleanup(&state).await;
        }
    })
}

/// Purge expired token records and verification tokens once.
pub async fn run_cleanup(state: &Arc<AppState>) {
    debug!("Running expiration cleanup");

    let task_state = Arc::clone(state);
    let result =
        tokio::task::spawn_blocking(move || task_state.service.purge_expired()).await;

    match result {
        Ok(Ok(stats)) if stats.tokens > 0 || stats.email_tokens > 0 => debug!(
            tokens_cleaned = stats.tokens,
            email_tokens_cleaned = stats.email_tokens,
            "Expired records cleaned"
        ),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "Failed to clean up expired records"),
        Err(e) => error!(error = %e, "Expiration cleanup task panicked"),
    }
}
