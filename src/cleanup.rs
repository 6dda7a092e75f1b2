//! Scheduled cleanup of expired rotation state.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::rotation::RefreshRotationStore;

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Run all cleanup tasks once.
pub fn run_cleanup(rotation: &RefreshRotationStore) {
    let count = rotation.prune_expired();
    if count > 0 {
        info!("Cleaned up {} expired refresh chains", count);
    }
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(rotation: Arc<RefreshRotationStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            run_cleanup(&rotation);
        }
    })
}
