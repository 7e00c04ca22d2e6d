use crate::storage;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Periodically prunes expired entries from the dead-letter table.
pub(crate) struct Cleaner {
    pub(crate) pool: PgPool,
    pub(crate) retention: Duration,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl Cleaner {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

    pub(crate) fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Self::SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match storage::prune_dead_jobs(&self.pool, self.retention).await {
                            Ok(0) => {}
                            Ok(pruned) => debug!("Pruned {pruned} expired dead-lettered jobs"),
                            Err(error) => warn!("Failed to prune dead-lettered jobs: {error}"),
                        }
                    }
                    changed = self.shutdown_rx.changed() => {
                        if changed.is_err() || *self.shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
