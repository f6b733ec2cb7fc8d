//! Background job: keep the per-user target cache fresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::cache::{Repository, TargetRetrieval};

/// Spawn the periodic cache refresh task. Call this once at startup.
pub fn spawn(repo: Repository, retrieval: Arc<dyn TargetRetrieval>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Per-user failures are already recorded by the repository;
            // surfacing the join here is enough.
            if let Err(e) = repo.refresh(retrieval.as_ref()).await {
                tracing::error!("cache refresh failed: {}", e);
            }
        }
    });
}
