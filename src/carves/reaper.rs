//! Periodic sweep that fails carve sessions abandoned mid-transfer.

use super::manager::CarveManager;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn spawn_reaper(carves: Arc<CarveManager>, ttl: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Carve reaper started (ttl={:?}, every={:?})", ttl, every);
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let failed = carves.reap_stalled(ttl);
            if !failed.is_empty() {
                tracing::info!("Carve reaper failed {} stalled sessions", failed.len());
            }
        }
    })
}
