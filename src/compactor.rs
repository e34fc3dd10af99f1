use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::InMemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<InMemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_needed(store: &InMemoryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends == 0 || appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
