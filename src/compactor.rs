use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::observability;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the WAL as a snapshot once it has grown by `threshold` appends.
/// Returns the number of events in the snapshot, or None when below threshold.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return None;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!(appends, events, "compacted WAL");
            Some(events)
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            None
        }
    }
}

/// Background task, one per tenant.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}
