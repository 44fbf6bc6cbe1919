use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that compacts the journal once enough transactions have
/// been appended since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, every: Duration) {
    let threshold = engine.config().compact_threshold;
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("journal compaction failed: {e}");
        }
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "journal compacted");
    Ok(true)
}
