use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::model::{Ms, now_ms};
use crate::observability::{HOLDS_EXPIRED_TOTAL, RESERVATIONS_STORED, WAL_COMPACTIONS_TOTAL};

/// Background task that periodically releases expired holds.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine, now_ms()).await;
    }
}

/// Release every hold whose deadline passed by `now`. Returns how many went.
pub async fn sweep_once(engine: &Engine, now: Ms) -> usize {
    let mut released = 0;
    for slot in engine.collect_expired_holds(now) {
        match engine.release_if_expired(&slot, now).await {
            Ok(true) => {
                released += 1;
                debug!("released expired hold on {slot}");
            }
            // converted to pending or re-held since collection
            Ok(false) => {}
            Err(e) => error!("sweeper could not release {slot}: {e}"),
        }
    }
    let pruned = engine.prune_empty_slots();
    if released > 0 {
        info!("swept {released} expired holds");
        metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(released as u64);
    }
    if pruned > 0 {
        debug!("pruned {pruned} empty slot states");
    }
    metrics::gauge!(RESERVATIONS_STORED).set(engine.stored_count() as f64);
    released
}

/// Background task that compacts the WAL once enough appends piled up.
pub async fn run_compactor(engine: Arc<Engine>, every: Duration, threshold: u64, intent_retention: Ms) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold, intent_retention, now_ms()).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64, intent_retention: Ms, now: Ms) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal(now, intent_retention).await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}
