//! Background tasks for the call bridge server.
//!
//! Includes:
//! - Sweeping sessions that failed to remove themselves from the registry.

use crate::AppState;
use callbridge_types::BridgeEvent;
use std::sync::Arc;
use tokio::time::{sleep, Instant};

/// Starts the registry sweep task.
///
/// Runs indefinitely. Every `sweep_interval` it evicts sessions whose worker
/// has exited, sessions still `Draining` after twice the drain grace period,
/// and live sessions whose worker has been blocked for twice the longest wait
/// it can legitimately sit in. Each eviction emits a `SessionEvicted` event.
pub async fn start_sweep_task(state: Arc<AppState>) {
    let settings = state.settings;
    let interval = settings.sweep_interval;
    let draining_after = settings.draining_grace * 2;
    let unresponsive_after =
        (settings.idle_timeout.max(settings.starting_timeout) + settings.stall_timeout) * 2;

    tracing::info!(
        interval_secs = interval.as_secs(),
        draining_after_ms = draining_after.as_millis() as u64,
        unresponsive_after_ms = unresponsive_after.as_millis() as u64,
        "starting session sweep task"
    );

    loop {
        sleep(interval).await;

        let evicted = state
            .registry
            .sweep(Instant::now(), draining_after, unresponsive_after);
        if evicted.is_empty() {
            continue;
        }
        tracing::info!(count = evicted.len(), "swept stale call sessions");
        for handle in evicted {
            let session_state = handle.state();
            tracing::warn!(
                stream_id = %handle.stream_id(),
                call_id = %handle.call_id(),
                state = %session_state,
                "evicted session that did not close cleanly"
            );
            state.emit(BridgeEvent::SessionEvicted {
                stream_id: handle.stream_id().to_string(),
                state: session_state,
            });
        }
    }
}
