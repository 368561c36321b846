// Periodic eviction of idle sessions, plus the observability-only health check.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::Session;
use super::store::SessionStore;
use crate::supervisor::spawn_supervised;

/// Evict sessions idle for longer than `threshold`. Each release runs on the
/// blocking pool so a slow one never holds up the sweep.
pub fn sweep(store: &SessionStore, threshold: Duration) -> usize {
    let evicted = store.sweep_expired(threshold, |session: Arc<Session>| {
        tokio::task::spawn_blocking(move || session.close());
    });
    if evicted > 0 {
        info!("evicted {} idle sessions ({} remain)", evicted, store.len());
    }
    evicted
}

/// Run [`sweep`] every `interval` until `stop` fires.
pub fn spawn_reaper(
    store: Arc<SessionStore>,
    interval: Duration,
    threshold: Duration,
    stop: CancellationToken,
) -> JoinHandle<bool> {
    spawn_supervised("session-reaper", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    sweep(&store, threshold);
                }
            }
        }
        debug!("session reaper stopped");
    })
}

/// Log the live session count every `interval` until `stop` fires.
pub fn spawn_health_check(
    store: Arc<SessionStore>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<bool> {
    spawn_supervised("health-check", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("health: {} live sessions", store.len());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reaper_evicts_idle_sessions() {
        let store = Arc::new(SessionStore::new());
        let session = store.resolve(None).session;
        let stop = CancellationToken::new();

        let reaper = spawn_reaper(
            Arc::clone(&store),
            Duration::from_millis(10),
            Duration::from_millis(5),
            stop.clone(),
        );

        for _ in 0..100 {
            if store.is_empty() && session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.is_empty());
        assert!(session.is_closed());

        stop.cancel();
        assert!(reaper.await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check_stops() {
        let store = Arc::new(SessionStore::new());
        let stop = CancellationToken::new();
        let check = spawn_health_check(store, Duration::from_millis(5), stop.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        assert!(check.await.unwrap());
    }
}
