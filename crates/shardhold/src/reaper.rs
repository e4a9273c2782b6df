use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Check interval used before anything is registered.
const DEFAULT_RESOLUTION: Duration = Duration::from_secs(30);

/// Something holding live entities that can passivate its idle ones.
#[async_trait]
pub trait IdleSweep: Send + Sync {
    /// Label used in logs.
    fn label(&self) -> String;

    /// Passivate entities idle for at least `max_idle`; returns how many.
    async fn reap_idle(&self, max_idle: Duration) -> usize;
}

struct Registered {
    target: Arc<dyn IdleSweep>,
    max_idle: Duration,
}

/// Background task that periodically passivates idle entities.
///
/// The check interval adapts to the shortest registered idle timeout,
/// floored at `min_resolution`: `max(min(current, max_idle), min_resolution)`.
pub struct EntityReaper {
    targets: RwLock<Vec<Registered>>,
    cancel: CancellationToken,
    min_resolution_ms: u64,
    current_resolution_ms: AtomicU64,
    /// Opens on the first registration; the loop waits on it.
    latch: Notify,
}

impl EntityReaper {
    pub fn new(min_resolution: Duration, cancel: CancellationToken) -> Self {
        let min_resolution_ms = min_resolution.as_millis() as u64;
        Self {
            targets: RwLock::new(Vec::new()),
            cancel,
            min_resolution_ms,
            current_resolution_ms: AtomicU64::new(
                (DEFAULT_RESOLUTION.as_millis() as u64).max(min_resolution_ms),
            ),
            latch: Notify::new(),
        }
    }

    /// Register a target to be swept with the given idle timeout.
    pub async fn register(&self, target: Arc<dyn IdleSweep>, max_idle: Duration) {
        let max_idle_ms = max_idle.as_millis() as u64;
        loop {
            let current = self.current_resolution_ms.load(Ordering::Acquire);
            let new_resolution = current.min(max_idle_ms).max(self.min_resolution_ms);
            if new_resolution == current
                || self
                    .current_resolution_ms
                    .compare_exchange_weak(
                        current,
                        new_resolution,
                        Ordering::Release,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                break;
            }
        }

        let mut targets = self.targets.write().await;
        let was_empty = targets.is_empty();
        targets.push(Registered { target, max_idle });
        if was_empty {
            self.latch.notify_waiters();
        }
    }

    /// Run until cancelled.
    pub async fn run(&self) {
        if self.targets.read().await.is_empty() {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.latch.notified() => {}
            }
        }

        loop {
            let interval = self.current_resolution();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.reap_all().await;
                }
            }
        }
    }

    pub fn current_resolution(&self) -> Duration {
        Duration::from_millis(self.current_resolution_ms.load(Ordering::Acquire))
    }

    /// One sweep over every registered target.
    #[instrument(skip(self))]
    pub async fn reap_all(&self) -> usize {
        let targets = self.targets.read().await;
        let mut total = 0;
        for entry in targets.iter() {
            let reaped = entry.target.reap_idle(entry.max_idle).await;
            if reaped > 0 {
                debug!(target = %entry.target.label(), reaped, "passivated idle entities");
            }
            total += reaped;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSweep {
        calls: AtomicUsize,
        seen_idle: parking_lot::Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl IdleSweep for CountingSweep {
        fn label(&self) -> String {
            "counting".into()
        }

        async fn reap_idle(&self, max_idle: Duration) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen_idle.lock() = Some(max_idle);
            2
        }
    }

    fn sweep() -> Arc<CountingSweep> {
        Arc::new(CountingSweep {
            calls: AtomicUsize::new(0),
            seen_idle: parking_lot::Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn resolution_tracks_shortest_idle_with_floor() {
        let reaper = EntityReaper::new(Duration::from_secs(5), CancellationToken::new());
        assert_eq!(reaper.current_resolution(), Duration::from_secs(30));

        reaper.register(sweep(), Duration::from_secs(120)).await;
        assert_eq!(reaper.current_resolution(), Duration::from_secs(30));

        reaper.register(sweep(), Duration::from_secs(10)).await;
        assert_eq!(reaper.current_resolution(), Duration::from_secs(10));

        reaper.register(sweep(), Duration::from_secs(1)).await;
        assert_eq!(reaper.current_resolution(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn reap_all_sweeps_every_target() {
        let reaper = EntityReaper::new(Duration::from_millis(10), CancellationToken::new());
        let a = sweep();
        let b = sweep();
        reaper.register(a.clone(), Duration::from_secs(1)).await;
        reaper.register(b.clone(), Duration::from_secs(2)).await;

        assert_eq!(reaper.reap_all().await, 4);
        assert_eq!(*a.seen_idle.lock(), Some(Duration::from_secs(1)));
        assert_eq!(*b.seen_idle.lock(), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_periodically_until_cancelled() {
        let cancel = CancellationToken::new();
        let reaper = Arc::new(EntityReaper::new(Duration::from_millis(100), cancel.clone()));
        let target = sweep();
        reaper.register(target.clone(), Duration::from_millis(100)).await;

        let runner = {
            let reaper = Arc::clone(&reaper);
            tokio::spawn(async move { reaper.run().await })
        };
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        runner.await.unwrap();
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }
}
