//! Per-session FIFO lanes.
//!
//! Each session key owns a queue; at most one agent run executes per key at
//! a time. In `interrupt` mode an incoming request first cancels whatever
//! run currently holds the lane, then queues for it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use clawdbot_core::config::QueueMode;

pub struct SessionLanes {
    mode: QueueMode,
    lanes: DashMap<String, Arc<Mutex<()>>>,
    current: DashMap<String, CancellationToken>,
}

impl SessionLanes {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            lanes: DashMap::new(),
            current: DashMap::new(),
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Wait for the lane of `key`. Returns the lane guard plus the
    /// cancellation token registered for the new run.
    pub async fn acquire(&self, key: &str) -> (OwnedMutexGuard<()>, CancellationToken) {
        if self.mode == QueueMode::Interrupt {
            if let Some(running) = self.current.get(key) {
                debug!(%key, "interrupting in-flight run");
                running.cancel();
            }
        }

        let lock = self
            .lanes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        let cancel = CancellationToken::new();
        self.current.insert(key.to_string(), cancel.clone());
        (guard, cancel)
    }

    /// Clear the current-run registration. Must be called before the lane
    /// guard is dropped — the next holder re-registers only after it takes
    /// the lock, so removal here cannot clobber a successor.
    pub fn finish(&self, key: &str) {
        self.current.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lane_serializes_runs_per_key() {
        let lanes = Arc::new(SessionLanes::new(QueueMode::Queue));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let lanes = Arc::clone(&lanes);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let (guard, _cancel) = lanes.acquire("agent:main:main").await;
                order.lock().unwrap().push(format!("start-{i}"));
                tokio::time::sleep(Duration::from_millis(20)).await;
                order.lock().unwrap().push(format!("end-{i}"));
                lanes.finish("agent:main:main");
                drop(guard);
            }));
            // stagger so acquisition order is deterministic
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        let order = order.lock().unwrap();
        // starts and ends never interleave: every start is followed by its end
        for i in (0..order.len()).step_by(2) {
            let start = &order[i];
            let end = &order[i + 1];
            assert_eq!(
                start.replace("start", ""),
                end.replace("end", ""),
                "interleaved runs: {order:?}"
            );
        }
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let lanes = Arc::new(SessionLanes::new(QueueMode::Queue));
        let (g1, _c1) = lanes.acquire("agent:main:a:direct:1").await;
        // second key acquires immediately even while the first is held
        let acquired = tokio::time::timeout(
            Duration::from_millis(100),
            lanes.acquire("agent:main:b:direct:2"),
        )
        .await;
        assert!(acquired.is_ok());
        drop(g1);
    }

    #[tokio::test]
    async fn interrupt_mode_cancels_current_run() {
        let lanes = Arc::new(SessionLanes::new(QueueMode::Interrupt));
        let (guard, cancel) = lanes.acquire("agent:main:main").await;
        assert!(!cancel.is_cancelled());

        let lanes2 = Arc::clone(&lanes);
        let waiter = tokio::spawn(async move {
            let (g, c) = lanes2.acquire("agent:main:main").await;
            drop(g);
            c
        });

        // the newcomer cancels the in-flight run, which then releases
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cancel.is_cancelled());
        lanes.finish("agent:main:main");
        drop(guard);

        let c2 = waiter.await.unwrap();
        assert!(!c2.is_cancelled());
    }
}
