use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::model::{ActiveSync, PairId};

/// Bounded concurrent execution of workers with per-pair mutual exclusion.
/// Capacity is a `Semaphore` that gets *replaced*, not mutated, on
/// resize: in-flight permit holders keep running under the old capacity,
/// new acquisitions observe the new one, in place of a live thread-pool
/// attribute mutation.
pub struct ExecutionPool {
    semaphore: Mutex<Arc<Semaphore>>,
    active: Mutex<HashMap<PairId, ActiveSync>>,
}

impl ExecutionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Mutex::new(Arc::new(Semaphore::new(capacity))),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resize(&self, capacity: usize) {
        let mut semaphore = self.semaphore.lock().await;
        *semaphore = Arc::new(Semaphore::new(capacity));
    }

    async fn current_semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.lock().await.clone()
    }

    /// Atomically test-and-set the active record for `pair_id`. Returns
    /// `None` (a no-op) if a sync for this pair is already in progress —
    /// this is the per-pair mutual-exclusion claim.
    pub async fn claim(&self, pair_id: &str) -> Option<ActiveSync> {
        let mut active = self.active.lock().await;
        if active.contains_key(pair_id) {
            return None;
        }
        let record = ActiveSync::new();
        active.insert(pair_id.to_string(), record.clone());
        Some(record)
    }

    /// Always releases the active-record slot regardless of the worker's
    /// outcome.
    pub async fn release(&self, pair_id: &str) {
        self.active.lock().await.remove(pair_id);
    }

    pub async fn is_active(&self, pair_id: &str) -> bool {
        self.active.lock().await.contains_key(pair_id)
    }

    pub async fn active_ids(&self) -> Vec<PairId> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Signals the worker's abort-signal. Returns whether a sync was in
    /// progress for `pair_id`.
    pub async fn abort(&self, pair_id: &str) -> bool {
        match self.active.lock().await.get(pair_id) {
            Some(record) => {
                record.abort_signal.cancel();
                true
            }
            None => false,
        }
    }

    /// Acquires a concurrency permit under the pool's current capacity.
    /// Blocks when capacity is saturated.
    pub async fn acquire_permit(&self) -> tokio::sync::OwnedSemaphorePermit {
        let semaphore = self.current_semaphore().await;
        match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("execution pool semaphore was closed; this should not happen");
                std::future::pending().await
            }
        }
    }
}

/// A worker task spawned into the pool: acquires a permit, claims the
/// pair's active slot, runs `body`, then always releases both, in that
/// order (permit last, so a saturated pool doesn't briefly see capacity
/// freed before the active record is gone).
pub async fn submit<F, Fut>(
    pool: Arc<ExecutionPool>,
    pair_id: PairId,
    body: F,
) where
    F: FnOnce(ActiveSync) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let Some(active_sync) = pool.claim(&pair_id).await else {
            info!(pair_id = %pair_id, "sync already in progress, skipping submission");
            return;
        };

        let _permit = pool.acquire_permit().await;
        body(active_sync).await;
        pool.release(&pair_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_per_pair() {
        let pool = ExecutionPool::new(4);
        let first = pool.claim("p1").await;
        assert!(first.is_some());

        let second = pool.claim("p1").await;
        assert!(second.is_none());

        pool.release("p1").await;
        let third = pool.claim("p1").await;
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn abort_reports_whether_a_sync_was_active() {
        let pool = ExecutionPool::new(4);
        assert!(!pool.abort("p1").await);

        pool.claim("p1").await;
        assert!(pool.abort("p1").await);
        assert!(pool.is_active("p1").await);
    }

    #[tokio::test]
    async fn active_ids_reflects_current_claims() {
        let pool = ExecutionPool::new(4);
        pool.claim("p1").await;
        pool.claim("p2").await;
        let mut ids = pool.active_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["p1".to_string(), "p2".to_string()]);

        pool.release("p1").await;
        assert_eq!(pool.active_ids().await, vec!["p2".to_string()]);
    }

    #[tokio::test]
    async fn resize_does_not_affect_permits_already_acquired() {
        let pool = Arc::new(ExecutionPool::new(1));
        let permit = pool.acquire_permit().await;
        pool.resize(4).await;

        // The new semaphore has its own 4 permits, independent of the one
        // still held from the old semaphore.
        let _p2 = pool.acquire_permit().await;
        let _p3 = pool.acquire_permit().await;
        drop(permit);
    }
}
