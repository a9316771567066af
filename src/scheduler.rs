use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::EngineConfig,
    model::{PairId, RepoPair, ScheduledEntry},
    pool::{self, ExecutionPool},
    store::RepoPairStore,
    worker::run_worker,
};

/// Core-owned scheduling state plus the periodic ticker. A single dedicated
/// loop task; the façade is the only other writer of the scheduled-entries
/// map.
pub struct Scheduler {
    entries: RwLock<HashMap<PairId, ScheduledEntry>>,
    shutdown: std::sync::Mutex<CancellationToken>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Swaps in a fresh cancellation token. A prior `stop()` leaves the old
    /// token permanently cancelled, so a later `run()` must not inherit it —
    /// otherwise the loop's `select!` would see an already-cancelled signal
    /// and return before ever ticking. Callers must call this before
    /// spawning `run()`, not from inside it, so that a `stop()` racing the
    /// spawn can't land between the reset and the loop start.
    pub fn reset_shutdown(&self) {
        let mut shutdown = self.shutdown.lock().unwrap();
        *shutdown = CancellationToken::new();
    }

    fn current_shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap().clone()
    }

    pub async fn schedule_pair(&self, pair: RepoPair) {
        let mut entries = self.entries.write().await;
        entries.insert(pair.id.clone(), ScheduledEntry::new(pair));
    }

    pub async fn unschedule_pair(&self, pair_id: &str) {
        self.entries.write().await.remove(pair_id);
    }

    /// Replaces the snapshot but preserves `last_check`, so changing
    /// credentials does not reset the clock.
    pub async fn reschedule_pair(&self, pair: RepoPair) {
        let mut entries = self.entries.write().await;
        let last_check = entries.get(&pair.id).and_then(|e| e.last_check);
        let mut entry = ScheduledEntry::new(pair);
        entry.last_check = last_check;
        entries.insert(entry.pair.id.clone(), entry);
    }

    pub async fn is_scheduled(&self, pair_id: &str) -> bool {
        self.entries.read().await.contains_key(pair_id)
    }

    /// Loads every pair from the store and registers it with a cleared
    /// `last_check`, so everything is immediately due on startup.
    pub async fn reconcile_from_store(&self, store: &dyn RepoPairStore) -> anyhow::Result<()> {
        let pairs = store.get_all_repo_pairs().await?;
        let mut entries = self.entries.write().await;
        for pair in pairs {
            entries.insert(pair.id.clone(), ScheduledEntry::new(pair));
        }
        Ok(())
    }

    pub fn request_stop(&self) {
        self.shutdown.lock().unwrap().cancel();
    }

    /// The periodic ticker. Runs until `request_stop` is called. Tick
    /// errors are logged and swallowed — the loop never dies.
    pub async fn run(
        self: Arc<Self>,
        config: Arc<RwLock<EngineConfig>>,
        store: Arc<dyn RepoPairStore>,
        pool: Arc<ExecutionPool>,
    ) {
        let shutdown = self.current_shutdown_token();
        info!("scheduler started");
        loop {
            let tick_interval = config.read().await.scheduler_tick;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(tick_interval) => {
                    if let Err(e) = self.tick(&store, &pool, &config).await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }

    async fn tick(
        &self,
        store: &Arc<dyn RepoPairStore>,
        pool: &Arc<ExecutionPool>,
        config: &Arc<RwLock<EngineConfig>>,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let snapshot = self.entries.read().await.clone();

        for (pair_id, entry) in snapshot {
            if !entry.pair.enabled {
                continue;
            }
            if pool.is_active(&pair_id).await {
                continue;
            }
            if !entry.is_due(now) {
                continue;
            }

            {
                let mut entries = self.entries.write().await;
                if let Some(e) = entries.get_mut(&pair_id) {
                    e.last_check = Some(now);
                    e.last_dispatch = Some(now);
                }
            }

            dispatch(pool.clone(), store.clone(), config.clone(), pair_id).await;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Submits a pair to the pool. Shared by the scheduler tick and by
/// `sync_now`, which bypasses the due-check but not the mutual-exclusion
/// claim. Takes a snapshot of the live config at dispatch time —
/// `max_concurrent_syncs` changes apply through the pool's own resize, but
/// a single worker runs with the timeout/retry settings in effect when it
/// started.
pub async fn dispatch(
    pool: Arc<ExecutionPool>,
    store: Arc<dyn RepoPairStore>,
    config: Arc<RwLock<EngineConfig>>,
    pair_id: PairId,
) {
    pool::submit(pool, pair_id.clone(), move |active| {
        let store = store.clone();
        let config = config.clone();
        async move {
            let config_snapshot = config.read().await.clone();
            run_worker(&config_snapshot, store.as_ref(), &pair_id, &active).await;
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: &str, interval_minutes: u64) -> RepoPair {
        RepoPair {
            id: id.to_string(),
            source_url: "https://example.com/a.git".to_string(),
            destination_url: "https://example.com/b.git".to_string(),
            source_credentials: None,
            destination_credentials: None,
            sync_interval_minutes: interval_minutes,
            enabled: true,
            sync_branches: vec!["*".to_string()],
            sync_tags: true,
        }
    }

    #[tokio::test]
    async fn reschedule_preserves_last_check() {
        let scheduler = Scheduler::new();
        scheduler.schedule_pair(pair("p1", 60)).await;

        let now = Utc::now();
        {
            let mut entries = scheduler.entries.write().await;
            entries.get_mut("p1").unwrap().last_check = Some(now);
        }

        scheduler.reschedule_pair(pair("p1", 30)).await;

        let entries = scheduler.entries.read().await;
        let entry = entries.get("p1").unwrap();
        assert_eq!(entry.last_check, Some(now));
        assert_eq!(entry.pair.sync_interval_minutes, 30);
    }

    #[tokio::test]
    async fn unschedule_removes_the_entry() {
        let scheduler = Scheduler::new();
        scheduler.schedule_pair(pair("p1", 60)).await;
        assert!(scheduler.is_scheduled("p1").await);

        scheduler.unschedule_pair("p1").await;
        assert!(!scheduler.is_scheduled("p1").await);
    }
}
