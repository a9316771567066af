use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    config::EngineConfig,
    model::{PairId, RepoPair},
    pool::ExecutionPool,
    scheduler::{self, Scheduler},
    store::RepoPairStore,
};

const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// The programmatic façade exposed to the REST/CLI layer. Every method here
/// returns synchronously to the caller; errors never silently disappear the
/// way they do inside a worker.
pub struct Engine {
    config: Arc<RwLock<EngineConfig>>,
    store: Arc<dyn RepoPairStore>,
    scheduler: Arc<Scheduler>,
    pool: Arc<ExecutionPool>,
    scheduler_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn RepoPairStore>) -> Self {
        let pool = Arc::new(ExecutionPool::new(config.max_concurrent_syncs));
        Self {
            config: Arc::new(RwLock::new(config)),
            store,
            scheduler: Arc::new(Scheduler::new()),
            pool,
            scheduler_task: RwLock::new(None),
        }
    }

    /// Loads all pairs from the store and starts the scheduler loop.
    pub async fn start(&self) -> Result<()> {
        if self.is_running().await {
            return Ok(());
        }

        self.scheduler.reconcile_from_store(self.store.as_ref()).await?;

        // Must happen before the loop is spawned, not inside it: a `stop()`
        // landing between spawn and the loop's first poll must not race a
        // reset performed later from within `run`.
        self.scheduler.reset_shutdown();

        let scheduler = self.scheduler.clone();
        let config = self.config.clone();
        let store = self.store.clone();
        let pool = self.pool.clone();
        let handle = tokio::spawn(async move {
            scheduler.run(config, store, pool).await;
        });
        *self.scheduler_task.write().await = Some(handle);
        info!("engine started");
        Ok(())
    }

    /// Signals the scheduler to exit and waits a bounded time. Does **not**
    /// abort in-flight workers — only new scheduling stops. Callers wanting
    /// a hard shutdown must `abort` each active id first.
    pub async fn stop(&self) -> Result<()> {
        self.scheduler.request_stop();

        let handle = self.scheduler_task.write().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(STOP_GRACE, handle).await;
        }
        info!("engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(&*self.scheduler_task.read().await, Some(handle) if !handle.is_finished())
    }

    pub async fn schedule_pair(&self, pair: RepoPair) -> Result<()> {
        self.scheduler.schedule_pair(pair).await;
        Ok(())
    }

    /// Does not abort a running sync for this id — it only stops future
    /// scheduling.
    pub async fn unschedule_pair(&self, pair_id: &str) -> Result<()> {
        self.scheduler.unschedule_pair(pair_id).await;
        Ok(())
    }

    pub async fn reschedule_pair(&self, pair: RepoPair) -> Result<()> {
        self.scheduler.reschedule_pair(pair).await;
        Ok(())
    }

    /// Submits immediately, bypassing the due-check but not the
    /// mutual-exclusion claim.
    pub async fn sync_now(&self, pair_id: &str) -> Result<()> {
        if self.store.get_repo_pair(pair_id).await?.is_none() {
            return Err(anyhow!("unknown pair: {pair_id}"));
        }
        scheduler::dispatch(
            self.pool.clone(),
            self.store.clone(),
            self.config.clone(),
            pair_id.to_string(),
        )
        .await;
        Ok(())
    }

    pub async fn abort(&self, pair_id: &str) -> Result<bool> {
        Ok(self.pool.abort(pair_id).await)
    }

    pub async fn active_ids(&self) -> Result<Vec<PairId>> {
        Ok(self.pool.active_ids().await)
    }

    /// Alias matching the external-facing name expected by the REST/CLI layer.
    pub async fn get_active_syncs(&self) -> Result<Vec<PairId>> {
        self.active_ids().await
    }

    pub async fn update_config(&self, new_config: EngineConfig) -> Result<()> {
        self.pool.resize(new_config.max_concurrent_syncs).await;
        *self.config.write().await = new_config;
        Ok(())
    }

    pub async fn config_snapshot(&self) -> EngineConfig {
        self.config.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRepoPairStore;

    fn pair(id: &str) -> RepoPair {
        RepoPair {
            id: id.to_string(),
            source_url: "https://example.com/a.git".to_string(),
            destination_url: "https://example.com/b.git".to_string(),
            source_credentials: None,
            destination_credentials: None,
            sync_interval_minutes: 60,
            enabled: true,
            sync_branches: vec!["*".to_string()],
            sync_tags: true,
        }
    }

    #[tokio::test]
    async fn sync_now_rejects_unknown_pair() {
        let store = Arc::new(InMemoryRepoPairStore::new());
        let engine = Engine::new(EngineConfig::default(), store);
        let result = engine.sync_now("missing").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_config_resizes_the_pool_and_persists_snapshot() {
        let store = Arc::new(InMemoryRepoPairStore::new());
        store.insert(pair("p1")).await;
        let engine = Engine::new(EngineConfig::default(), store);

        let mut new_config = engine.config_snapshot().await;
        new_config.max_concurrent_syncs = 7;
        engine.update_config(new_config).await.unwrap();

        assert_eq!(engine.config_snapshot().await.max_concurrent_syncs, 7);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let store = Arc::new(InMemoryRepoPairStore::new());
        let engine = Engine::new(EngineConfig::default(), store);
        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        engine.stop().await.unwrap();
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn engine_can_be_restarted_after_stop() {
        let store = Arc::new(InMemoryRepoPairStore::new());
        let engine = Engine::new(EngineConfig::default(), store);

        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        engine.stop().await.unwrap();
        assert!(!engine.is_running().await);

        // A stale, permanently-cancelled shutdown token from the previous
        // run must not make the scheduler loop exit immediately this time.
        engine.start().await.unwrap();
        assert!(engine.is_running().await);

        engine.stop().await.unwrap();
        assert!(!engine.is_running().await);
    }
}
