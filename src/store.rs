use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{PairId, RepoPair, SyncLogEntry, SyncStatus};

/// The boundary the core requires from the persistence/REST layer.
/// A real deployment supplies its own implementation backed by whatever
/// database or API that layer already uses; this crate only depends on
/// these four operations.
#[async_trait]
pub trait RepoPairStore: Send + Sync {
    async fn get_all_repo_pairs(&self) -> Result<Vec<RepoPair>>;
    async fn get_repo_pair(&self, pair_id: &str) -> Result<Option<RepoPair>>;
    async fn update_sync_status(
        &self,
        pair_id: &str,
        status: SyncStatus,
        error: Option<String>,
    ) -> Result<()>;
    async fn add_sync_log(&self, pair_id: &str, entry: SyncLogEntry) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
struct PairRecord {
    pair: RepoPair,
    last_sync: Option<chrono::DateTime<chrono::Utc>>,
    last_sync_status: Option<SyncStatus>,
    last_sync_error: Option<String>,
    sync_count: u64,
    logs: Vec<SyncLogEntry>,
}

impl Default for RepoPair {
    fn default() -> Self {
        Self {
            id: String::new(),
            source_url: String::new(),
            destination_url: String::new(),
            source_credentials: None,
            destination_credentials: None,
            sync_interval_minutes: 60,
            enabled: true,
            sync_branches: vec!["*".to_string()],
            sync_tags: true,
        }
    }
}

/// Reference `RepoPairStore` backed by an in-process map. This is the only
/// persistence this crate ships; it exists so the engine can run and be
/// tested standalone, not as a production store.
#[derive(Clone, Default)]
pub struct InMemoryRepoPairStore {
    records: Arc<RwLock<HashMap<PairId, PairRecord>>>,
}

impl InMemoryRepoPairStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, pair: RepoPair) {
        let mut records = self.records.write().await;
        records
            .entry(pair.id.clone())
            .and_modify(|r| r.pair = pair.clone())
            .or_insert(PairRecord {
                pair,
                ..Default::default()
            });
    }

    pub async fn remove(&self, pair_id: &str) {
        self.records.write().await.remove(pair_id);
    }

    pub async fn sync_count(&self, pair_id: &str) -> Option<u64> {
        self.records
            .read()
            .await
            .get(pair_id)
            .map(|r| r.sync_count)
    }

    pub async fn last_sync_status(&self, pair_id: &str) -> Option<SyncStatus> {
        self.records
            .read()
            .await
            .get(pair_id)
            .and_then(|r| r.last_sync_status)
    }

    pub async fn last_sync_error(&self, pair_id: &str) -> Option<String> {
        self.records
            .read()
            .await
            .get(pair_id)
            .and_then(|r| r.last_sync_error.clone())
    }

    pub async fn logs(&self, pair_id: &str) -> Vec<SyncLogEntry> {
        self.records
            .read()
            .await
            .get(pair_id)
            .map(|r| r.logs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RepoPairStore for InMemoryRepoPairStore {
    async fn get_all_repo_pairs(&self) -> Result<Vec<RepoPair>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .map(|r| r.pair.clone())
            .collect())
    }

    async fn get_repo_pair(&self, pair_id: &str) -> Result<Option<RepoPair>> {
        Ok(self
            .records
            .read()
            .await
            .get(pair_id)
            .map(|r| r.pair.clone()))
    }

    async fn update_sync_status(
        &self,
        pair_id: &str,
        status: SyncStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(pair_id) {
            record.last_sync = Some(chrono::Utc::now());
            record.last_sync_status = Some(status);
            record.last_sync_error = error;
            record.sync_count += 1;
        }
        Ok(())
    }

    async fn add_sync_log(&self, pair_id: &str, entry: SyncLogEntry) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(pair_id) {
            record.logs.push(entry);
        }
        Ok(())
    }
}
