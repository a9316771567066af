use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::EngineConfig,
    error::EngineError,
    git_runner::GitRunner,
    mirror::run_mirror,
    model::{ActiveSync, RepoPair, SyncLogEntry, SyncStatus},
    store::RepoPairStore,
};

/// One full sync attempt for a pair, including retries. The caller (the
/// pool's `submit`) has already performed the claim; this function loads
/// the pair snapshot, logs the attempt, runs the mirror with retries, and
/// finalizes the log entry and active-sync record.
pub async fn run_worker(
    config: &EngineConfig,
    store: &dyn RepoPairStore,
    pair_id: &str,
    active: &ActiveSync,
) {
    let started_at = Utc::now();

    let pair = match store.get_repo_pair(pair_id).await {
        Ok(Some(pair)) => pair,
        Ok(None) => {
            info!(pair_id, "pair deleted between schedule and run, skipping");
            return;
        }
        Err(e) => {
            // StoreError: logged, worker proceeds best-effort by giving up
            // on this invocation — there's nothing meaningful left to sync.
            error!(pair_id, error = %e, "failed loading pair snapshot from store");
            return;
        }
    };

    info!(pair_id, source = %pair.source_url, destination = %pair.destination_url, "starting sync");

    let runner = GitRunner::new(config.git_timeout);
    let outcome = run_with_retries(config, &runner, &pair, &active.abort_signal).await;

    finalize(store, &pair, started_at, outcome).await;
}

enum Attempt {
    Success { message: String, branches_synced: Vec<String>, tags_synced: u64 },
    Failed { status: SyncStatus, error: EngineError },
}

async fn run_with_retries(
    config: &EngineConfig,
    runner: &GitRunner,
    pair: &RepoPair,
    abort_signal: &CancellationToken,
) -> Attempt {
    let first = run_mirror(config, runner, pair, abort_signal).await;
    let mut last_error = match first {
        Ok(result) => {
            return Attempt::Success {
                message: result.message,
                branches_synced: result.branches_synced,
                tags_synced: result.tags_synced,
            };
        }
        Err(EngineError::Aborted) => {
            return Attempt::Failed { status: SyncStatus::Aborted, error: EngineError::Aborted };
        }
        Err(e) => e,
    };

    if !config.retry_on_failure {
        return Attempt::Failed { status: SyncStatus::Error, error: last_error };
    }

    for attempt in 1..=config.retry_count {
        let backoff = std::time::Duration::from_secs(5 * attempt as u64);
        warn!(pair_id = %pair.id, attempt, backoff_secs = backoff.as_secs(), error = %last_error, "sync failed, backing off before retry");

        tokio::select! {
            biased;
            _ = abort_signal.cancelled() => {
                return Attempt::Failed { status: SyncStatus::Aborted, error: EngineError::Aborted };
            }
            _ = tokio::time::sleep(backoff) => {}
        }

        match run_mirror(config, runner, pair, abort_signal).await {
            Ok(result) => {
                return Attempt::Success {
                    message: format!("sync succeeded after {attempt} retries"),
                    branches_synced: result.branches_synced,
                    tags_synced: result.tags_synced,
                };
            }
            Err(EngineError::Aborted) => {
                return Attempt::Failed { status: SyncStatus::Aborted, error: EngineError::Aborted };
            }
            Err(e) => last_error = e,
        }
    }

    Attempt::Failed { status: SyncStatus::Error, error: last_error }
}

async fn finalize(
    store: &dyn RepoPairStore,
    pair: &RepoPair,
    started_at: chrono::DateTime<Utc>,
    outcome: Attempt,
) {
    let ended_at = Utc::now();
    let duration_seconds = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;

    let entry = match outcome {
        Attempt::Success { message, branches_synced, tags_synced } => {
            info!(pair_id = %pair.id, branches = branches_synced.len(), tags = tags_synced, "sync succeeded");
            SyncLogEntry {
                started_at,
                ended_at,
                duration_seconds,
                status: SyncStatus::Success,
                message: Some(message),
                error: None,
                branches_synced,
                tags_synced,
                source_url: pair.source_url.clone(),
                destination_url: pair.destination_url.clone(),
            }
        }
        Attempt::Failed { status, error } => {
            let excerpt = error.excerpt();
            match status {
                SyncStatus::Aborted => info!(pair_id = %pair.id, "sync aborted"),
                _ => error!(pair_id = %pair.id, error = %excerpt, "sync failed"),
            }
            SyncLogEntry {
                started_at,
                ended_at,
                duration_seconds,
                status,
                message: None,
                error: Some(excerpt),
                branches_synced: Vec::new(),
                tags_synced: 0,
                source_url: pair.source_url.clone(),
                destination_url: pair.destination_url.clone(),
            }
        }
    };

    // StoreError here is logged and swallowed — the worker has already done
    // everything it can; a failed status write must not re-trigger a retry.
    let status_error = entry.error.clone();
    if let Err(e) = store
        .update_sync_status(&pair.id, entry.status, status_error)
        .await
    {
        error!(pair_id = %pair.id, error = %e, "failed to update sync status");
    }
    if let Err(e) = store.add_sync_log(&pair.id, entry).await {
        error!(pair_id = %pair.id, error = %e, "failed to append sync log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRepoPairStore;

    fn pair(id: &str, source: &str, dest: &str) -> RepoPair {
        RepoPair {
            id: id.to_string(),
            source_url: source.to_string(),
            destination_url: dest.to_string(),
            source_credentials: None,
            destination_credentials: None,
            sync_interval_minutes: 60,
            enabled: true,
            sync_branches: vec!["*".to_string()],
            sync_tags: true,
        }
    }

    #[tokio::test]
    async fn missing_pair_is_a_silent_no_op() {
        let store = InMemoryRepoPairStore::new();
        let active = ActiveSync::new();
        let config = EngineConfig::default();

        run_worker(&config, &store, "missing", &active).await;

        assert_eq!(store.logs("missing").await.len(), 0);
    }

    #[tokio::test]
    async fn failed_sync_writes_exactly_one_log_entry() {
        let store = InMemoryRepoPairStore::new();
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            work_dir: tmp.path().to_path_buf(),
            retry_on_failure: false,
            git_timeout: std::time::Duration::from_secs(5),
            ..EngineConfig::default()
        };
        // A source URL that `git clone --mirror` cannot possibly reach
        // fails fast without a retry loop, keeping this test quick.
        store
            .insert(pair("p1", "file:///nonexistent/repo.git", "file:///nonexistent/dest.git"))
            .await;
        let active = ActiveSync::new();

        run_worker(&config, &store, "p1", &active).await;

        let logs = store.logs("p1").await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncStatus::Error);
        assert_eq!(store.sync_count("p1").await, Some(1));
    }
}
