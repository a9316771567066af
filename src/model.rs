use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub type PairId = String;

/// One side's credentials. At most one form is honored; see
/// `crate::credentials` for the precedence rules between sides.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Credentials {
    UserPass { username: String, password: String },
    SshKey { private_key_text: String },
}

/// A registered (source, destination) pair and its replication policy.
/// Treated as immutable between reschedules by the scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoPair {
    pub id: PairId,
    pub source_url: String,
    pub destination_url: String,
    pub source_credentials: Option<Credentials>,
    pub destination_credentials: Option<Credentials>,
    pub sync_interval_minutes: u64,
    pub enabled: bool,
    /// Ordered glob patterns; the sentinel `"*"` present anywhere means "all".
    pub sync_branches: Vec<String>,
    pub sync_tags: bool,
}

impl RepoPair {
    pub fn syncs_all_branches(&self) -> bool {
        self.sync_branches.is_empty() || self.sync_branches.iter().any(|p| p == "*")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
    Aborted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
            SyncStatus::Aborted => "aborted",
        }
    }
}

/// Written exactly once per worker invocation, in its finalization step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: SyncStatus,
    pub message: Option<String>,
    pub error: Option<String>,
    pub branches_synced: Vec<String>,
    pub tags_synced: u64,
    pub source_url: String,
    pub destination_url: String,
}

/// Core-owned scheduling state for one pair. Mutated only by the scheduler
/// thread and the façade.
#[derive(Clone, Debug)]
pub struct ScheduledEntry {
    pub pair: RepoPair,
    pub last_check: Option<DateTime<Utc>>,
    pub last_dispatch: Option<DateTime<Utc>>,
}

impl ScheduledEntry {
    pub fn new(pair: RepoPair) -> Self {
        Self {
            pair,
            last_check: None,
            last_dispatch: None,
        }
    }

    /// A pair is due when it has never been checked, or its interval has
    /// elapsed since the last check.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_check {
            None => true,
            Some(last_check) => {
                let elapsed_minutes = (now - last_check).num_seconds() as f64 / 60.0;
                elapsed_minutes >= self.pair.sync_interval_minutes as f64
            }
        }
    }
}

/// Core-owned active-sync record. At most one per pair-id at any instant;
/// the pool's active-record map enforces that invariant.
#[derive(Clone)]
pub struct ActiveSync {
    pub started_at: DateTime<Utc>,
    pub abort_signal: CancellationToken,
}

impl ActiveSync {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            abort_signal: CancellationToken::new(),
        }
    }
}

impl Default for ActiveSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn pair(interval_minutes: u64) -> RepoPair {
        RepoPair {
            id: "p1".to_string(),
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

    #[test]
    fn never_checked_pair_is_due() {
        let entry = ScheduledEntry::new(pair(60));
        assert!(entry.is_due(Utc::now()));
    }

    #[test]
    fn pair_is_due_only_after_interval_elapses() {
        let mut entry = ScheduledEntry::new(pair(60));
        let now = Utc::now();
        entry.last_check = Some(now - ChronoDuration::minutes(30));
        assert!(!entry.is_due(now));

        entry.last_check = Some(now - ChronoDuration::minutes(61));
        assert!(entry.is_due(now));
    }

    #[test]
    fn star_sentinel_anywhere_means_all_branches() {
        let mut p = pair(60);
        p.sync_branches = vec!["release/*".to_string(), "*".to_string()];
        assert!(p.syncs_all_branches());

        p.sync_branches = vec!["release/*".to_string()];
        assert!(!p.syncs_all_branches());

        p.sync_branches = vec![];
        assert!(p.syncs_all_branches());
    }
}
