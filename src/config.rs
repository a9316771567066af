use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};

/// Global engine configuration. Unlike `RepoPair`, this is expected to be
/// mutated live via `Engine::update_config`, so fields that the pool
/// and scheduler read per-tick are kept small and `Clone`.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub work_dir: PathBuf,
    pub max_concurrent_syncs: usize,
    pub retry_on_failure: bool,
    pub retry_count: u32,
    pub git_timeout: Duration,
    pub scheduler_tick: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let work_dir =
            PathBuf::from(optional("WORK_DIR").unwrap_or_else(|| "/tmp/git-mirror".to_string()));
        let max_concurrent_syncs = optional("MAX_CONCURRENT_SYNCS")
            .as_deref()
            .unwrap_or("3")
            .parse::<usize>()
            .context("MAX_CONCURRENT_SYNCS must be an integer")?;
        let retry_on_failure = optional("RETRY_ON_FAILURE")
            .as_deref()
            .unwrap_or("true")
            .parse::<bool>()
            .context("RETRY_ON_FAILURE must be true or false")?;
        let retry_count = optional("RETRY_COUNT")
            .as_deref()
            .unwrap_or("3")
            .parse::<u32>()
            .context("RETRY_COUNT must be an integer")?;
        let git_timeout_seconds = optional("GIT_TIMEOUT_SECONDS")
            .as_deref()
            .unwrap_or("300")
            .parse::<u64>()
            .context("GIT_TIMEOUT_SECONDS must be an integer")?;
        let scheduler_tick_seconds = optional("SCHEDULER_TICK_SECONDS")
            .as_deref()
            .unwrap_or("30")
            .parse::<u64>()
            .context("SCHEDULER_TICK_SECONDS must be an integer")?;

        if max_concurrent_syncs == 0 {
            return Err(anyhow!("MAX_CONCURRENT_SYNCS must be > 0"));
        }
        if git_timeout_seconds == 0 {
            return Err(anyhow!("GIT_TIMEOUT_SECONDS must be > 0"));
        }
        if scheduler_tick_seconds == 0 {
            return Err(anyhow!("SCHEDULER_TICK_SECONDS must be > 0"));
        }

        Ok(Self {
            work_dir,
            max_concurrent_syncs,
            retry_on_failure,
            retry_count,
            git_timeout: Duration::from_secs(git_timeout_seconds),
            scheduler_tick: Duration::from_secs(scheduler_tick_seconds),
        })
    }

    pub fn ssh_keys_dir(&self) -> PathBuf {
        self.work_dir.join("ssh_keys")
    }

    pub fn mirror_dir(&self, pair_id: &str) -> PathBuf {
        self.work_dir.join(pair_id)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/git-mirror"),
            max_concurrent_syncs: 3,
            retry_on_failure: true,
            retry_count: 3,
            git_timeout: Duration::from_secs(300),
            scheduler_tick: Duration::from_secs(30),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|v| {
        let trimmed = v.trim().to_string();
        if trimmed.is_empty() { None } else { Some(trimmed) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_three_syncs_with_retry_and_five_minute_timeout() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_syncs, 3);
        assert!(config.retry_on_failure);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.git_timeout, Duration::from_secs(300));
        assert_eq!(config.scheduler_tick, Duration::from_secs(30));
    }

    #[test]
    fn mirror_dir_is_scoped_under_work_dir() {
        let config = EngineConfig {
            work_dir: PathBuf::from("/tmp/git-mirror"),
            ..EngineConfig::default()
        };
        assert_eq!(config.mirror_dir("p1"), PathBuf::from("/tmp/git-mirror/p1"));
        assert_eq!(
            config.ssh_keys_dir(),
            PathBuf::from("/tmp/git-mirror/ssh_keys")
        );
    }
}
