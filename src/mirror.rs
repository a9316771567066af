use std::{collections::HashMap, path::Path};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    branch_filter,
    config::EngineConfig,
    credentials::{SshKeyFile, authorize_url, prepare_ssh, select_ssh_key},
    error::EngineError,
    git_runner::GitRunner,
    model::RepoPair,
};

pub struct MirrorResult {
    pub message: String,
    pub branches_synced: Vec<String>,
    pub tags_synced: u64,
}

/// Performs clone-or-fetch, branch filtering, destination remote rebinding,
/// and force mirror push for one pair. Never logs an authorized URL — only
/// the pair's original `source_url`/`destination_url` are ever passed to
/// `tracing`.
pub async fn run_mirror(
    config: &EngineConfig,
    runner: &GitRunner,
    pair: &RepoPair,
    abort_signal: &CancellationToken,
) -> Result<MirrorResult, EngineError> {
    let mirror_dir = config.mirror_dir(&pair.id);
    let auth_source = authorize_url(&pair.source_url, pair.source_credentials.as_ref());
    let auth_dest = authorize_url(&pair.destination_url, pair.destination_credentials.as_ref());

    let ssh_key_file = materialize_ssh_key(config, pair)?;
    let env = build_env(ssh_key_file.as_ref());

    let result = mirror_inner(
        &mirror_dir,
        runner,
        pair,
        &auth_source,
        &auth_dest,
        &env,
        abort_signal,
    )
    .await;

    // Deletion happens via `SshKeyFile`'s `Drop`, which runs here
    // regardless of `result`'s outcome (success, error, or abort).
    drop(ssh_key_file);

    result
}

fn materialize_ssh_key(
    config: &EngineConfig,
    pair: &RepoPair,
) -> Result<Option<SshKeyFile>, EngineError> {
    match select_ssh_key(pair) {
        Some((side, key_text)) => Ok(Some(prepare_ssh(
            &config.ssh_keys_dir(),
            &pair.id,
            side,
            key_text.to_string(),
        )?)),
        None => Ok(None),
    }
}

fn build_env(ssh_key_file: Option<&SshKeyFile>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }
    if let Ok(home) = std::env::var("HOME") {
        env.insert("HOME".to_string(), home);
    }
    if let Some(key_file) = ssh_key_file {
        env.insert("GIT_SSH_COMMAND".to_string(), key_file.ssh_command());
    }
    env
}

#[allow(clippy::too_many_arguments)]
async fn mirror_inner(
    mirror_dir: &Path,
    runner: &GitRunner,
    pair: &RepoPair,
    auth_source: &str,
    auth_dest: &str,
    env: &HashMap<String, String>,
    abort_signal: &CancellationToken,
) -> Result<MirrorResult, EngineError> {
    ensure_local_mirror(mirror_dir, runner, pair, auth_source, env, abort_signal).await?;

    let all_branches = enumerate_branches(mirror_dir, runner, env, abort_signal).await?;
    let branches_synced = filter_branches(&all_branches, &pair.sync_branches);

    // "Keep" in the filter step means the local mirror itself only keeps
    // the matched branches: the push below is an unconditional `--mirror`/
    // `--all` of the local mirror, so excluded branches must be pruned
    // locally first or they would reach the destination too (and, via
    // `--mirror`, never get deleted there once a non-matching branch lands).
    prune_excluded_branches(mirror_dir, runner, &all_branches, &branches_synced, env, abort_signal)
        .await?;

    rebind_destination_remote(mirror_dir, runner, auth_dest, env, abort_signal).await?;

    push(mirror_dir, runner, pair.sync_tags, env, abort_signal).await?;

    let tags_synced = if pair.sync_tags {
        count_tags(mirror_dir, runner, env, abort_signal).await?
    } else {
        0
    };

    Ok(MirrorResult {
        message: "sync completed successfully".to_string(),
        branches_synced,
        tags_synced,
    })
}

/// Reuse a valid mirror by fetching; otherwise (re)clone.
async fn ensure_local_mirror(
    mirror_dir: &Path,
    runner: &GitRunner,
    pair: &RepoPair,
    auth_source: &str,
    env: &HashMap<String, String>,
    abort_signal: &CancellationToken,
) -> Result<(), EngineError> {
    if mirror_dir.join("HEAD").exists() {
        info!(pair_id = %pair.id, "fetching updates for existing mirror");
        runner
            .run(
                &["remote", "set-url", "origin", auth_source],
                mirror_dir,
                env,
                abort_signal,
            )
            .await?;
        runner
            .run(&["fetch", "--all", "--prune"], mirror_dir, env, abort_signal)
            .await?;
        return Ok(());
    }

    if mirror_dir.exists() {
        info!(pair_id = %pair.id, dir = %mirror_dir.display(), "removing corrupt mirror directory");
        std::fs::remove_dir_all(mirror_dir)
            .map_err(|e| EngineError::Git { stderr: format!("failed removing corrupt mirror dir: {e}"), exit_code: -1 })?;
    }

    let parent = mirror_dir.parent().unwrap_or(mirror_dir);
    std::fs::create_dir_all(parent)
        .map_err(|e| EngineError::Git { stderr: format!("failed creating work dir: {e}"), exit_code: -1 })?;

    info!(pair_id = %pair.id, dir = %mirror_dir.display(), "cloning mirror");
    let mirror_dir_str = mirror_dir.to_string_lossy().to_string();
    runner
        .run(
            &["clone", "--mirror", auth_source, &mirror_dir_str],
            parent,
            env,
            abort_signal,
        )
        .await?;
    Ok(())
}

/// Mirror clones store branches without an `origin/` prefix.
async fn enumerate_branches(
    mirror_dir: &Path,
    runner: &GitRunner,
    env: &HashMap<String, String>,
    abort_signal: &CancellationToken,
) -> Result<Vec<String>, EngineError> {
    let output = runner.run(&["branch"], mirror_dir, env, abort_signal).await?;
    Ok(parse_branch_lines(&output))
}

fn parse_branch_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_start_matches('*').trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Keeps the enumeration order, suppresses duplicates, and matches any glob
/// pattern unless `"*"` is present (or the pattern list is empty), in which
/// case everything is kept. Pattern matching follows shell/fnmatch
/// semantics, not path-glob semantics: `*` matches across `/` so a pattern
/// like `release*` also matches `release/1.0`.
fn filter_branches(all_branches: &[String], sync_branches: &[String]) -> Vec<String> {
    let sync_all = sync_branches.is_empty() || sync_branches.iter().any(|p| p == "*");

    let mut seen = std::collections::HashSet::new();
    all_branches
        .iter()
        .filter(|branch| {
            sync_all
                || sync_branches
                    .iter()
                    .any(|pattern| branch_filter::matches(branch, pattern))
        })
        .filter(|branch| seen.insert((*branch).clone()))
        .cloned()
        .collect()
}

/// Deletes local branches the filter excluded, so the unconditional
/// `--mirror`/`--all` push below only ever sees the kept set. A no-op when
/// `branches_synced` already covers every enumerated branch.
async fn prune_excluded_branches(
    mirror_dir: &Path,
    runner: &GitRunner,
    all_branches: &[String],
    branches_synced: &[String],
    env: &HashMap<String, String>,
    abort_signal: &CancellationToken,
) -> Result<(), EngineError> {
    let keep: std::collections::HashSet<&str> =
        branches_synced.iter().map(|s| s.as_str()).collect();
    for branch in all_branches {
        if keep.contains(branch.as_str()) {
            continue;
        }
        runner
            .run(&["branch", "-D", branch], mirror_dir, env, abort_signal)
            .await?;
    }
    Ok(())
}

/// Never propagate an "already exists" add-failure as the operation's
/// error — fall through to `remote set-url`.
async fn rebind_destination_remote(
    mirror_dir: &Path,
    runner: &GitRunner,
    auth_dest: &str,
    env: &HashMap<String, String>,
    abort_signal: &CancellationToken,
) -> Result<(), EngineError> {
    let add_result = runner
        .run(&["remote", "add", "destination", auth_dest], mirror_dir, env, abort_signal)
        .await;

    if add_result.is_err() {
        runner
            .run(&["remote", "set-url", "destination", auth_dest], mirror_dir, env, abort_signal)
            .await?;
    }
    Ok(())
}

/// `--mirror` replicates all refs including tag deletions; `--all` pushes
/// branches only and leaves destination tags untouched.
async fn push(
    mirror_dir: &Path,
    runner: &GitRunner,
    sync_tags: bool,
    env: &HashMap<String, String>,
    abort_signal: &CancellationToken,
) -> Result<(), EngineError> {
    let args: &[&str] = if sync_tags {
        &["push", "destination", "--mirror", "--force"]
    } else {
        &["push", "destination", "--all", "--force"]
    };
    runner.run(args, mirror_dir, env, abort_signal).await?;
    Ok(())
}

async fn count_tags(
    mirror_dir: &Path,
    runner: &GitRunner,
    env: &HashMap<String, String>,
    abort_signal: &CancellationToken,
) -> Result<u64, EngineError> {
    let output = runner.run(&["tag", "-l"], mirror_dir, env, abort_signal).await?;
    Ok(output.lines().filter(|l| !l.trim().is_empty()).count() as u64)
}
