use thiserror::Error;

/// The five error kinds a sync worker can observe, per the propagation
/// policy in the engine's error handling design: a worker never lets these
/// escape to the scheduler or façade, it turns them into a log entry and a
/// store status update.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("git exited with status {exit_code}: {stderr}")]
    Git { stderr: String, exit_code: i32 },

    #[error("git command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("sync aborted")]
    Aborted,

    #[error("credential error: {0}")]
    Credential(String),

    #[error("repo-pair store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Whether the worker's retry loop should attempt another pass.
    /// `Aborted` is explicitly excluded: a cancellation is never retried.
    pub fn retryable(&self) -> bool {
        match self {
            EngineError::Git { .. } => true,
            EngineError::Timeout(_) => true,
            EngineError::Aborted => false,
            EngineError::Credential(_) => true,
            EngineError::Store(_) => true,
        }
    }

    /// Short excerpt suitable for `last_sync_error` / a log entry's `error`
    /// field. Never includes an authorized URL — callers must only ever
    /// construct these from stderr/messages that never embedded credentials.
    pub fn excerpt(&self) -> String {
        let full = self.to_string();
        const MAX: usize = 2000;
        if full.len() <= MAX {
            return full;
        }
        // Truncate on a char boundary: git stderr from a remote can contain
        // multibyte UTF-8, and slicing at a raw byte offset would panic if
        // it lands inside a character.
        let cutoff = full
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX)
            .last()
            .unwrap_or(0);
        format!("{}…", &full[..cutoff])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_leaves_short_messages_untouched() {
        let err = EngineError::Git { stderr: "fatal: not found".to_string(), exit_code: 128 };
        assert_eq!(err.excerpt(), err.to_string());
    }

    #[test]
    fn excerpt_truncates_long_messages_without_panicking_on_multibyte_boundary() {
        // A run of 3-byte characters guarantees some character straddles
        // byte offset 2000 regardless of a fixed-width ASCII prefix, which
        // is exactly the case a raw `&s[..2000]` slice panics on.
        let stderr = "日".repeat(800);
        let err = EngineError::Git { stderr, exit_code: 1 };

        let excerpt = err.excerpt();

        assert!(excerpt.ends_with('…'));
        assert!(excerpt.len() <= 2000 + '…'.len_utf8());
    }
}
