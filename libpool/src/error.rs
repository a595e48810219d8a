//! Pool-level error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, accounting for, or serving a storage pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A filesystem call failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A descriptor or info file could not be (de)serialized.
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The pool ledger rejected a query or commit.
    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    /// A subprocess exited with a non-zero status.
    #[error("command `{cmd}` failed (rc={rc}): {stderr}")]
    CommandFailed {
        cmd: String,
        rc: i32,
        stdout: String,
        stderr: String,
    },

    /// A retried operation did not succeed before its deadline.
    #[error("timed out after {seconds}s: {context}")]
    Timeout { context: String, seconds: u64 },

    /// A pool descriptor violates the topology rules.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A raw syscall failed.
    #[error("{context}: {errno}")]
    Sys {
        context: String,
        errno: nix::errno::Errno,
    },
}

impl PoolError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn sys(context: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Self::Sys {
            context: context.into(),
            errno,
        }
    }

    /// `true` for a failed command whose stderr mentions `needle`.
    pub fn stderr_contains(&self, needle: &str) -> bool {
        matches!(self, Self::CommandFailed { stderr, stdout, .. }
            if stderr.contains(needle) || stdout.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let err = PoolError::CommandFailed {
            cmd: "mount /dev/sdb /bricks".into(),
            rc: 32,
            stdout: String::new(),
            stderr: "wrong fs type, bad option".into(),
        };
        assert_eq!(
            err.to_string(),
            "command `mount /dev/sdb /bricks` failed (rc=32): wrong fs type, bad option"
        );
        assert!(err.stderr_contains("wrong fs type"));
        assert!(!err.stderr_contains("already mounted"));
    }
}
