//! CSI error types.
//!
//! Every failure inside `libcsi` is a [`CsiError`]. The gRPC layer converts it
//! into a [`tonic::Status`] through the `From` impl at the bottom of this
//! file, which is the only place status codes are chosen.

use libpool::PoolError;
use thiserror::Error;
use tonic::{Code, Status};

/// Unified error type for CSI operations.
#[derive(Debug, Error)]
pub enum CsiError {
    /// Missing name, size or capabilities, or an access mode a PV type cannot
    /// honour.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A PV of the same name exists with a different size.
    #[error("volume {0} already exists with a different size")]
    AlreadyExists(String),

    /// The requested volume was not found on any pool.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// No candidate pool has room for the request.
    #[error("no pool can hold the request: {0}")]
    ResourceExhausted(String),

    /// ListVolumes cannot continue: no pool yet or a stale token.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A helper binary exited non-zero.
    #[error("command `{cmd}` failed (rc={rc}): {stderr}")]
    CommandFailed {
        cmd: String,
        rc: i32,
        stderr: String,
    },

    /// A retried filesystem call kept failing with `ENOTCONN`.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed { path: String, reason: String },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed { path: String, reason: String },

    /// The pool layer (ledger, descriptors, filesystem) returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::VolumeNotFound(_) => Code::NotFound,
            Self::ResourceExhausted(_) => Code::ResourceExhausted,
            Self::Aborted(_) => Code::Aborted,
            Self::CommandFailed { .. }
            | Self::Timeout(_)
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => Code::Internal,
        }
    }
}

impl From<PoolError> for CsiError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::CommandFailed {
                cmd, rc, stderr, ..
            } => Self::CommandFailed { cmd, rc, stderr },
            PoolError::Timeout { .. } => Self::Timeout(e.to_string()),
            other => Self::BackendError(other.to_string()),
        }
    }
}

impl From<CsiError> for Status {
    fn from(e: CsiError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}
