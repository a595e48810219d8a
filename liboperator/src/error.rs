use thiserror::Error;

use libpool::PoolError;

#[derive(Debug, Error)]
pub enum OperatorError {
    /// The custom resource is malformed.
    #[error("invalid KadaluStorage {name}: {reason}")]
    Validation { name: String, reason: String },

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl OperatorError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
