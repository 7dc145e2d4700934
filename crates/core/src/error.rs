use crate::kvs::KvsError;
use crate::state::IndexState;
use crate::tuple::{TupleError, Versionstamp};

/// Errors surfaced by maintainers and index-side query primitives.
///
/// Transient store errors stay wrapped in [`IndexError::Kvs`] so callers
/// can apply their retry policy without string matching.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid key encoding: {0}")]
    InvalidKey(#[from] TupleError),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index {0} is not readable")]
    IndexNotReadable(String),

    #[error("index {index} is in unexpected state {state:?}")]
    InvalidIndexState { index: String, state: IndexState },

    #[error("invalid state transition for index {index}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        index: String,
        from: IndexState,
        to: IndexState,
    },

    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionMismatch {
        expected: Versionstamp,
        actual: Versionstamp,
    },

    #[error("no version found, expected {0}")]
    VersionNotFound(Versionstamp),

    #[error("graph for index {index} is not built: {message}")]
    GraphNotBuilt { index: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Kvs(#[from] KvsError),
}

impl IndexError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the underlying condition is a transient store error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kvs(inner) if inner.is_retryable())
    }
}
