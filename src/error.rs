//! Error types shared by every module of the crate.

use thiserror::Error;

/// Result type alias using [`TrieError`].
pub type Result<T> = std::result::Result<T, TrieError>;

/// Boxed error produced by a reduction step.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by trie, buffer and reclamation operations.
///
/// Absence of a key is never an error: `contains` answers `false` and
/// `insert`/`remove` hand back the unchanged version.
#[derive(Error, Debug)]
pub enum TrieError {
    /// The arena cannot satisfy an allocation. Retryable once versions or
    /// buffers have been released.
    #[error("out of memory: requested {requested} bytes with {in_use} of {capacity} in use")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        capacity: usize,
    },

    /// Bookkeeping or structural corruption was detected. Never retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The step function of a reduction failed.
    #[error("reduction step failed: {0}")]
    Consumer(#[source] BoxError),

    /// The key exceeds the configured maximum key length.
    #[error("key of {len} bytes exceeds the maximum of {max}")]
    KeyTooLong { len: usize, max: usize },
}

impl TrieError {
    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        TrieError::InvariantViolation(msg.into())
    }

    /// Wrap an error raised by a reduction step
    pub fn consumer(err: impl Into<BoxError>) -> Self {
        TrieError::Consumer(err.into())
    }

    /// `true` for errors that indicate corrupted state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrieError::InvariantViolation(_))
    }

    /// `true` if the operation may succeed after memory has been freed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrieError::OutOfMemory { .. })
    }
}

/// Errors raised while loading or installing a [`Config`](crate::Config).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("output buffers of {output_len} bytes cannot hold keys of {max_key_len} bytes")]
    OutputTooSmall {
        output_len: usize,
        max_key_len: usize,
    },

    #[error("maximum key length must be at least one byte")]
    ZeroKeyLen,

    #[error("configuration was already installed")]
    AlreadyInstalled,
}
