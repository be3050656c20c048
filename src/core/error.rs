//! Error types for lease, store and scheduler operations.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`LeaseStore`](crate::infra::store::LeaseStore) backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Classified outcomes of lease operations.
///
/// Callers branch on the variant, never on the rendered message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// Another holder owns the key. Expected under contention.
    #[error("lock acquisition failed: {key}")]
    AcquisitionFailed {
        /// Key that could not be claimed.
        key: String,
    },
    /// The job-scoped run key is still held by a previous run.
    #[error("task still running: {key}")]
    TaskStillRunning {
        /// Run key that is still held.
        key: String,
    },
    /// The stored value no longer matches this lease's token.
    #[error("lock release failed: {0}")]
    ReleaseFailed(String),
    /// The lease was lost before it could be renewed.
    #[error("lock renewal failed: {0}")]
    RenewalFailed(String),
    /// Spin acquisition gave up after the given timeout.
    #[error("spin lock timeout after {0:?}")]
    SpinLockTimeout(Duration),
    /// The external cancellation signal fired while spinning.
    #[error("lock acquisition cancelled")]
    Cancelled,
    /// Another instance won the first-run fence.
    #[error("first-run fencing denied: {key}")]
    FencingDenied {
        /// Fence key that was already set.
        key: String,
    },
    /// The store call itself failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// True for denials that are part of normal multi-instance contention.
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::AcquisitionFailed { .. } | Self::FencingDenied { .. })
    }
}

/// Errors produced by the scheduler facade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An entry with the same name is already registered.
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),
    /// No entry with the given name or id exists.
    #[error("unknown entry: {0}")]
    UnknownEntry(String),
    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Store failure outside the locking path.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
