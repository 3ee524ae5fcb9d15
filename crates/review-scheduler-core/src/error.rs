use crate::{PairKey, ProgressRecord};

/// Failures surfaced by a [`crate::ProgressStore`].
///
/// The variants separate failures a caller may safely retry from those
/// where the write may or may not have landed.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// The operation failed before anything was written.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The write may have been applied; retrying could double-process an outcome.
    #[error("store outcome ambiguous: {0}")]
    Ambiguous(String),
    /// The stored revision no longer matches the one the write was computed from.
    #[error("revision conflict for {key}: expected {expected}, found {found:?}")]
    Conflict {
        key: PairKey,
        expected: u64,
        found: Option<u64>,
    },
    #[error("store timeout: {0}")]
    Timeout(String),
    #[error("stored data corrupt: {0}")]
    Corrupt(String),
    /// The value cannot be encoded by this store; nothing was written.
    #[error("value not representable in store: {0}")]
    Unrepresentable(String),
}

impl StoreError {
    /// True when nothing was written and the same call can be repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Conflict { .. } | Self::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("event sink append failed: {0}")]
pub struct SinkError(pub String);

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    #[error("no progress record for {key}")]
    NotFound { key: PairKey },
    #[error("progress record already tracked for {key}")]
    AlreadyTracked { key: PairKey },
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Only raised under [`crate::AuditPolicy::Required`]; the record was committed.
    #[error("review for {} committed but audit append failed: {source}", .record.key())]
    AuditFailed {
        record: Box<ProgressRecord>,
        source: SinkError,
    },
    #[error("invalid outcome: {0}")]
    InvalidOutcome(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SchedulerError {
    /// Stable machine-readable code for envelopes and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyTracked { .. } => "already_tracked",
            Self::Store(StoreError::Unavailable(_)) => "store_unavailable",
            Self::Store(StoreError::Ambiguous(_)) => "store_ambiguous",
            Self::Store(StoreError::Conflict { .. }) => "store_conflict",
            Self::Store(StoreError::Timeout(_)) => "store_timeout",
            Self::Store(StoreError::Corrupt(_)) => "store_corrupt",
            Self::Store(StoreError::Unrepresentable(_)) => "store_unrepresentable",
            Self::AuditFailed { .. } => "audit_failed",
            Self::InvalidOutcome(_) => "invalid_outcome",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
        }
    }
}
