use thiserror::Error;

/// Failures reported by the key-value layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("document not found")]
    DocumentNotFound,
    #[error("document already exists")]
    DocumentExists,
    #[error("CAS mismatch")]
    CasMismatch,
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("path already exists: {0}")]
    PathExists(String),
    #[error("operation timed out ambiguously")]
    AmbiguousTimeout,
    #[error("operation timed out")]
    UnambiguousTimeout,
    #[error("durability requirement ambiguous")]
    DurabilityAmbiguous,
    #[error("durability requirement impossible")]
    DurabilityImpossible,
    #[error("temporary failure, try again")]
    TemporaryFailure,
    #[error("request canceled")]
    RequestCanceled,
    #[error("value too large")]
    ValueTooLarge,
    #[error("a transaction is already in progress on this document")]
    TransactionAlreadyInProgress,
    #[error("could not decode value: {0}")]
    Decoding(String),
    #[error("internal server error: {0}")]
    Internal(String),
}
