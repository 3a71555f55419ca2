//! Error taxonomy for transactions.
//!
//! Raw failures (`KvError`, `OpError`) are classified into an [`ErrorClass`]
//! at the point they occur. The step that observed them then decides, through
//! an [`ErrorBuilder`], whether to retry the step, retry the transaction, roll
//! back, or give up; the result travels as a [`TransactionOperationFailed`].
//! The application sees [`AttemptError`] inside the lambda and
//! [`TransactionError`] from `run`.

mod builder;
pub(crate) mod triage;

use std::error::Error as StdError;

use thiserror::Error;

use crate::kv::KvError;
use crate::query::QueryError;

pub use builder::{ErrorBuilder, TransactionOperationFailed};

/// Coarse classification that drives retry and rollback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    FailTransient,
    FailHard,
    FailOther,
    FailAmbiguous,
    FailDocAlreadyExists,
    FailDocNotFound,
    FailPathAlreadyExists,
    FailPathNotFound,
    FailCasMismatch,
    FailExpiry,
    FailWriteWriteConflict,
    FailAtrFull,
    Undefined,
}

impl ErrorClass {
    #[must_use]
    pub const fn classify(err: &KvError) -> Self {
        match err {
            KvError::DocumentNotFound => Self::FailDocNotFound,
            KvError::DocumentExists => Self::FailDocAlreadyExists,
            KvError::CasMismatch => Self::FailCasMismatch,
            KvError::PathNotFound(_) => Self::FailPathNotFound,
            KvError::PathExists(_) => Self::FailPathAlreadyExists,
            KvError::TemporaryFailure => Self::FailTransient,
            KvError::AmbiguousTimeout
            | KvError::DurabilityAmbiguous
            | KvError::RequestCanceled => Self::FailAmbiguous,
            KvError::ValueTooLarge => Self::FailAtrFull,
            KvError::DurabilityImpossible | KvError::Internal(_) => Self::FailHard,
            KvError::TransactionAlreadyInProgress
            | KvError::UnambiguousTimeout
            | KvError::Decoding(_) => Self::FailOther,
        }
    }
}

/// The outcome a failed transaction surfaces, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u64)]
pub enum FinalError {
    #[default]
    Success = 0,
    Failed = 1,
    Expired = 2,
    CommitAmbiguous = 3,
    FailedPostCommit = 4,
}

impl FinalError {
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Success,
            1 => Self::Failed,
            2 => Self::Expired,
            3 => Self::CommitAmbiguous,
            _ => Self::FailedPostCommit,
        }
    }
}

/// Failures raised inside the protocol before they are triaged.
#[derive(Debug, Clone, Error)]
pub enum OpError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("attempt expired")]
    AttemptExpired,
    #[error("ATR entry for attempt {0} not found")]
    AtrEntryNotFound(String),
    #[error("document {0} is being written by another transaction")]
    WriteWriteConflict(String),
    #[error("forward compatibility failure at {0}")]
    ForwardCompatibility(String),
    #[error("previous operation in this attempt failed")]
    PreviousOperationFailed,
    #[error("commit not permitted: {0}")]
    CommitNotPermitted(&'static str),
    #[error("rollback not permitted: {0}")]
    RollbackNotPermitted(&'static str),
    #[error("illegal document state: {0}")]
    IllegalState(String),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl OpError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Kv(err) => ErrorClass::classify(err),
            Self::AttemptExpired => ErrorClass::FailExpiry,
            Self::AtrEntryNotFound(_) => ErrorClass::FailPathNotFound,
            Self::WriteWriteConflict(_) => ErrorClass::FailWriteWriteConflict,
            Self::Query(err) => err.class(),
            Self::ForwardCompatibility(_)
            | Self::PreviousOperationFailed
            | Self::CommitNotPermitted(_)
            | Self::RollbackNotPermitted(_)
            | Self::IllegalState(_) => ErrorClass::FailOther,
        }
    }
}

/// What an operation inside the transaction lambda can fail with.
///
/// `DocumentNotFound` and `DocumentExists` may be handled by the application
/// and the attempt continues. Returning any error from the lambda rolls the
/// attempt back.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    OperationFailed(#[from] TransactionOperationFailed),
    #[error("document {id} not found")]
    DocumentNotFound { id: String },
    #[error("document {id} already exists")]
    DocumentExists { id: String },
    #[error(transparent)]
    Application(Box<dyn StdError + Send + Sync>),
}

impl AttemptError {
    pub fn application(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Application(err.into())
    }
}

/// Final outcome of a transaction that did not commit.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction {transaction_id} failed")]
    Failed {
        transaction_id: String,
        #[source]
        cause: TransactionOperationFailed,
        /// Failures of the attempts before the last one, oldest first.
        earlier_attempts: Vec<TransactionOperationFailed>,
    },
    #[error("transaction {transaction_id} expired")]
    Expired {
        transaction_id: String,
        #[source]
        cause: TransactionOperationFailed,
        earlier_attempts: Vec<TransactionOperationFailed>,
    },
    /// The commit point may or may not have been reached.
    #[error("transaction {transaction_id} commit ambiguous")]
    CommitAmbiguous {
        transaction_id: String,
        #[source]
        cause: TransactionOperationFailed,
        earlier_attempts: Vec<TransactionOperationFailed>,
    },
}

impl TransactionError {
    #[must_use]
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Failed { transaction_id, .. }
            | Self::Expired { transaction_id, .. }
            | Self::CommitAmbiguous { transaction_id, .. } => transaction_id,
        }
    }

    #[must_use]
    pub const fn cause(&self) -> &TransactionOperationFailed {
        match self {
            Self::Failed { cause, .. }
            | Self::Expired { cause, .. }
            | Self::CommitAmbiguous { cause, .. } => cause,
        }
    }

    /// Every attempt's failure in the order the attempts ran. The last one
    /// is [`Self::cause`].
    pub fn attempt_causes(&self) -> impl Iterator<Item = &TransactionOperationFailed> {
        let (Self::Failed {
            cause,
            earlier_attempts,
            ..
        }
        | Self::Expired {
            cause,
            earlier_attempts,
            ..
        }
        | Self::CommitAmbiguous {
            cause,
            earlier_attempts,
            ..
        }) = self;
        earlier_attempts.iter().chain(std::iter::once(cause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_kv_errors() {
        let cases = [
            (KvError::CasMismatch, ErrorClass::FailCasMismatch),
            (KvError::DocumentNotFound, ErrorClass::FailDocNotFound),
            (KvError::DocumentExists, ErrorClass::FailDocAlreadyExists),
            (
                KvError::PathNotFound("p".to_string()),
                ErrorClass::FailPathNotFound,
            ),
            (
                KvError::PathExists("p".to_string()),
                ErrorClass::FailPathAlreadyExists,
            ),
            (KvError::AmbiguousTimeout, ErrorClass::FailAmbiguous),
            (KvError::DurabilityAmbiguous, ErrorClass::FailAmbiguous),
            (KvError::RequestCanceled, ErrorClass::FailAmbiguous),
            (KvError::TemporaryFailure, ErrorClass::FailTransient),
            (KvError::ValueTooLarge, ErrorClass::FailAtrFull),
            (KvError::DurabilityImpossible, ErrorClass::FailHard),
            (KvError::TransactionAlreadyInProgress, ErrorClass::FailOther),
        ];
        for (err, class) in cases {
            assert_eq!(ErrorClass::classify(&err), class, "{err}");
        }
    }

    #[test]
    fn test_op_error_class() {
        assert_eq!(OpError::AttemptExpired.class(), ErrorClass::FailExpiry);
        assert_eq!(
            OpError::WriteWriteConflict("d".to_string()).class(),
            ErrorClass::FailWriteWriteConflict
        );
        assert_eq!(
            OpError::Kv(KvError::CasMismatch).class(),
            ErrorClass::FailCasMismatch
        );
        assert_eq!(
            OpError::CommitNotPermitted("rolled back").class(),
            ErrorClass::FailOther
        );
    }

    #[test]
    fn test_final_error_ordering() {
        assert!(FinalError::Success < FinalError::Failed);
        assert!(FinalError::Failed < FinalError::Expired);
        assert!(FinalError::Expired < FinalError::CommitAmbiguous);
        assert!(FinalError::CommitAmbiguous < FinalError::FailedPostCommit);
        for e in [
            FinalError::Success,
            FinalError::Failed,
            FinalError::Expired,
            FinalError::CommitAmbiguous,
            FinalError::FailedPostCommit,
        ] {
            assert_eq!(FinalError::from_bits(e as u64), e);
        }
    }

    #[test]
    fn test_transaction_error_source_chain() {
        let tof = ErrorBuilder::new(ErrorClass::FailHard)
            .cause(OpError::Kv(KvError::DurabilityImpossible))
            .build();
        let err = TransactionError::Failed {
            transaction_id: "t1".to_string(),
            cause: tof,
            earlier_attempts: vec![ErrorBuilder::new(ErrorClass::FailTransient).build()],
        };
        assert_eq!(err.transaction_id(), "t1");
        let classes: Vec<_> = err.attempt_causes().map(TransactionOperationFailed::class).collect();
        assert_eq!(classes, vec![ErrorClass::FailTransient, ErrorClass::FailHard]);
        let first = err.source().unwrap();
        let second = first.source().unwrap();
        assert_eq!(second.to_string(), "durability requirement impossible");
    }
}
