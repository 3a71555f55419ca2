use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use super::{ErrorClass, FinalError};
use crate::state_bits::{BehaviorFlag, StateBits};

type Cause = Arc<dyn StdError + Send + Sync>;

/// A failed step inside an attempt, with directives for what happens next.
#[derive(Debug, Clone, Error)]
#[error("transaction operation failed ({class:?}, rollback: {auto_rollback}, retry: {retry})")]
pub struct TransactionOperationFailed {
    class: ErrorClass,
    auto_rollback: bool,
    retry: bool,
    to_raise: FinalError,
    #[source]
    cause: Option<Cause>,
}

impl TransactionOperationFailed {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        self.class
    }

    /// Whether the attempt should be rolled back before giving up.
    #[must_use]
    pub const fn auto_rollback(&self) -> bool {
        self.auto_rollback
    }

    /// Whether the whole transaction may run another attempt.
    #[must_use]
    pub const fn retry(&self) -> bool {
        self.retry
    }

    #[must_use]
    pub const fn to_raise(&self) -> FinalError {
        self.to_raise
    }

    #[must_use]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// The same failure, but rollback has already been attempted.
    #[must_use]
    pub(crate) fn without_rollback(&self) -> Self {
        Self {
            auto_rollback: false,
            ..self.clone()
        }
    }
}

/// Assembles a [`TransactionOperationFailed`].
///
/// Defaults: roll back, do not retry, raise `Failed`.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    class: ErrorClass,
    auto_rollback: bool,
    retry: bool,
    to_raise: FinalError,
    cause: Option<Cause>,
}

impl ErrorBuilder {
    #[must_use]
    pub const fn new(class: ErrorClass) -> Self {
        Self {
            class,
            auto_rollback: true,
            retry: false,
            to_raise: FinalError::Failed,
            cause: None,
        }
    }

    #[must_use]
    pub const fn do_not_rollback(mut self) -> Self {
        self.auto_rollback = false;
        self
    }

    #[must_use]
    pub const fn retry_transaction(mut self) -> Self {
        self.retry = true;
        self
    }

    #[must_use]
    pub const fn raise(mut self, to_raise: FinalError) -> Self {
        self.to_raise = to_raise;
        self
    }

    #[must_use]
    pub fn cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    #[must_use]
    pub fn shared_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    #[must_use]
    pub fn build(self) -> TransactionOperationFailed {
        TransactionOperationFailed {
            class: self.class,
            auto_rollback: self.auto_rollback,
            retry: self.retry,
            to_raise: self.to_raise,
            cause: self.cause,
        }
    }

    /// Build, merging this failure's directives into the attempt's state.
    ///
    /// Any failure forbids commit; the rollback and retry directives become
    /// sticky for the rest of the attempt.
    #[must_use]
    pub fn build_into(self, bits: &StateBits) -> TransactionOperationFailed {
        let mut flags = vec![BehaviorFlag::CommitNotAllowed];
        if !self.auto_rollback {
            flags.push(BehaviorFlag::ShouldNotRollback);
        }
        if !self.retry {
            flags.push(BehaviorFlag::ShouldNotRetry);
        }
        bits.merge(&flags, self.to_raise);
        self.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvError;

    #[test]
    fn test_builder_defaults() {
        let err = ErrorBuilder::new(ErrorClass::FailOther).build();
        assert!(err.auto_rollback());
        assert!(!err.retry());
        assert_eq!(err.to_raise(), FinalError::Failed);
        assert!(err.cause().is_none());
    }

    #[test]
    fn test_builder_directives() {
        let err = ErrorBuilder::new(ErrorClass::FailExpiry)
            .do_not_rollback()
            .retry_transaction()
            .raise(FinalError::Expired)
            .cause(KvError::AmbiguousTimeout)
            .build();
        assert_eq!(err.class(), ErrorClass::FailExpiry);
        assert!(!err.auto_rollback());
        assert!(err.retry());
        assert_eq!(err.to_raise(), FinalError::Expired);
        assert_eq!(
            err.cause().map(ToString::to_string).as_deref(),
            Some("operation timed out ambiguously")
        );
        assert!(!err.without_rollback().auto_rollback());
    }

    #[test]
    fn test_build_into_merges_state() {
        let bits = StateBits::new();
        let _ = ErrorBuilder::new(ErrorClass::FailTransient)
            .retry_transaction()
            .build_into(&bits);
        assert!(bits.has(BehaviorFlag::CommitNotAllowed));
        assert!(!bits.has(BehaviorFlag::ShouldNotRetry));
        assert!(!bits.has(BehaviorFlag::ShouldNotRollback));
        assert_eq!(bits.final_error(), FinalError::Failed);

        let _ = ErrorBuilder::new(ErrorClass::FailHard)
            .do_not_rollback()
            .raise(FinalError::FailedPostCommit)
            .build_into(&bits);
        assert!(bits.has(BehaviorFlag::ShouldNotRetry));
        assert!(bits.has(BehaviorFlag::ShouldNotRollback));
        assert_eq!(bits.final_error(), FinalError::FailedPostCommit);

        let _ = ErrorBuilder::new(ErrorClass::FailOther).build_into(&bits);
        assert_eq!(bits.final_error(), FinalError::FailedPostCommit);
    }
}
