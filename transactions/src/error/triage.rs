//! Fixed decision tables for protocol steps whose handling depends only on
//! the error class and whether the attempt is in expiry overtime.
//!
//! Steps with richer handling (staged insert, ATR commit, unstaging inserts
//! and replaces) triage inline where they have the state they need.

use super::{ErrorBuilder, ErrorClass, FinalError};

#[derive(Debug, Clone)]
pub enum Triage {
    /// Repeat the step.
    Retry,
    /// The failure shows the step's goal is already met.
    Done,
    /// Switch into expiry overtime, then repeat the step.
    EnterOvertime,
    Fail(ErrorBuilder),
}

fn expired_in_overtime() -> Triage {
    Triage::Fail(
        ErrorBuilder::new(ErrorClass::FailExpiry)
            .do_not_rollback()
            .raise(FinalError::Expired),
    )
}

/// A non-transactional read of a document.
pub fn get(class: ErrorClass) -> Triage {
    match class {
        ErrorClass::FailDocNotFound => Triage::Done,
        ErrorClass::FailHard => Triage::Fail(ErrorBuilder::new(class).do_not_rollback()),
        ErrorClass::FailTransient => Triage::Fail(ErrorBuilder::new(class).retry_transaction()),
        ErrorClass::FailExpiry => {
            Triage::Fail(ErrorBuilder::new(class).raise(FinalError::Expired))
        }
        _ => Triage::Fail(ErrorBuilder::new(class)),
    }
}

/// Staging a replace or a remove.
pub fn create_staged_replace_or_remove(class: ErrorClass) -> Triage {
    match class {
        ErrorClass::FailExpiry => {
            Triage::Fail(ErrorBuilder::new(class).raise(FinalError::Expired))
        }
        ErrorClass::FailDocNotFound
        | ErrorClass::FailDocAlreadyExists
        | ErrorClass::FailCasMismatch
        | ErrorClass::FailTransient
        | ErrorClass::FailAmbiguous => Triage::Fail(ErrorBuilder::new(class).retry_transaction()),
        ErrorClass::FailHard => Triage::Fail(ErrorBuilder::new(class).do_not_rollback()),
        _ => Triage::Fail(ErrorBuilder::new(class)),
    }
}

/// Adding this attempt's PENDING entry to the ATR.
pub fn set_atr_pending(class: ErrorClass, in_overtime: bool) -> Triage {
    if in_overtime {
        return expired_in_overtime();
    }
    match class {
        ErrorClass::FailExpiry => {
            Triage::Fail(ErrorBuilder::new(class).raise(FinalError::Expired))
        }
        ErrorClass::FailAmbiguous => Triage::Retry,
        ErrorClass::FailPathAlreadyExists => Triage::Done,
        ErrorClass::FailTransient => Triage::Fail(ErrorBuilder::new(class).retry_transaction()),
        ErrorClass::FailHard => Triage::Fail(ErrorBuilder::new(class).do_not_rollback()),
        _ => Triage::Fail(ErrorBuilder::new(class)),
    }
}

/// Marking the ATR entry COMPLETED. Only hard failures surface.
pub fn set_atr_complete(class: ErrorClass) -> Option<ErrorBuilder> {
    (class == ErrorClass::FailHard).then(|| {
        ErrorBuilder::new(class)
            .do_not_rollback()
            .raise(FinalError::FailedPostCommit)
    })
}

/// Committing a staged remove.
pub fn unstage_remove(class: ErrorClass) -> Triage {
    match class {
        ErrorClass::FailAmbiguous => Triage::Retry,
        _ => Triage::Fail(
            ErrorBuilder::new(class)
                .do_not_rollback()
                .raise(FinalError::FailedPostCommit),
        ),
    }
}

/// Marking the ATR entry ABORTED.
pub fn set_atr_aborted(class: ErrorClass, in_overtime: bool) -> Triage {
    if in_overtime {
        return expired_in_overtime();
    }
    match class {
        ErrorClass::FailExpiry => Triage::EnterOvertime,
        ErrorClass::FailPathNotFound
        | ErrorClass::FailDocNotFound
        | ErrorClass::FailAtrFull
        | ErrorClass::FailHard => Triage::Fail(ErrorBuilder::new(class).do_not_rollback()),
        _ => Triage::Retry,
    }
}

/// Marking the ATR entry ROLLED_BACK.
pub fn set_atr_rolled_back(class: ErrorClass, in_overtime: bool) -> Triage {
    if in_overtime {
        return expired_in_overtime();
    }
    match class {
        ErrorClass::FailPathNotFound | ErrorClass::FailDocNotFound => Triage::Done,
        ErrorClass::FailExpiry => expired_in_overtime(),
        ErrorClass::FailHard => Triage::Fail(ErrorBuilder::new(class).do_not_rollback()),
        _ => Triage::Retry,
    }
}

/// Removing a staged insert during rollback.
pub fn rollback_staged_insert(class: ErrorClass, in_overtime: bool) -> Triage {
    if in_overtime {
        return expired_in_overtime();
    }
    match class {
        ErrorClass::FailExpiry => Triage::EnterOvertime,
        ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound => Triage::Done,
        ErrorClass::FailCasMismatch | ErrorClass::FailHard => {
            Triage::Fail(ErrorBuilder::new(class).do_not_rollback())
        }
        _ => Triage::Retry,
    }
}

/// Clearing the staged metadata of a replace or remove during rollback.
pub fn rollback_staged_replace_or_remove(class: ErrorClass, in_overtime: bool) -> Triage {
    if in_overtime {
        return expired_in_overtime();
    }
    match class {
        ErrorClass::FailExpiry => Triage::EnterOvertime,
        ErrorClass::FailPathNotFound => Triage::Done,
        ErrorClass::FailDocNotFound | ErrorClass::FailCasMismatch | ErrorClass::FailHard => {
            Triage::Fail(ErrorBuilder::new(class).do_not_rollback())
        }
        _ => Triage::Retry,
    }
}
