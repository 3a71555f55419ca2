//! Commit: flip the ATR entry to COMMITTED, make every staged write visible,
//! then mark the entry COMPLETED.
//!
//! Once the entry is COMMITTED the transaction has happened. Failures after
//! that point are reported as `FailedPostCommit` and left to cleanup.

use std::sync::atomic::Ordering;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::AttemptContext;
use crate::atr::{AtrRef, AttemptState};
use crate::error::triage::{self, Triage};
use crate::error::{ErrorBuilder, ErrorClass, FinalError, OpError, TransactionOperationFailed};
use crate::staged_mutation::{StagedMutation, StagedMutationType};
use crate::state_bits::BehaviorFlag;

impl AttemptContext {
    /// Commit this attempt.
    ///
    /// Called automatically when the transaction logic returns successfully;
    /// the logic may also call it itself. A rolled-back or already committed
    /// attempt cannot be committed.
    pub async fn commit(&self) -> Result<(), TransactionOperationFailed> {
        if self.has_saved_errors() {
            return Err(self.commit_with_previous_errors());
        }
        if self.inner.bits.has(BehaviorFlag::CommitNotAllowed) {
            return Err(self.raise(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .do_not_rollback()
                    .cause(OpError::CommitNotPermitted(
                        "attempt has already been committed or rolled back",
                    )),
            ));
        }
        self.set_behavior_flags(&[
            BehaviorFlag::AppRollbackNotAllowed,
            BehaviorFlag::CommitNotAllowed,
        ]);

        if self.is_query_mode() {
            return self.commit_with_query().await;
        }
        self.commit_with_kv().await
    }

    /// Refuse to commit over a failed operation the logic swallowed.
    fn commit_with_previous_errors(&self) -> TransactionOperationFailed {
        let (retry, rollback) = {
            let errors = self.inner.errors.lock();
            (
                errors.iter().all(TransactionOperationFailed::retry),
                errors.iter().all(TransactionOperationFailed::auto_rollback),
            )
        };
        warn!(
            attempt_id = %self.inner.attempt_id,
            retry,
            rollback,
            "commit refused after earlier operation failures"
        );
        let mut builder =
            ErrorBuilder::new(ErrorClass::FailOther).cause(OpError::PreviousOperationFailed);
        if retry {
            builder = builder.retry_transaction();
        }
        if !rollback {
            builder = builder.do_not_rollback();
        }
        self.raise(builder)
    }

    async fn commit_with_kv(&self) -> Result<(), TransactionOperationFailed> {
        if self.has_expired_client_side() {
            self.enter_overtime();
            return Err(self.raise(
                ErrorBuilder::new(ErrorClass::FailExpiry)
                    .raise(FinalError::Expired)
                    .cause(OpError::AttemptExpired),
            ));
        }
        self.done_check()?;
        self.inner
            .done
            .store(true, Ordering::Release);

        let Some(atr) = self.atr() else {
            self.transition(AttemptState::Completed)?;
            self.inner
                .unstaging_complete
                .store(true, Ordering::Release);
            info!(attempt_id = %self.inner.attempt_id, "nothing to commit");
            return Ok(());
        };

        self.set_atr_committed(&atr).await?;
        self.unstage_docs().await?;
        self.inner
            .unstaging_complete
            .store(true, Ordering::Release);
        self.set_atr_complete(&atr).await
    }

    async fn set_atr_committed(&self, atr: &AtrRef) -> Result<(), TransactionOperationFailed> {
        let lists = self.inner.staged.to_lists();
        let mut ambiguous = false;
        let mut retries = 0;
        loop {
            let err = match self
                .step(
                    self.inner
                        .atrs
                        .set_committed(atr, &self.inner.attempt_id, &lists),
                )
                .await
            {
                Ok(_) => {
                    self.transition(AttemptState::Committed)?;
                    info!(attempt_id = %self.inner.attempt_id, %atr, "attempt committed");
                    return Ok(());
                }
                Err(err) => err,
            };
            let class = err.class();
            warn!(attempt_id = %self.inner.attempt_id, %atr, ?class, ambiguous, error = %err, "set ATR committed failed");
            let unresolved = if ambiguous {
                FinalError::CommitAmbiguous
            } else {
                FinalError::Failed
            };
            match class {
                ErrorClass::FailExpiry => {
                    let to_raise = if ambiguous {
                        FinalError::CommitAmbiguous
                    } else {
                        FinalError::Expired
                    };
                    return Err(self.raise(
                        ErrorBuilder::new(class)
                            .do_not_rollback()
                            .raise(to_raise)
                            .cause(err),
                    ));
                }
                ErrorClass::FailAmbiguous => {
                    ambiguous = true;
                    self.retry_delay(&mut retries).await?;
                }
                ErrorClass::FailHard => {
                    return Err(self.raise(
                        ErrorBuilder::new(class)
                            .do_not_rollback()
                            .raise(unresolved)
                            .cause(err),
                    ));
                }
                ErrorClass::FailTransient if ambiguous => self.retry_delay(&mut retries).await?,
                ErrorClass::FailTransient => {
                    return Err(
                        self.raise(ErrorBuilder::new(class).retry_transaction().cause(err))
                    );
                }
                ErrorClass::FailPathAlreadyExists => {
                    // The pending sentinel is there: an earlier try landed,
                    // or the entry was aborted under us.
                    self.resolve_ambiguous_commit(atr).await?;
                    self.transition(AttemptState::Committed)?;
                    return Ok(());
                }
                _ if ambiguous => {
                    return Err(self.raise(
                        ErrorBuilder::new(class)
                            .do_not_rollback()
                            .raise(FinalError::CommitAmbiguous)
                            .cause(err),
                    ));
                }
                ErrorClass::FailDocNotFound
                | ErrorClass::FailPathNotFound
                | ErrorClass::FailAtrFull => {
                    return Err(self.raise(ErrorBuilder::new(class).do_not_rollback().cause(err)));
                }
                _ => return Err(self.raise(ErrorBuilder::new(class).cause(err))),
            }
        }
    }

    /// Read the entry back to learn whether a commit that reported failure
    /// took effect.
    async fn resolve_ambiguous_commit(&self, atr: &AtrRef) -> Result<(), TransactionOperationFailed> {
        let mut retries = 0;
        loop {
            let err = match self
                .step(self.inner.atrs.lookup_state(atr, &self.inner.attempt_id))
                .await
            {
                Ok(Some(AttemptState::Committed)) => {
                    debug!(attempt_id = %self.inner.attempt_id, "ambiguous commit had succeeded");
                    return Ok(());
                }
                Ok(Some(AttemptState::Aborted)) => {
                    return Err(self.raise(
                        ErrorBuilder::new(ErrorClass::FailOther)
                            .retry_transaction()
                            .cause(OpError::IllegalState(
                                "attempt was aborted while committing".to_string(),
                            )),
                    ));
                }
                Ok(state) => {
                    return Err(self.raise(
                        ErrorBuilder::new(ErrorClass::FailOther)
                            .do_not_rollback()
                            .cause(OpError::IllegalState(format!(
                                "unexpected ATR entry state {state:?} while committing"
                            ))),
                    ));
                }
                Err(err) => err,
            };
            let class = err.class();
            match class {
                ErrorClass::FailTransient | ErrorClass::FailOther | ErrorClass::FailAmbiguous => {
                    self.retry_delay(&mut retries).await?;
                }
                _ => {
                    return Err(self.raise(
                        ErrorBuilder::new(class)
                            .do_not_rollback()
                            .raise(FinalError::CommitAmbiguous)
                            .cause(err),
                    ));
                }
            }
        }
    }

    async fn unstage_docs(&self) -> Result<(), TransactionOperationFailed> {
        let mutations = self.inner.staged.all();
        let concurrency = self.inner.config.unstaging_concurrency.max(1);
        let results: Vec<_> = futures::stream::iter(mutations.iter())
            .map(|m| self.unstage_doc(m))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn unstage_doc(&self, mutation: &StagedMutation) -> Result<(), TransactionOperationFailed> {
        match mutation.kind {
            StagedMutationType::Remove => self.unstage_remove(mutation).await,
            StagedMutationType::Insert | StagedMutationType::Replace => {
                self.unstage_insert_or_replace(mutation).await
            }
        }
    }

    fn post_commit_failure(&self, class: ErrorClass, err: OpError) -> TransactionOperationFailed {
        self.raise(
            ErrorBuilder::new(class)
                .do_not_rollback()
                .raise(FinalError::FailedPostCommit)
                .cause(err),
        )
    }

    async fn unstage_remove(&self, mutation: &StagedMutation) -> Result<(), TransactionOperationFailed> {
        let mut ambiguous = false;
        let mut retries = 0;
        loop {
            if self.has_expired_client_side() {
                self.enter_overtime();
            }
            let err: OpError = match self
                .timed(
                    self.inner
                        .docs
                        .remove(&mutation.keyspace, &mutation.id, mutation.cas),
                )
                .await
            {
                Ok(_) => {
                    debug!(attempt_id = %self.inner.attempt_id, id = %mutation.fq_id(), "unstaged remove");
                    return Ok(());
                }
                Err(err) => err.into(),
            };
            let class = err.class();
            if self.in_overtime() {
                return Err(self.post_commit_failure(ErrorClass::FailExpiry, err));
            }
            if ambiguous && class == ErrorClass::FailDocNotFound {
                return Ok(());
            }
            match triage::unstage_remove(class) {
                Triage::Retry => {
                    ambiguous = true;
                    self.retry_delay(&mut retries).await?;
                }
                Triage::Done => return Ok(()),
                Triage::EnterOvertime => self.enter_overtime(),
                Triage::Fail(builder) => {
                    warn!(attempt_id = %self.inner.attempt_id, id = %mutation.fq_id(), ?class, "unstaging remove failed");
                    return Err(self.raise(builder.cause(err)));
                }
            }
        }
    }

    async fn unstage_insert_or_replace(
        &self,
        mutation: &StagedMutation,
    ) -> Result<(), TransactionOperationFailed> {
        let content = mutation.content.clone().unwrap_or(Value::Null);
        let mut cas = mutation.cas;
        let mut insert_mode = mutation.kind == StagedMutationType::Insert;
        let mut ambiguous = false;
        let mut retries = 0;
        loop {
            if self.has_expired_client_side() {
                self.enter_overtime();
            }
            let err: OpError = match self
                .timed(self.inner.docs.unstage(
                    &mutation.keyspace,
                    &mutation.id,
                    content.clone(),
                    cas,
                    insert_mode,
                ))
                .await
            {
                Ok(_) => {
                    debug!(attempt_id = %self.inner.attempt_id, id = %mutation.fq_id(), insert_mode, "unstaged");
                    return Ok(());
                }
                Err(err) => err.into(),
            };
            let class = err.class();
            if self.in_overtime() {
                return Err(self.post_commit_failure(ErrorClass::FailExpiry, err));
            }
            match class {
                ErrorClass::FailAmbiguous => ambiguous = true,
                // The document changed under us; whether our write landed
                // is now unknown.
                ErrorClass::FailCasMismatch => {
                    cas = 0;
                    ambiguous = true;
                }
                ErrorClass::FailDocNotFound => insert_mode = true,
                ErrorClass::FailDocAlreadyExists
                    if ambiguous || mutation.kind == StagedMutationType::Replace =>
                {
                    return Ok(());
                }
                _ => {
                    warn!(attempt_id = %self.inner.attempt_id, id = %mutation.fq_id(), ?class, "unstaging failed");
                    return Err(self.post_commit_failure(class, err));
                }
            }
            self.retry_delay(&mut retries).await?;
        }
    }

    async fn set_atr_complete(&self, atr: &AtrRef) -> Result<(), TransactionOperationFailed> {
        match self
            .step(self.inner.atrs.set_completed(atr, &self.inner.attempt_id))
            .await
        {
            Ok(_) => {
                self.transition(AttemptState::Completed)?;
                info!(attempt_id = %self.inner.attempt_id, %atr, "attempt completed");
                Ok(())
            }
            Err(err) => {
                let class = err.class();
                match triage::set_atr_complete(class) {
                    Some(builder) => Err(self.raise(builder.cause(err))),
                    None => {
                        warn!(
                            attempt_id = %self.inner.attempt_id,
                            %atr,
                            ?class,
                            error = %err,
                            "could not mark attempt completed, leaving it to cleanup"
                        );
                        Ok(())
                    }
                }
            }
        }
    }
}
