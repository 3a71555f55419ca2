//! Rollback: mark the ATR entry ABORTED, clear every staged write, then mark
//! the entry ROLLED_BACK.

use std::sync::atomic::Ordering;

use futures::StreamExt;
use tracing::{debug, info, warn};

use super::AttemptContext;
use crate::atr::{AtrRef, AttemptState};
use crate::error::triage::{self, Triage};
use crate::error::{ErrorBuilder, ErrorClass, OpError, TransactionOperationFailed};
use crate::staged_mutation::{StagedMutation, StagedMutationType};
use crate::state_bits::BehaviorFlag;

impl AttemptContext {
    /// Roll this attempt back from within the transaction logic.
    ///
    /// Not permitted once commit has started.
    pub async fn rollback(&self) -> Result<(), TransactionOperationFailed> {
        if self.inner.bits.has(BehaviorFlag::AppRollbackNotAllowed) {
            return Err(self.raise(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .do_not_rollback()
                    .cause(OpError::RollbackNotPermitted(
                        "attempt has already been committed or rolled back",
                    )),
            ));
        }
        self.set_behavior_flags(&[
            BehaviorFlag::AppRollbackNotAllowed,
            BehaviorFlag::CommitNotAllowed,
        ]);
        self.rollback_internal().await
    }

    /// Roll back after a failed operation or commit.
    pub(crate) async fn rollback_internal(&self) -> Result<(), TransactionOperationFailed> {
        self.inner.done.store(true, Ordering::Release);
        if self.is_query_mode() {
            return self.rollback_with_query().await;
        }
        if self.has_expired_client_side() {
            self.enter_overtime();
        }

        match self.state() {
            AttemptState::NothingWritten => {
                info!(attempt_id = %self.inner.attempt_id, "nothing to roll back");
                return Ok(());
            }
            AttemptState::RolledBack => return Ok(()),
            AttemptState::Pending | AttemptState::Aborted => {}
            AttemptState::Committed | AttemptState::Completed => {
                return Err(self.raise(
                    ErrorBuilder::new(ErrorClass::FailOther)
                        .do_not_rollback()
                        .cause(OpError::RollbackNotPermitted("attempt has committed")),
                ));
            }
        }
        let Some(atr) = self.atr() else {
            return Ok(());
        };

        if self.state() == AttemptState::Pending {
            self.set_atr_aborted(&atr).await?;
        }
        self.rollback_docs().await?;
        self.set_atr_rolled_back(&atr).await
    }

    async fn set_atr_aborted(&self, atr: &AtrRef) -> Result<(), TransactionOperationFailed> {
        let lists = self.inner.staged.to_lists();
        let mut retries = 0;
        loop {
            let err = match self
                .step(self.inner.atrs.set_aborted(atr, &self.inner.attempt_id, &lists))
                .await
            {
                Ok(_) => {
                    self.transition(AttemptState::Aborted)?;
                    info!(attempt_id = %self.inner.attempt_id, %atr, "attempt aborted");
                    return Ok(());
                }
                Err(err) => err,
            };
            let class = err.class();
            warn!(attempt_id = %self.inner.attempt_id, %atr, ?class, error = %err, "set ATR aborted failed");
            if self
                .after_rollback_step_error(
                    triage::set_atr_aborted(class, self.in_overtime()),
                    err,
                    &mut retries,
                )
                .await?
            {
                self.transition(AttemptState::Aborted)?;
                return Ok(());
            }
        }
    }

    /// Apply a rollback triage decision. `Ok(true)` means the step's goal is
    /// already met, `Ok(false)` that the step should be repeated.
    async fn after_rollback_step_error(
        &self,
        decision: Triage,
        err: OpError,
        retries: &mut u32,
    ) -> Result<bool, TransactionOperationFailed> {
        match decision {
            Triage::Done => Ok(true),
            Triage::Retry => {
                self.retry_delay(retries).await?;
                Ok(false)
            }
            Triage::EnterOvertime => {
                self.enter_overtime();
                self.retry_delay(retries).await?;
                Ok(false)
            }
            Triage::Fail(builder) => Err(self.raise(builder.cause(err))),
        }
    }

    async fn rollback_docs(&self) -> Result<(), TransactionOperationFailed> {
        let mutations = self.inner.staged.all();
        let concurrency = self.inner.config.unstaging_concurrency.max(1);
        let results: Vec<_> = futures::stream::iter(mutations.iter())
            .map(|m| self.rollback_doc(m))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Clear this attempt's metadata from one document. A staged insert is
    /// left as a bare tombstone.
    async fn rollback_doc(&self, mutation: &StagedMutation) -> Result<(), TransactionOperationFailed> {
        let is_insert = mutation.kind == StagedMutationType::Insert;
        let mut retries = 0;
        loop {
            let err: OpError = match self
                .step(self.inner.docs.clear_txn(
                    &mutation.keyspace,
                    &mutation.id,
                    mutation.cas,
                    is_insert,
                ))
                .await
            {
                Ok(_) => {
                    debug!(attempt_id = %self.inner.attempt_id, id = %mutation.fq_id(), "rolled back staged write");
                    return Ok(());
                }
                Err(err) => err,
            };
            let class = err.class();
            warn!(attempt_id = %self.inner.attempt_id, id = %mutation.fq_id(), ?class, error = %err, "rolling back document failed");
            let decision = if is_insert {
                triage::rollback_staged_insert(class, self.in_overtime())
            } else {
                triage::rollback_staged_replace_or_remove(class, self.in_overtime())
            };
            if self
                .after_rollback_step_error(decision, err, &mut retries)
                .await?
            {
                return Ok(());
            }
        }
    }

    async fn set_atr_rolled_back(&self, atr: &AtrRef) -> Result<(), TransactionOperationFailed> {
        let mut retries = 0;
        loop {
            let err = match self
                .step(self.inner.atrs.set_rolled_back(atr, &self.inner.attempt_id))
                .await
            {
                Ok(_) => break,
                Err(err) => err,
            };
            let class = err.class();
            warn!(attempt_id = %self.inner.attempt_id, %atr, ?class, error = %err, "set ATR rolled back failed");
            if self
                .after_rollback_step_error(
                    triage::set_atr_rolled_back(class, self.in_overtime()),
                    err,
                    &mut retries,
                )
                .await?
            {
                break;
            }
        }
        self.transition(AttemptState::RolledBack)?;
        info!(attempt_id = %self.inner.attempt_id, %atr, "attempt rolled back");
        Ok(())
    }
}
