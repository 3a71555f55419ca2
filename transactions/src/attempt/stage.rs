//! Staging inserts, replaces and removes.
//!
//! The first write of an attempt picks its ATR and adds a PENDING entry.
//! Every write then records the new content in the document's `txn`
//! attribute, pointing back at that entry, and remembers the staged
//! mutation for commit or rollback.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{AttemptContext, WRITE_WRITE_CONFLICT_TIMEOUT};
use crate::atr::{AtrRef, AttemptState, atr_id_for_key};
use crate::doc::{AtrLink, RestoreMeta, StagedOp, StagedOpType, TransactionXattrs, TxnIds};
use crate::error::triage::{self, Triage};
use crate::error::{
    AttemptError, ErrorBuilder, ErrorClass, FinalError, OpError, TransactionOperationFailed,
};
use crate::forward_compat::{self, ForwardCompatStage};
use crate::get_result::TransactionGetResult;
use crate::kv::{KvError, Keyspace};
use crate::staged_mutation::{StagedMutation, StagedMutationType};

const WRITE_WRITE_BACKOFF_START: Duration = Duration::from_millis(1);
const WRITE_WRITE_BACKOFF_CAP: Duration = Duration::from_millis(100);

/// How an insert that hit an existing document continues.
enum ExistingOnInsert {
    /// This attempt's own earlier, ambiguous insert landed.
    Staged(TransactionGetResult),
    /// Overwrite the tombstone or stale staged insert with this CAS.
    Restage(u64),
}

impl AttemptContext {
    /// Stage the creation of `id`.
    ///
    /// Fails with `DocumentExists` if the document exists from this
    /// transaction's point of view.
    pub async fn insert(
        &self,
        keyspace: &Keyspace,
        id: &str,
        content: Value,
    ) -> Result<TransactionGetResult, AttemptError> {
        if self.is_query_mode() {
            return self.insert_with_query(keyspace, id, content).await;
        }
        self.done_check()?;
        self.check_errors()?;

        let existing = self.inner.staged.find(keyspace, id);
        if existing
            .as_ref()
            .is_some_and(|m| m.kind != StagedMutationType::Remove)
        {
            return Err(AttemptError::DocumentExists { id: id.to_string() });
        }
        self.check_expiry("insert", id)?;
        let atr = self.init_atr_if_needed(keyspace, id).await?;
        let op_id = uuid::Uuid::new_v4().to_string();

        match existing {
            // Inserting over this attempt's own remove becomes a replace.
            Some(removed) => {
                let target = TransactionGetResult::new(
                    keyspace.clone(),
                    id,
                    Value::Null,
                    removed.cas,
                );
                Ok(self
                    .create_staged_replace(&atr, &target, content, &op_id, true)
                    .await?)
            }
            None => {
                self.create_staged_insert(&atr, keyspace, id, content, &op_id, 0)
                    .await
            }
        }
    }

    /// Stage new content for a document read in this transaction.
    pub async fn replace(
        &self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult, AttemptError> {
        if self.is_query_mode() {
            return self.replace_with_query(doc, content).await;
        }
        self.done_check()?;
        self.check_errors()?;

        let existing = self.inner.staged.find(&doc.keyspace, &doc.id);
        if existing
            .as_ref()
            .is_some_and(|m| m.kind == StagedMutationType::Remove)
        {
            return Err(self.staged_for_removal(doc).into());
        }
        self.check_expiry("replace", &doc.id)?;
        self.check_write_write_conflict(doc, ForwardCompatStage::WriteWriteConflictReplacing)
            .await?;
        let atr = self.init_atr_if_needed(&doc.keyspace, &doc.id).await?;
        let op_id = uuid::Uuid::new_v4().to_string();

        if existing.is_some_and(|m| m.kind == StagedMutationType::Insert) {
            return self
                .create_staged_insert(&atr, &doc.keyspace, &doc.id, content, &op_id, doc.cas)
                .await;
        }
        Ok(self
            .create_staged_replace(&atr, doc, content, &op_id, false)
            .await?)
    }

    /// Stage the removal of a document read in this transaction.
    pub async fn remove(&self, doc: &TransactionGetResult) -> Result<(), AttemptError> {
        if self.is_query_mode() {
            return self.remove_with_query(doc).await;
        }
        self.done_check()?;
        self.check_errors()?;
        self.check_expiry("remove", &doc.id)?;

        match self
            .inner
            .staged
            .find(&doc.keyspace, &doc.id)
            .map(|m| m.kind)
        {
            Some(StagedMutationType::Remove) => return Err(self.staged_for_removal(doc).into()),
            Some(StagedMutationType::Insert) => return Ok(self.remove_staged_insert(doc).await?),
            Some(StagedMutationType::Replace) | None => {}
        }

        self.check_write_write_conflict(doc, ForwardCompatStage::WriteWriteConflictRemoving)
            .await?;
        let atr = self.init_atr_if_needed(&doc.keyspace, &doc.id).await?;
        Ok(self.create_staged_remove(&atr, doc).await?)
    }

    fn staged_for_removal(&self, doc: &TransactionGetResult) -> TransactionOperationFailed {
        self.save(
            ErrorBuilder::new(ErrorClass::FailDocNotFound).cause(OpError::IllegalState(format!(
                "{}.{} is already staged for removal",
                doc.keyspace, doc.id
            ))),
        )
    }

    fn staging_xattrs(
        &self,
        atr: &AtrRef,
        op_id: &str,
        kind: StagedOpType,
        content: Option<Value>,
        restore: Option<RestoreMeta>,
    ) -> TransactionXattrs {
        TransactionXattrs {
            id: TxnIds {
                txn: self.inner.transaction_id.clone(),
                atmpt: self.inner.attempt_id.clone(),
                op: Some(op_id.to_string()),
            },
            atr: AtrLink::from(atr),
            op: StagedOp {
                kind,
                stgd: content,
                crc32: None,
            },
            restore,
            fc: None,
        }
    }

    // ATR

    /// Pick this attempt's ATR and add its PENDING entry, once.
    async fn init_atr_if_needed(
        &self,
        keyspace: &Keyspace,
        id: &str,
    ) -> Result<AtrRef, TransactionOperationFailed> {
        if let Some(atr) = self.pending_atr() {
            return Ok(atr);
        }
        let _guard = self.inner.atr_init.lock().await;
        if let Some(atr) = self.pending_atr() {
            return Ok(atr);
        }

        // Chosen once; a failed PENDING write is retried on the same ATR.
        let atr = if let Some(atr) = self.atr() {
            atr
        } else {
            let atr_keyspace = self
                .inner
                .config
                .metadata_collection
                .clone()
                .unwrap_or_else(|| keyspace.bucket_default());
            let atr = AtrRef {
                keyspace: atr_keyspace,
                id: atr_id_for_key(id, self.inner.config.num_atrs).to_string(),
            };
            *self.inner.atr.lock() = Some(atr.clone());
            atr
        };
        self.set_atr_pending(&atr).await?;
        Ok(atr)
    }

    /// The ATR, once its PENDING entry is written.
    fn pending_atr(&self) -> Option<AtrRef> {
        self.atr()
            .filter(|_| self.state() != AttemptState::NothingWritten)
    }

    async fn set_atr_pending(&self, atr: &AtrRef) -> Result<(), TransactionOperationFailed> {
        let mut retries = 0;
        loop {
            let expires_after_ms = self.remaining_ms();
            let result = self
                .step(self.inner.atrs.set_pending(
                    atr,
                    &self.inner.transaction_id,
                    &self.inner.attempt_id,
                    expires_after_ms,
                ))
                .await;
            let err = match result {
                Ok(_) => {
                    self.transition(AttemptState::Pending)?;
                    info!(attempt_id = %self.inner.attempt_id, %atr, "attempt is pending");
                    return Ok(());
                }
                Err(err) => err,
            };
            let class = err.class();
            warn!(attempt_id = %self.inner.attempt_id, %atr, ?class, error = %err, "set ATR pending failed");
            match triage::set_atr_pending(class, self.in_overtime()) {
                Triage::Retry => self.retry_delay(&mut retries).await?,
                Triage::EnterOvertime => {
                    self.enter_overtime();
                    self.retry_delay(&mut retries).await?;
                }
                Triage::Done => {
                    self.transition(AttemptState::Pending)?;
                    return Ok(());
                }
                Triage::Fail(builder) => {
                    if class == ErrorClass::FailExpiry {
                        self.enter_overtime();
                    }
                    return Err(self.save(builder.cause(err)));
                }
            }
        }
    }

    // Inserts

    async fn create_staged_insert(
        &self,
        atr: &AtrRef,
        keyspace: &Keyspace,
        id: &str,
        content: Value,
        op_id: &str,
        initial_cas: u64,
    ) -> Result<TransactionGetResult, AttemptError> {
        let xattrs = self.staging_xattrs(
            atr,
            op_id,
            StagedOpType::Insert,
            Some(content.clone()),
            None,
        );
        let mut cas = initial_cas;
        let mut retries = 0;
        loop {
            let err = match self
                .step(self.inner.docs.stage_insert(keyspace, id, &xattrs, cas))
                .await
            {
                Ok(new_cas) => {
                    debug!(attempt_id = %self.inner.attempt_id, %keyspace, id, cas = new_cas, "staged insert");
                    return Ok(self.record_insert(keyspace, id, &xattrs, content, new_cas));
                }
                Err(err) => err,
            };
            let class = err.class();
            match class {
                ErrorClass::FailExpiry => {
                    let builder = if self.in_overtime() {
                        ErrorBuilder::new(class).do_not_rollback()
                    } else {
                        ErrorBuilder::new(class)
                    };
                    self.enter_overtime();
                    return Err(self.save(builder.raise(FinalError::Expired).cause(err)).into());
                }
                ErrorClass::FailAmbiguous => self.retry_delay(&mut retries).await?,
                ErrorClass::FailTransient => {
                    return Err(self
                        .save(ErrorBuilder::new(class).retry_transaction().cause(err))
                        .into());
                }
                ErrorClass::FailHard => {
                    return Err(self
                        .save(ErrorBuilder::new(class).do_not_rollback().cause(err))
                        .into());
                }
                ErrorClass::FailDocNotFound => {
                    return Err(self
                        .save(
                            ErrorBuilder::new(ErrorClass::FailDocAlreadyExists)
                                .retry_transaction()
                                .cause(err),
                        )
                        .into());
                }
                ErrorClass::FailDocAlreadyExists | ErrorClass::FailCasMismatch => {
                    match self
                        .existing_on_insert(keyspace, id, op_id, &xattrs, &content)
                        .await?
                    {
                        ExistingOnInsert::Staged(result) => return Ok(result),
                        ExistingOnInsert::Restage(existing_cas) => {
                            cas = existing_cas;
                            self.retry_delay(&mut retries).await?;
                        }
                    }
                }
                _ => {
                    return Err(self
                        .save(ErrorBuilder::new(class).retry_transaction().cause(err))
                        .into());
                }
            }
        }
    }

    fn record_insert(
        &self,
        keyspace: &Keyspace,
        id: &str,
        xattrs: &TransactionXattrs,
        content: Value,
        cas: u64,
    ) -> TransactionGetResult {
        self.inner.staged.add(StagedMutation {
            keyspace: keyspace.clone(),
            id: id.to_string(),
            kind: StagedMutationType::Insert,
            content: Some(content.clone()),
            cas,
            operation_id: xattrs.id.op.clone().unwrap_or_default(),
        });
        TransactionGetResult {
            txn: Some(xattrs.clone()),
            ..TransactionGetResult::new(keyspace.clone(), id, content, cas)
        }
    }

    /// An insert found a document in its way. Decide whether it may be
    /// overwritten.
    async fn existing_on_insert(
        &self,
        keyspace: &Keyspace,
        id: &str,
        op_id: &str,
        xattrs: &TransactionXattrs,
        content: &Value,
    ) -> Result<ExistingOnInsert, AttemptError> {
        let doc = match self.timed(self.inner.docs.lookup(keyspace, id)).await {
            Ok(doc) => doc,
            Err(KvError::DocumentNotFound) => return Ok(ExistingOnInsert::Restage(0)),
            Err(err) => {
                let class = ErrorClass::classify(&err);
                let builder = match class {
                    ErrorClass::FailTransient | ErrorClass::FailAmbiguous => {
                        ErrorBuilder::new(class).retry_transaction()
                    }
                    ErrorClass::FailHard => ErrorBuilder::new(class).do_not_rollback(),
                    _ => ErrorBuilder::new(class),
                };
                return Err(self.save(builder.cause(err)).into());
            }
        };

        let fc = doc.txn.as_ref().and_then(|t| t.fc.as_ref());
        forward_compat::check(ForwardCompatStage::WriteWriteConflictInsertingGet, fc)
            .await
            .map_err(|b| self.save(b))?;

        let Some(txn) = &doc.txn else {
            if doc.is_deleted {
                return Ok(ExistingOnInsert::Restage(doc.cas));
            }
            return Err(AttemptError::DocumentExists { id: id.to_string() });
        };

        if txn.id.atmpt == self.inner.attempt_id {
            if txn.id.op.as_deref() == Some(op_id) {
                debug!(attempt_id = %self.inner.attempt_id, id, "ambiguous staged insert had succeeded");
                return Ok(ExistingOnInsert::Staged(self.record_insert(
                    keyspace,
                    id,
                    xattrs,
                    content.clone(),
                    doc.cas,
                )));
            }
            return Err(self
                .save(ErrorBuilder::new(ErrorClass::FailOther).cause(OpError::IllegalState(
                    format!("{keyspace}.{id} was staged by another operation of this attempt"),
                )))
                .into());
        }

        if txn.op.kind != StagedOpType::Insert {
            return Err(AttemptError::DocumentExists { id: id.to_string() });
        }

        let blocking = TransactionGetResult {
            txn: doc.txn.clone(),
            meta: doc.meta.clone(),
            ..TransactionGetResult::new(keyspace.clone(), id, Value::Null, doc.cas)
        };
        self.check_write_write_conflict(&blocking, ForwardCompatStage::WriteWriteConflictInserting)
            .await?;
        if !doc.is_deleted {
            return Err(self
                .save(
                    ErrorBuilder::new(ErrorClass::FailDocAlreadyExists)
                        .retry_transaction()
                        .cause(OpError::IllegalState(format!(
                            "{keyspace}.{id} is a staged insert but not a tombstone"
                        ))),
                )
                .into());
        }
        Ok(ExistingOnInsert::Restage(doc.cas))
    }

    // Replaces and removes

    async fn create_staged_replace(
        &self,
        atr: &AtrRef,
        doc: &TransactionGetResult,
        content: Value,
        op_id: &str,
        access_deleted: bool,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let restore = doc.meta.as_ref().map(crate::doc::DocumentMetadata::to_restore);
        let xattrs = self.staging_xattrs(
            atr,
            op_id,
            StagedOpType::Replace,
            Some(content.clone()),
            restore,
        );
        let cas = self
            .stage_existing(doc, &xattrs, access_deleted)
            .await?;
        debug!(attempt_id = %self.inner.attempt_id, keyspace = %doc.keyspace, id = %doc.id, cas, "staged replace");
        self.inner.staged.add(StagedMutation {
            keyspace: doc.keyspace.clone(),
            id: doc.id.clone(),
            kind: StagedMutationType::Replace,
            content: Some(content.clone()),
            cas,
            operation_id: op_id.to_string(),
        });
        Ok(TransactionGetResult {
            txn: Some(xattrs),
            meta: doc.meta.clone(),
            ..TransactionGetResult::new(doc.keyspace.clone(), &doc.id, content, cas)
        })
    }

    async fn create_staged_remove(
        &self,
        atr: &AtrRef,
        doc: &TransactionGetResult,
    ) -> Result<(), TransactionOperationFailed> {
        let op_id = uuid::Uuid::new_v4().to_string();
        let restore = doc.meta.as_ref().map(crate::doc::DocumentMetadata::to_restore);
        let xattrs = self.staging_xattrs(atr, &op_id, StagedOpType::Remove, None, restore);
        let cas = self.stage_existing(doc, &xattrs, false).await?;
        debug!(attempt_id = %self.inner.attempt_id, keyspace = %doc.keyspace, id = %doc.id, cas, "staged remove");
        self.inner.staged.add(StagedMutation {
            keyspace: doc.keyspace.clone(),
            id: doc.id.clone(),
            kind: StagedMutationType::Remove,
            content: None,
            cas,
            operation_id: op_id,
        });
        Ok(())
    }

    async fn stage_existing(
        &self,
        doc: &TransactionGetResult,
        xattrs: &TransactionXattrs,
        access_deleted: bool,
    ) -> Result<u64, TransactionOperationFailed> {
        let result = self
            .step(self.inner.docs.stage_mutation(
                &doc.keyspace,
                &doc.id,
                xattrs,
                doc.cas,
                access_deleted,
            ))
            .await;
        result.map_err(|err| {
            let class = err.class();
            warn!(attempt_id = %self.inner.attempt_id, id = %doc.id, ?class, error = %err, "staging failed");
            if class == ErrorClass::FailExpiry {
                self.enter_overtime();
            }
            let builder = match triage::create_staged_replace_or_remove(class) {
                Triage::Fail(builder) => builder,
                Triage::Retry | Triage::Done | Triage::EnterOvertime => {
                    ErrorBuilder::new(class).retry_transaction()
                }
            };
            self.save(builder.cause(err))
        })
    }

    /// Removing a document this attempt inserted undoes the staged insert.
    async fn remove_staged_insert(
        &self,
        doc: &TransactionGetResult,
    ) -> Result<(), TransactionOperationFailed> {
        if self.has_expired_client_side() {
            return Err(self.save(
                ErrorBuilder::new(ErrorClass::FailExpiry)
                    .do_not_rollback()
                    .raise(FinalError::Expired)
                    .cause(OpError::AttemptExpired),
            ));
        }
        let cas = self
            .inner
            .staged
            .find(&doc.keyspace, &doc.id)
            .map_or(doc.cas, |m| m.cas);
        match self
            .timed(self.inner.docs.clear_txn(&doc.keyspace, &doc.id, cas, true))
            .await
        {
            Ok(_) => {
                self.inner.staged.remove(&doc.keyspace, &doc.id);
                debug!(attempt_id = %self.inner.attempt_id, id = %doc.id, "removed own staged insert");
                Ok(())
            }
            Err(err) => {
                let class = ErrorClass::classify(&err);
                let builder = if class == ErrorClass::FailHard {
                    ErrorBuilder::new(class).do_not_rollback()
                } else {
                    ErrorBuilder::new(class).retry_transaction()
                };
                Err(self.save(builder.cause(err)))
            }
        }
    }

    // Write-write conflicts

    /// Wait for another attempt's staged write on `doc` to resolve.
    ///
    /// Writes staged by this transaction never block. Another attempt blocks
    /// until its entry is completed, rolled back or gone; an expired
    /// uncommitted attempt is overridden.
    pub(super) async fn check_write_write_conflict(
        &self,
        doc: &TransactionGetResult,
        stage: ForwardCompatStage,
    ) -> Result<(), TransactionOperationFailed> {
        self.check_expiry("write-write check", &doc.id)?;
        let started = tokio::time::Instant::now();
        let mut backoff = WRITE_WRITE_BACKOFF_START;
        loop {
            let fc = doc.txn.as_ref().and_then(|t| t.fc.as_ref());
            forward_compat::check(stage, fc)
                .await
                .map_err(|b| self.save(b))?;

            let Some(txn) = &doc.txn else {
                return Ok(());
            };
            if txn.id.txn == self.inner.transaction_id {
                return Ok(());
            }

            let atr = txn.atr.to_atr_ref();
            let found = match self
                .timed(self.inner.atrs.find_entry_with_clock(&atr, &txn.id.atmpt))
                .await
            {
                Ok(found) => found,
                Err(err) => {
                    return Err(self.save(
                        ErrorBuilder::new(ErrorClass::FailWriteWriteConflict)
                            .retry_transaction()
                            .cause(err),
                    ));
                }
            };
            let Some((entry, hlc_now_ms)) = found else {
                debug!(attempt_id = %self.inner.attempt_id, id = %doc.id, blocking = %txn.id.atmpt, "blocking entry gone");
                return Ok(());
            };

            forward_compat::check(
                ForwardCompatStage::WriteWriteConflictReadingAtr,
                entry.forward_compat.as_ref(),
            )
            .await
            .map_err(|b| self.save(b))?;

            match entry.state {
                AttemptState::Completed | AttemptState::RolledBack => return Ok(()),
                AttemptState::Pending | AttemptState::Aborted | AttemptState::NothingWritten
                    if entry.has_expired(hlc_now_ms) =>
                {
                    info!(
                        attempt_id = %self.inner.attempt_id,
                        id = %doc.id,
                        blocking = %entry.attempt_id,
                        "overriding expired attempt"
                    );
                    return Ok(());
                }
                _ => {}
            }

            if started.elapsed() >= WRITE_WRITE_CONFLICT_TIMEOUT {
                warn!(
                    attempt_id = %self.inner.attempt_id,
                    id = %doc.id,
                    blocking = %entry.attempt_id,
                    state = %entry.state,
                    "write-write conflict"
                );
                return Err(self.save(
                    ErrorBuilder::new(ErrorClass::FailWriteWriteConflict)
                        .retry_transaction()
                        .cause(OpError::WriteWriteConflict(format!(
                            "{}.{}",
                            doc.keyspace, doc.id
                        ))),
                ));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 10).min(WRITE_WRITE_BACKOFF_CAP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::tests::Fixture;
    use crate::doc::TXN_XATTR;
    use crate::kv::{DurabilityLevel, KvStore};
    use crate::simulation::{KvOp, ScriptedFault};
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_share_one_pending_entry() {
        let fx = Fixture::new();
        let ctx = fx.attempt();
        let results = futures::future::join_all((0..20).map(|n| {
            let ctx = ctx.clone();
            let ks = fx.keyspace.clone();
            async move { ctx.insert(&ks, &format!("doc-{n}"), json!({"n": n})).await }
        }))
        .await;
        for result in results {
            result.unwrap();
        }
        assert_eq!(ctx.state(), AttemptState::Pending);
        assert_eq!(ctx.staged_mutations().len(), 20);

        let atr = ctx.atr().unwrap();
        let written: Vec<_> = crate::atr::all_atr_ids(1024)
            .filter_map(|id| fx.kv.xattr(&atr.keyspace, id, "attempts"))
            .collect();
        assert_eq!(written.len(), 1);
        let entries = written[0].as_object().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[ctx.attempt_id()]["st"], json!("PENDING"));

        ctx.commit().await.unwrap();
        let ins = fx
            .kv
            .xattr(&atr.keyspace, &atr.id, &format!("attempts.{}.ins", ctx.attempt_id()))
            .unwrap();
        assert_eq!(ins.as_array().unwrap().len(), 20);
        for n in 0..20 {
            let doc = fx.kv.get(&fx.keyspace, &format!("doc-{n}")).await.unwrap();
            assert_eq!(doc.content, json!({"n": n}));
        }
    }

    #[tokio::test]
    async fn test_insert_waits_for_pending_entry_being_retried() {
        let fx = Fixture::new();
        let ctx = fx.attempt();
        let atr_id = atr_id_for_key("a", 1024);
        fx.kv
            .inject(ScriptedFault::new(KvOp::MutateIn, atr_id, KvError::AmbiguousTimeout));
        let (a, b) = tokio::join!(
            ctx.insert(&fx.keyspace, "a", json!(1)),
            ctx.insert(&fx.keyspace, "b", json!(2)),
        );
        a.unwrap();
        b.unwrap();

        let atr = ctx.atr().unwrap();
        assert_eq!(atr.id, atr_id);
        assert_eq!(
            fx.kv
                .xattr(&atr.keyspace, &atr.id, &format!("attempts.{}.st", ctx.attempt_id())),
            Some(json!("PENDING"))
        );
        for id in ["a", "b"] {
            assert_eq!(
                fx.kv.xattr(&fx.keyspace, id, &format!("{TXN_XATTR}.atr.id")),
                Some(json!(atr_id))
            );
        }
    }

    #[tokio::test]
    async fn test_insert_stages_tombstone_and_pending_entry() {
        let fx = Fixture::new();
        let ctx = fx.attempt();
        let result = ctx.insert(&fx.keyspace, "a", json!({"v": 1})).await.unwrap();
        assert_eq!(result.content(), &json!({"v": 1}));
        assert_eq!(ctx.state(), AttemptState::Pending);
        assert!(!fx.kv.contains(&fx.keyspace, "a"));
        assert!(fx.kv.is_tombstone(&fx.keyspace, "a"));

        let atr = ctx.atr().unwrap();
        assert_eq!(atr.keyspace, fx.keyspace);
        assert_eq!(atr.id, atr_id_for_key("a", 1024));
        let state = fx
            .kv
            .xattr(&atr.keyspace, &atr.id, &format!("attempts.{}.st", ctx.attempt_id()));
        assert_eq!(state, Some(json!("PENDING")));
    }

    #[tokio::test]
    async fn test_insert_twice_is_document_exists() {
        let fx = Fixture::new();
        let ctx = fx.attempt();
        ctx.insert(&fx.keyspace, "a", json!(1)).await.unwrap();
        assert!(matches!(
            ctx.insert(&fx.keyspace, "a", json!(2)).await,
            Err(AttemptError::DocumentExists { .. })
        ));
        // not saved, so commit still works
        ctx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_over_committed_document_is_document_exists() {
        let fx = Fixture::new();
        fx.kv
            .insert(&fx.keyspace, "a", json!({}), DurabilityLevel::None)
            .await
            .unwrap();
        let ctx = fx.attempt();
        assert!(matches!(
            ctx.insert(&fx.keyspace, "a", json!(2)).await,
            Err(AttemptError::DocumentExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_ambiguous_staged_insert_is_resolved() {
        let fx = Fixture::new();
        fx.kv.inject(
            ScriptedFault::new(KvOp::MutateIn, "a", KvError::AmbiguousTimeout).after_apply(),
        );
        let ctx = fx.attempt();
        ctx.insert(&fx.keyspace, "a", json!({"v": 1})).await.unwrap();
        assert_eq!(ctx.staged_mutations().len(), 1);
        ctx.commit().await.unwrap();
        assert!(fx.kv.contains(&fx.keyspace, "a"));
    }

    #[tokio::test]
    async fn test_replace_then_remove_own_insert() {
        let fx = Fixture::new();
        let ctx = fx.attempt();
        let inserted = ctx.insert(&fx.keyspace, "a", json!({"v": 1})).await.unwrap();
        let replaced = ctx.replace(&inserted, json!({"v": 2})).await.unwrap();
        let staged = ctx.inner.staged.find(&fx.keyspace, "a").unwrap();
        assert_eq!(staged.kind, StagedMutationType::Insert);
        assert_eq!(staged.content, Some(json!({"v": 2})));

        ctx.remove(&replaced).await.unwrap();
        assert!(ctx.inner.staged.is_empty());
        assert!(fx.kv.xattr(&fx.keyspace, "a", TXN_XATTR).is_none());
    }

    #[tokio::test]
    async fn test_remove_twice_fails_doc_not_found() {
        let fx = Fixture::new();
        fx.kv
            .insert(&fx.keyspace, "a", json!({}), DurabilityLevel::None)
            .await
            .unwrap();
        let ctx = fx.attempt();
        let doc = ctx.get(&fx.keyspace, "a").await.unwrap();
        ctx.remove(&doc).await.unwrap();
        let err = match ctx.remove(&doc).await {
            Err(AttemptError::OperationFailed(err)) => err,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(err.class(), ErrorClass::FailDocNotFound);
        assert!(ctx.get_optional(&fx.keyspace, "a").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_over_own_remove_becomes_replace() {
        let fx = Fixture::new();
        fx.kv
            .insert(&fx.keyspace, "a", json!({"v": 1}), DurabilityLevel::None)
            .await
            .unwrap();
        let ctx = fx.attempt();
        let doc = ctx.get(&fx.keyspace, "a").await.unwrap();
        ctx.remove(&doc).await.unwrap();
        ctx.insert(&fx.keyspace, "a", json!({"v": 9})).await.unwrap();
        let staged = ctx.inner.staged.find(&fx.keyspace, "a").unwrap();
        assert_eq!(staged.kind, StagedMutationType::Replace);
        ctx.commit().await.unwrap();
        let got = fx.kv.get(&fx.keyspace, "a").await.unwrap();
        assert_eq!(got.content, json!({"v": 9}));
    }

    #[tokio::test]
    async fn test_cas_mismatch_on_replace_retries_transaction() {
        let fx = Fixture::new();
        fx.kv
            .insert(&fx.keyspace, "a", json!({"v": 1}), DurabilityLevel::None)
            .await
            .unwrap();
        let ctx = fx.attempt();
        let doc = ctx.get(&fx.keyspace, "a").await.unwrap();
        fx.kv
            .upsert(&fx.keyspace, "a", json!({"v": "outside"}))
            .await
            .unwrap();
        let err = match ctx.replace(&doc, json!({"v": 2})).await {
            Err(AttemptError::OperationFailed(err)) => err,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(err.class(), ErrorClass::FailCasMismatch);
        assert!(err.retry());
        assert!(err.auto_rollback());
    }

    #[tokio::test]
    async fn test_write_write_conflict_times_out() {
        let fx = Fixture::new();
        fx.kv
            .insert(&fx.keyspace, "a", json!({"v": 1}), DurabilityLevel::None)
            .await
            .unwrap();
        let first = fx.attempt_with("txn-a", Fixture::config(), None);
        let doc = first.get(&fx.keyspace, "a").await.unwrap();
        first.replace(&doc, json!({"v": 2})).await.unwrap();

        let second = fx.attempt_with("txn-b", Fixture::config(), None);
        let doc = second.get(&fx.keyspace, "a").await.unwrap();
        let err = match second.replace(&doc, json!({"v": 3})).await {
            Err(AttemptError::OperationFailed(err)) => err,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(err.class(), ErrorClass::FailWriteWriteConflict);
        assert!(err.retry());
    }

    #[tokio::test]
    async fn test_expired_blocking_attempt_is_overridden() {
        let fx = Fixture::new();
        fx.kv
            .insert(&fx.keyspace, "a", json!({"v": 1}), DurabilityLevel::None)
            .await
            .unwrap();
        let first = fx.attempt_with("txn-a", Fixture::config(), None);
        let doc = first.get(&fx.keyspace, "a").await.unwrap();
        first.replace(&doc, json!({"v": 2})).await.unwrap();

        fx.time.advance(16_000);
        let second = fx.attempt_with("txn-b", Fixture::config(), None);
        let doc = second.get(&fx.keyspace, "a").await.unwrap();
        assert_eq!(doc.content(), &json!({"v": 1}));
        second.replace(&doc, json!({"v": 3})).await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(
            fx.kv.get(&fx.keyspace, "a").await.unwrap().content,
            json!({"v": 3})
        );
    }

    #[tokio::test]
    async fn test_same_transaction_does_not_block() {
        let fx = Fixture::new();
        fx.kv
            .insert(&fx.keyspace, "a", json!({"v": 1}), DurabilityLevel::None)
            .await
            .unwrap();
        let first = fx.attempt_with("txn-a", Fixture::config(), None);
        let doc = first.get(&fx.keyspace, "a").await.unwrap();
        first.replace(&doc, json!({"v": 2})).await.unwrap();

        let retry = fx.attempt_with("txn-a", Fixture::config(), None);
        let doc = retry.get(&fx.keyspace, "a").await.unwrap();
        retry.replace(&doc, json!({"v": 3})).await.unwrap();
    }

    #[tokio::test]
    async fn test_operation_after_expiry_fails_expired() {
        let fx = Fixture::new();
        let ctx = fx.attempt();
        fx.time.advance(15_001);
        let err = match ctx.insert(&fx.keyspace, "a", json!(1)).await {
            Err(AttemptError::OperationFailed(err)) => err,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(err.class(), ErrorClass::FailExpiry);
        assert_eq!(err.to_raise(), FinalError::Expired);
    }
}
