//! Transactional reads.
//!
//! A document staged by another attempt is resolved through that attempt's
//! ATR entry, so a reader never sees part of a transaction: committed
//! attempts read as their staged content, everything else as the body from
//! before the transaction.

use serde_json::Value;
use tracing::debug;

use super::AttemptContext;
use crate::atr::AttemptState;
use crate::doc::{DocumentLookup, StagedOpType};
use crate::error::triage::{self, Triage};
use crate::error::{AttemptError, ErrorBuilder, OpError, TransactionOperationFailed};
use crate::forward_compat::{self, ForwardCompatStage};
use crate::get_result::TransactionGetResult;
use crate::kv::{KvError, Keyspace};
use crate::staged_mutation::StagedMutationType;

impl AttemptContext {
    /// Read a document, failing with `DocumentNotFound` if it does not exist
    /// from this transaction's point of view.
    pub async fn get(
        &self,
        keyspace: &Keyspace,
        id: &str,
    ) -> Result<TransactionGetResult, AttemptError> {
        self.get_optional(keyspace, id)
            .await?
            .ok_or_else(|| AttemptError::DocumentNotFound { id: id.to_string() })
    }

    /// Read a document, or `None` if it does not exist from this
    /// transaction's point of view.
    pub async fn get_optional(
        &self,
        keyspace: &Keyspace,
        id: &str,
    ) -> Result<Option<TransactionGetResult>, AttemptError> {
        if self.is_query_mode() {
            return Ok(self.get_with_query(keyspace, id).await?);
        }
        self.done_check()?;
        self.check_errors()?;
        self.check_expiry("get", id)?;

        if let Some(staged) = self.inner.staged.find(keyspace, id) {
            debug!(
                attempt_id = %self.inner.attempt_id,
                id = %staged.fq_id(),
                kind = ?staged.kind,
                "read of own staged write"
            );
            return Ok(match staged.kind {
                StagedMutationType::Remove => None,
                StagedMutationType::Insert | StagedMutationType::Replace => {
                    Some(TransactionGetResult::new(
                        keyspace.clone(),
                        id,
                        staged.content.unwrap_or(Value::Null),
                        staged.cas,
                    ))
                }
            });
        }

        let result = self.get_resolved(keyspace, id).await?;
        if let Some(doc) = &result {
            let fc = doc.txn.as_ref().and_then(|t| t.fc.as_ref());
            forward_compat::check(ForwardCompatStage::Gets, fc)
                .await
                .map_err(|b| self.save(b))?;
        }
        Ok(result)
    }

    async fn get_resolved(
        &self,
        keyspace: &Keyspace,
        id: &str,
    ) -> Result<Option<TransactionGetResult>, TransactionOperationFailed> {
        // Set once an ATR entry has been found missing, so a second miss
        // treats the blocking attempt as lost.
        let mut missing_attempt: Option<String> = None;
        loop {
            let doc = match self.timed(self.inner.docs.lookup(keyspace, id)).await {
                Ok(doc) => doc,
                Err(KvError::DocumentNotFound) => return Ok(None),
                Err(err) => return self.triage_get(err.into()),
            };

            let Some(txn) = &doc.txn else {
                return Ok(pre_transaction(keyspace, id, &doc));
            };
            if missing_attempt.as_deref() == Some(txn.id.atmpt.as_str()) {
                return Ok(pre_transaction(keyspace, id, &doc));
            }
            if txn.id.atmpt == self.inner.attempt_id {
                return Ok(post_transaction(keyspace, id, &doc));
            }

            let atr = txn.atr.to_atr_ref();
            let entry = match self
                .timed(self.inner.atrs.find_entry(&atr, &txn.id.atmpt))
                .await
            {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    debug!(
                        attempt_id = %self.inner.attempt_id,
                        id,
                        blocking = %txn.id.atmpt,
                        "ATR entry of staging attempt not found, rechecking"
                    );
                    missing_attempt = Some(txn.id.atmpt.clone());
                    continue;
                }
                Err(err) => return self.triage_get(err.into()),
            };

            forward_compat::check(ForwardCompatStage::GetsReadingAtr, entry.forward_compat.as_ref())
                .await
                .map_err(|b| self.save(b))?;

            return Ok(match entry.state {
                AttemptState::Committed | AttemptState::Completed => {
                    post_transaction(keyspace, id, &doc)
                }
                _ => pre_transaction(keyspace, id, &doc),
            });
        }
    }

    fn triage_get(
        &self,
        err: OpError,
    ) -> Result<Option<TransactionGetResult>, TransactionOperationFailed> {
        let class = err.class();
        match triage::get(class) {
            Triage::Done => Ok(None),
            Triage::Fail(builder) => Err(self.save(builder.cause(err))),
            Triage::Retry | Triage::EnterOvertime => {
                Err(self.save(ErrorBuilder::new(class).cause(err)))
            }
        }
    }
}

fn result_from(
    keyspace: &Keyspace,
    id: &str,
    doc: &DocumentLookup,
    content: Value,
) -> TransactionGetResult {
    TransactionGetResult {
        txn: doc.txn.clone(),
        meta: doc.meta.clone(),
        ..TransactionGetResult::new(keyspace.clone(), id, content, doc.cas)
    }
}

/// The document as it was before any staged write.
fn pre_transaction(
    keyspace: &Keyspace,
    id: &str,
    doc: &DocumentLookup,
) -> Option<TransactionGetResult> {
    if doc.is_deleted
        || doc
            .txn
            .as_ref()
            .is_some_and(|t| t.op.kind == StagedOpType::Insert)
    {
        return None;
    }
    doc.body
        .clone()
        .map(|body| result_from(keyspace, id, doc, body))
}

/// The document as the staged write leaves it.
fn post_transaction(
    keyspace: &Keyspace,
    id: &str,
    doc: &DocumentLookup,
) -> Option<TransactionGetResult> {
    let txn = doc.txn.as_ref()?;
    if txn.op.kind == StagedOpType::Remove {
        return None;
    }
    txn.staged_content()
        .cloned()
        .map(|content| result_from(keyspace, id, doc, content))
}
