//! Finishing one attempt on behalf of its owner.
//!
//! Once the documents are settled the ATR entry is removed outright rather
//! than moved to COMPLETED or ROLLED_BACK. An entry that is gone reads the
//! same as a finished one to every other client: reads fall back to the
//! document's committed body and writers stop treating it as a blocker. A
//! racing owner that reaches the commit point first is detected while
//! removing the entry and reported as [`CleanupError::CommittedConcurrently`].

use std::fmt;

use tracing::{debug, info, warn};

use super::CleanupError;
use crate::atr::{AtrEntry, AtrRef, AtrRepository, AttemptState, DocRecord};
use crate::doc::{DocumentLookup, DocumentRepository};
use crate::forward_compat::{self, ForwardCompatStage, ForwardCompatibility};
use crate::kv::{DurabilityLevel, KvError, SharedKv};

/// An attempt to finish, as its ATR entry records it.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupRequest {
    pub attempt_id: String,
    pub atr: AtrRef,
    pub state: AttemptState,
    pub inserted: Vec<DocRecord>,
    pub replaced: Vec<DocRecord>,
    pub removed: Vec<DocRecord>,
    pub durability: DurabilityLevel,
    pub forward_compat: Option<ForwardCompatibility>,
}

impl CleanupRequest {
    /// A request for an entry read from `atr`. Entries that do not record a
    /// durability level are written back with `default_durability`.
    #[must_use]
    pub fn from_entry(atr: AtrRef, entry: &AtrEntry, default_durability: DurabilityLevel) -> Self {
        Self {
            attempt_id: entry.attempt_id.clone(),
            atr,
            state: entry.state,
            inserted: entry.inserted.clone(),
            replaced: entry.replaced.clone(),
            removed: entry.removed.clone(),
            durability: entry.durability.unwrap_or(default_durability),
            forward_compat: entry.forward_compat.clone(),
        }
    }
}

/// Outcome of one cleanup, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCleanupAttempt {
    pub success: bool,
    /// `true` for this client's own attempts, `false` for lost ones.
    pub is_regular: bool,
    pub attempt_id: String,
    pub atr: AtrRef,
    pub state: AttemptState,
    pub failure_reason: Option<String>,
}

impl fmt::Display for TransactionCleanupAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleanup of {} ({}) on {}: {}",
            self.attempt_id,
            self.state,
            self.atr,
            if self.success { "ok" } else { "failed" }
        )
    }
}

#[derive(Clone)]
pub struct Cleaner {
    kv: SharedKv,
    durability: DurabilityLevel,
}

impl Cleaner {
    #[must_use]
    pub fn new(kv: SharedKv, durability: DurabilityLevel) -> Self {
        Self { kv, durability }
    }

    #[must_use]
    pub const fn default_durability(&self) -> DurabilityLevel {
        self.durability
    }

    /// Finish the attempt in `request` and remove its ATR entry.
    ///
    /// Never fails outright: problems are reported in the returned
    /// attempt and the entry is left for a later pass.
    pub async fn cleanup(
        &self,
        request: &CleanupRequest,
        is_regular: bool,
    ) -> TransactionCleanupAttempt {
        let result = self.try_cleanup(request).await;
        match &result {
            Ok(()) => info!(
                attempt_id = %request.attempt_id,
                atr = %request.atr,
                state = %request.state,
                is_regular,
                "cleaned up attempt"
            ),
            Err(err) => warn!(
                attempt_id = %request.attempt_id,
                atr = %request.atr,
                state = %request.state,
                is_regular,
                error = %err,
                "cleanup failed"
            ),
        }
        TransactionCleanupAttempt {
            success: result.is_ok(),
            is_regular,
            attempt_id: request.attempt_id.clone(),
            atr: request.atr.clone(),
            state: request.state,
            failure_reason: result.err().map(|e| e.to_string()),
        }
    }

    async fn try_cleanup(&self, request: &CleanupRequest) -> Result<(), CleanupError> {
        forward_compat::check(ForwardCompatStage::CleanupEntry, request.forward_compat.as_ref())
            .await
            .map_err(|b| CleanupError::ForwardCompatibility(b.build()))?;

        let docs = DocumentRepository::new(self.kv.clone(), request.durability);
        match request.state {
            AttemptState::Committed => self.commit_docs(&docs, request).await?,
            AttemptState::Aborted => self.rollback_docs(&docs, request).await?,
            // A PENDING entry records no documents; the rest are finished.
            AttemptState::NothingWritten
            | AttemptState::Pending
            | AttemptState::Completed
            | AttemptState::RolledBack => {}
        }
        self.remove_entry(request).await
    }

    async fn commit_docs(
        &self,
        docs: &DocumentRepository,
        request: &CleanupRequest,
    ) -> Result<(), CleanupError> {
        for record in request.inserted.iter().chain(&request.replaced) {
            let Some(doc) = staged_doc(docs, request, record, true).await? else {
                continue;
            };
            docs.unstage_from_xattr(&record.keyspace(), &record.id, doc.cas)
                .await?;
            debug!(attempt_id = %request.attempt_id, id = %record.id, "committed staged write");
        }
        for record in &request.removed {
            let Some(doc) = staged_doc(docs, request, record, true).await? else {
                continue;
            };
            match docs.remove(&record.keyspace(), &record.id, doc.cas).await {
                Ok(_) | Err(KvError::DocumentNotFound) => {}
                Err(err) => return Err(err.into()),
            }
            debug!(attempt_id = %request.attempt_id, id = %record.id, "committed staged remove");
        }
        Ok(())
    }

    async fn rollback_docs(
        &self,
        docs: &DocumentRepository,
        request: &CleanupRequest,
    ) -> Result<(), CleanupError> {
        for record in &request.inserted {
            let Some(doc) = staged_doc(docs, request, record, false).await? else {
                continue;
            };
            let keyspace = record.keyspace();
            if doc.is_deleted {
                docs.clear_txn(&keyspace, &record.id, doc.cas, true).await?;
            } else {
                docs.remove(&keyspace, &record.id, doc.cas).await?;
            }
            debug!(attempt_id = %request.attempt_id, id = %record.id, "rolled back staged insert");
        }
        for record in request.replaced.iter().chain(&request.removed) {
            let Some(doc) = staged_doc(docs, request, record, false).await? else {
                continue;
            };
            docs.clear_txn(&record.keyspace(), &record.id, doc.cas, doc.is_deleted)
                .await?;
            debug!(attempt_id = %request.attempt_id, id = %record.id, "rolled back staged write");
        }
        Ok(())
    }

    async fn remove_entry(&self, request: &CleanupRequest) -> Result<(), CleanupError> {
        let atrs = AtrRepository::new(self.kv.clone(), request.durability);
        match atrs
            .remove_entry(&request.atr, &request.attempt_id, request.state)
            .await
        {
            Ok(_) | Err(KvError::PathNotFound(_) | KvError::DocumentNotFound) => Ok(()),
            Err(KvError::PathExists(_)) => {
                Err(CleanupError::CommittedConcurrently(request.attempt_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// The document at `record` if it still carries this attempt's staged write.
///
/// With `check_crc`, a document whose body changed since staging is left
/// alone.
async fn staged_doc(
    docs: &DocumentRepository,
    request: &CleanupRequest,
    record: &DocRecord,
    check_crc: bool,
) -> Result<Option<DocumentLookup>, CleanupError> {
    let doc = match docs.lookup(&record.keyspace(), &record.id).await {
        Ok(doc) => doc,
        Err(KvError::DocumentNotFound) => {
            debug!(attempt_id = %request.attempt_id, id = %record.id, "document is gone");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let Some(txn) = &doc.txn else {
        debug!(attempt_id = %request.attempt_id, id = %record.id, "document is no longer staged");
        return Ok(None);
    };
    if txn.id.atmpt != request.attempt_id {
        debug!(
            attempt_id = %request.attempt_id,
            id = %record.id,
            staged_by = %txn.id.atmpt,
            "document is staged by another attempt"
        );
        return Ok(None);
    }
    if check_crc {
        let current = doc.meta.as_ref().and_then(|m| m.value_crc32c.as_deref());
        if let (Some(staged), Some(current)) = (txn.op.crc32.as_deref(), current)
            && staged != current
        {
            warn!(attempt_id = %request.attempt_id, id = %record.id, "document changed since staging, skipping");
            return Ok(None);
        }
    }
    Ok(Some(doc))
}
