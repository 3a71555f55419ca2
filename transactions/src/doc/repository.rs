use serde_json::Value;

use super::{DocumentMetadata, STAGED_CONTENT_PATH, TXN_XATTR, TransactionXattrs};
use crate::kv::{
    DurabilityLevel, KvError, Keyspace, LookupInOptions, LookupInSpec, MutateInOptions,
    MutateInSpec, MutationMacro, SharedKv, StoreSemantics,
};

/// A document as seen by the protocol, tombstones included.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLookup {
    pub cas: u64,
    pub is_deleted: bool,
    pub txn: Option<TransactionXattrs>,
    pub meta: Option<DocumentMetadata>,
    /// `None` for tombstones.
    pub body: Option<Value>,
}

impl DocumentLookup {
    /// Whether the document carries metadata written by `attempt_id`.
    #[must_use]
    pub fn staged_by(&self, attempt_id: &str) -> bool {
        self.txn.as_ref().is_some_and(|t| t.id.atmpt == attempt_id)
    }
}

#[derive(Clone)]
pub struct DocumentRepository {
    kv: SharedKv,
    durability: DurabilityLevel,
}

impl DocumentRepository {
    #[must_use]
    pub fn new(kv: SharedKv, durability: DurabilityLevel) -> Self {
        Self { kv, durability }
    }

    fn options(&self, semantics: StoreSemantics) -> MutateInOptions {
        MutateInOptions::new(semantics).durability(self.durability)
    }

    pub async fn lookup(&self, keyspace: &Keyspace, id: &str) -> Result<DocumentLookup, KvError> {
        let result = self
            .kv
            .lookup_in(
                keyspace,
                id,
                vec![
                    LookupInSpec::xattr(TXN_XATTR),
                    LookupInSpec::xattr(LookupInSpec::DOCUMENT),
                    LookupInSpec::GetFull,
                ],
                LookupInOptions::access_deleted(),
            )
            .await?;
        Ok(DocumentLookup {
            cas: result.cas,
            is_deleted: result.is_deleted,
            txn: result.content_as(0)?,
            meta: result.content_as(1)?,
            body: result.raw(2).cloned(),
        })
    }

    fn staging_specs(xattrs: &TransactionXattrs) -> Result<Vec<MutateInSpec>, KvError> {
        let value = serde_json::to_value(xattrs).map_err(|e| KvError::Decoding(e.to_string()))?;
        Ok(vec![
            MutateInSpec::upsert_xattr(TXN_XATTR, value),
            MutateInSpec::upsert_xattr("txn.op.crc32", MutationMacro::ValueCrc32c),
        ])
    }

    /// Stage an insert as a tombstone. A zero `cas` creates the document;
    /// otherwise the tombstone or staged insert with that CAS is overwritten.
    pub async fn stage_insert(
        &self,
        keyspace: &Keyspace,
        id: &str,
        xattrs: &TransactionXattrs,
        cas: u64,
    ) -> Result<u64, KvError> {
        let specs = Self::staging_specs(xattrs)?;
        let options = if cas == 0 {
            self.options(StoreSemantics::Insert)
                .access_deleted(true)
                .create_as_deleted(true)
        } else {
            self.options(StoreSemantics::Replace)
                .cas(cas)
                .access_deleted(true)
        };
        Ok(self.kv.mutate_in(keyspace, id, specs, options).await?.cas)
    }

    /// Stage a replace or remove on an existing document.
    pub async fn stage_mutation(
        &self,
        keyspace: &Keyspace,
        id: &str,
        xattrs: &TransactionXattrs,
        cas: u64,
        access_deleted: bool,
    ) -> Result<u64, KvError> {
        let specs = Self::staging_specs(xattrs)?;
        let options = self
            .options(StoreSemantics::Replace)
            .cas(cas)
            .access_deleted(access_deleted);
        Ok(self.kv.mutate_in(keyspace, id, specs, options).await?.cas)
    }

    /// Drop the `txn` attribute, leaving the body as it was.
    pub async fn clear_txn(
        &self,
        keyspace: &Keyspace,
        id: &str,
        cas: u64,
        access_deleted: bool,
    ) -> Result<u64, KvError> {
        let options = self
            .options(StoreSemantics::Replace)
            .cas(cas)
            .access_deleted(access_deleted);
        let specs = vec![MutateInSpec::remove_xattr(TXN_XATTR)];
        Ok(self.kv.mutate_in(keyspace, id, specs, options).await?.cas)
    }

    /// Make staged content visible.
    ///
    /// With `insert_mode` the document is created outright, which is how an
    /// unstage recovers from the document having vanished. Otherwise the
    /// metadata is removed and the body set in one CAS-guarded mutation that
    /// also revives a staged tombstone.
    pub async fn unstage(
        &self,
        keyspace: &Keyspace,
        id: &str,
        content: Value,
        cas: u64,
        insert_mode: bool,
    ) -> Result<u64, KvError> {
        if insert_mode {
            return Ok(self
                .kv
                .insert(keyspace, id, content, self.durability)
                .await?
                .cas);
        }
        let specs = vec![
            MutateInSpec::remove_xattr(TXN_XATTR),
            MutateInSpec::SetDoc(content),
        ];
        let options = self
            .options(StoreSemantics::Replace)
            .cas(cas)
            .access_deleted(true)
            .revive_document(true);
        Ok(self.kv.mutate_in(keyspace, id, specs, options).await?.cas)
    }

    /// Make the staged content visible using the copy stored on the document.
    pub async fn unstage_from_xattr(
        &self,
        keyspace: &Keyspace,
        id: &str,
        cas: u64,
    ) -> Result<u64, KvError> {
        let specs = vec![
            MutateInSpec::ReplaceBodyWithXattr {
                path: STAGED_CONTENT_PATH.to_string(),
            },
            MutateInSpec::remove_xattr(TXN_XATTR),
        ];
        let options = self
            .options(StoreSemantics::Replace)
            .cas(cas)
            .access_deleted(true)
            .revive_document(true);
        Ok(self.kv.mutate_in(keyspace, id, specs, options).await?.cas)
    }

    pub async fn remove(&self, keyspace: &Keyspace, id: &str, cas: u64) -> Result<u64, KvError> {
        Ok(self.kv.remove(keyspace, id, cas, self.durability).await?.cas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::AtrRef;
    use crate::doc::{AtrLink, StagedOp, StagedOpType, TxnIds};
    use crate::kv::KvStore;
    use crate::simulation::SimulatedKv;
    use crate::time::SimulatedTimeSource;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<SimulatedKv>, DocumentRepository, Keyspace) {
        let time = Arc::new(SimulatedTimeSource::default());
        let kv = Arc::new(SimulatedKv::new(1, time));
        let repo = DocumentRepository::new(kv.clone(), DurabilityLevel::None);
        (kv, repo, Keyspace::default_collection("b"))
    }

    fn xattrs(kind: StagedOpType, content: Option<Value>) -> TransactionXattrs {
        let atr = AtrRef {
            keyspace: Keyspace::default_collection("b"),
            id: "_txn:atr-0-#0".to_string(),
        };
        TransactionXattrs {
            id: TxnIds {
                txn: "t".to_string(),
                atmpt: "a".to_string(),
                op: None,
            },
            atr: AtrLink::from(&atr),
            op: StagedOp {
                kind,
                stgd: content,
                crc32: None,
            },
            restore: None,
            fc: None,
        }
    }

    #[tokio::test]
    async fn test_staged_insert_is_hidden_until_unstaged() {
        let (kv, repo, ks) = setup();
        let cas = repo
            .stage_insert(&ks, "d", &xattrs(StagedOpType::Insert, Some(json!({"v": 1}))), 0)
            .await
            .unwrap();
        assert!(!kv.contains(&ks, "d"));

        let doc = repo.lookup(&ks, "d").await.unwrap();
        assert!(doc.is_deleted);
        assert!(doc.staged_by("a"));
        assert!(!doc.staged_by("b"));
        assert_eq!(doc.body, None);
        assert!(doc.txn.as_ref().unwrap().op.crc32.is_some());

        repo.unstage(&ks, "d", json!({"v": 1}), cas, false).await.unwrap();
        let doc = repo.lookup(&ks, "d").await.unwrap();
        assert!(!doc.is_deleted);
        assert_eq!(doc.txn, None);
        assert_eq!(doc.body, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_staged_replace_keeps_body() {
        let (kv, repo, ks) = setup();
        let cas = kv
            .insert(&ks, "d", json!({"v": 0}), DurabilityLevel::None)
            .await
            .unwrap()
            .cas;
        let staged = repo
            .stage_mutation(
                &ks,
                "d",
                &xattrs(StagedOpType::Replace, Some(json!({"v": 2}))),
                cas,
                false,
            )
            .await
            .unwrap();
        assert_eq!(kv.get(&ks, "d").await.unwrap().content, json!({"v": 0}));

        assert_eq!(
            repo.stage_mutation(&ks, "d", &xattrs(StagedOpType::Remove, None), cas, false)
                .await,
            Err(KvError::CasMismatch)
        );

        repo.unstage_from_xattr(&ks, "d", staged).await.unwrap();
        assert_eq!(kv.get(&ks, "d").await.unwrap().content, json!({"v": 2}));
        assert_eq!(kv.xattr(&ks, "d", "txn"), None);
    }

    #[tokio::test]
    async fn test_clear_txn_on_staged_insert_tombstone() {
        let (kv, repo, ks) = setup();
        let cas = repo
            .stage_insert(&ks, "d", &xattrs(StagedOpType::Insert, Some(json!(1))), 0)
            .await
            .unwrap();
        repo.clear_txn(&ks, "d", cas, true).await.unwrap();
        assert!(kv.is_tombstone(&ks, "d"));
        assert_eq!(kv.xattr(&ks, "d", "txn"), None);

        // Restaging over the bare tombstone needs its CAS.
        let doc = repo.lookup(&ks, "d").await.unwrap();
        assert_eq!(
            repo.stage_insert(&ks, "d", &xattrs(StagedOpType::Insert, Some(json!(2))), 0)
                .await,
            Err(KvError::DocumentExists)
        );
        repo.stage_insert(&ks, "d", &xattrs(StagedOpType::Insert, Some(json!(2))), doc.cas)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unstage_insert_mode_creates_document() {
        let (kv, repo, ks) = setup();
        repo.unstage(&ks, "d", json!({"x": true}), 0, true).await.unwrap();
        assert_eq!(kv.get(&ks, "d").await.unwrap().content, json!({"x": true}));
        assert_eq!(
            repo.unstage(&ks, "d", json!({}), 0, true).await,
            Err(KvError::DocumentExists)
        );
    }
}
