//! Transactional metadata on ordinary documents.
//!
//! A staged write leaves the document body untouched and records the new
//! content, the owning attempt and its ATR in the `txn` extended attribute.
//! Staged inserts are created as tombstones so non-transactional readers do
//! not see them.

mod repository;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atr::AtrRef;
use crate::forward_compat::ForwardCompatibility;
use crate::kv::{Keyspace, cas_from_macro_string};

pub use repository::{DocumentLookup, DocumentRepository};

/// Name of the extended attribute holding transactional metadata.
pub const TXN_XATTR: &str = "txn";
pub const STAGED_CONTENT_PATH: &str = "txn.op.stgd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedOpType {
    Insert,
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnIds {
    pub txn: String,
    pub atmpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtrLink {
    pub id: String,
    pub bkt: String,
    pub scp: String,
    pub coll: String,
}

impl AtrLink {
    #[must_use]
    pub fn to_atr_ref(&self) -> AtrRef {
        AtrRef {
            keyspace: Keyspace::new(&self.bkt, &self.scp, &self.coll),
            id: self.id.clone(),
        }
    }
}

impl From<&AtrRef> for AtrLink {
    fn from(atr: &AtrRef) -> Self {
        Self {
            id: atr.id.clone(),
            bkt: atr.keyspace.bucket.clone(),
            scp: atr.keyspace.scope.clone(),
            coll: atr.keyspace.collection.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedOp {
    #[serde(rename = "type")]
    pub kind: StagedOpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stgd: Option<Value>,
    /// CRC of the body when the write was staged, filled in by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
}

/// Pre-transaction metadata, kept so a staged replace or remove can be
/// recognised as stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMeta {
    #[serde(rename = "CAS")]
    pub cas: String,
    pub revid: String,
    pub exptime: u64,
}

/// The `txn` extended attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionXattrs {
    pub id: TxnIds,
    pub atr: AtrLink,
    pub op: StagedOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fc: Option<ForwardCompatibility>,
}

impl TransactionXattrs {
    #[must_use]
    pub fn staged_content(&self) -> Option<&Value> {
        self.op.stgd.as_ref()
    }
}

/// The `$document` virtual extended attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "CAS")]
    pub cas: String,
    pub revid: String,
    #[serde(default)]
    pub exptime: u64,
    #[serde(default)]
    pub value_crc32c: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl DocumentMetadata {
    #[must_use]
    pub fn cas_value(&self) -> Option<u64> {
        cas_from_macro_string(&self.cas)
    }

    #[must_use]
    pub fn to_restore(&self) -> RestoreMeta {
        RestoreMeta {
            cas: self.cas.clone(),
            revid: self.revid.clone(),
            exptime: self.exptime,
        }
    }
}
