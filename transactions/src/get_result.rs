use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::doc::{DocumentMetadata, TransactionXattrs};
use crate::kv::{KvError, Keyspace};

/// A document read inside a transaction.
///
/// Carries the CAS and metadata needed to stage a later replace or remove of
/// the same document.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionGetResult {
    pub(crate) keyspace: Keyspace,
    pub(crate) id: String,
    pub(crate) content: Value,
    pub(crate) cas: u64,
    pub(crate) txn: Option<TransactionXattrs>,
    pub(crate) meta: Option<DocumentMetadata>,
}

impl TransactionGetResult {
    pub(crate) fn new(keyspace: Keyspace, id: impl Into<String>, content: Value, cas: u64) -> Self {
        Self {
            keyspace,
            id: id.into(),
            content,
            cas,
            txn: None,
            meta: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    #[must_use]
    pub const fn cas(&self) -> u64 {
        self.cas
    }

    #[must_use]
    pub const fn content(&self) -> &Value {
        &self.content
    }

    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, KvError> {
        serde_json::from_value(self.content.clone()).map_err(|e| KvError::Decoding(e.to_string()))
    }
}
