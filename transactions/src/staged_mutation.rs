//! Documents the current attempt has staged.
//!
//! Operations on different documents within one attempt may run concurrently,
//! so the collection is shared behind a lock. At most one mutation is kept per
//! document; staging the same document again replaces the earlier record.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::atr::{DocRecord, MutationLists};
use crate::kv::Keyspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagedMutationType {
    Insert,
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedMutation {
    pub keyspace: Keyspace,
    pub id: String,
    pub kind: StagedMutationType,
    /// Staged body; `None` for removes.
    pub content: Option<Value>,
    /// CAS of the document after staging.
    pub cas: u64,
    pub operation_id: String,
}

impl StagedMutation {
    /// `bucket.scope.collection.id`, for logs.
    #[must_use]
    pub fn fq_id(&self) -> String {
        format!("{}.{}", self.keyspace, self.id)
    }

    #[must_use]
    pub fn doc_record(&self) -> DocRecord {
        DocRecord::new(&self.keyspace, &self.id)
    }
}

type Key = (Keyspace, String);

/// This attempt's staged writes, keyed by fully-qualified document id.
///
/// Shared by every operation of one attempt, including ones running
/// concurrently on different keys.
///
/// # Invariants
///
/// - At most one mutation per document; [`Self::add`] replaces the earlier one
/// - [`Self::inserts`], [`Self::replaces`] and [`Self::removes`] partition the
///   collection, each sorted by keyspace then id
///
/// # Post-conditions
///
/// - After `add(m)`, `find(&m.keyspace, &m.id)` returns `m` until the next
///   `add` or `remove` for that document
#[derive(Debug, Default)]
pub struct StagedMutationCollection {
    mutations: RwLock<HashMap<Key, StagedMutation>>,
}

impl StagedMutationCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn find(&self, keyspace: &Keyspace, id: &str) -> Option<StagedMutation> {
        self.mutations
            .read()
            .get(&(keyspace.clone(), id.to_string()))
            .cloned()
    }

    /// Record `mutation`, replacing any earlier one for the same document.
    pub fn add(&self, mutation: StagedMutation) {
        let key = (mutation.keyspace.clone(), mutation.id.clone());
        self.mutations.write().insert(key, mutation);
    }

    pub fn remove(&self, keyspace: &Keyspace, id: &str) -> Option<StagedMutation> {
        self.mutations
            .write()
            .remove(&(keyspace.clone(), id.to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.read().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.read().len()
    }

    fn of_kind(&self, kind: StagedMutationType) -> Vec<StagedMutation> {
        let mut out: Vec<_> = self
            .mutations
            .read()
            .values()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.keyspace, &a.id).cmp(&(&b.keyspace, &b.id)));
        out
    }

    #[must_use]
    pub fn inserts(&self) -> Vec<StagedMutation> {
        self.of_kind(StagedMutationType::Insert)
    }

    #[must_use]
    pub fn replaces(&self) -> Vec<StagedMutation> {
        self.of_kind(StagedMutationType::Replace)
    }

    #[must_use]
    pub fn removes(&self) -> Vec<StagedMutation> {
        self.of_kind(StagedMutationType::Remove)
    }

    #[must_use]
    pub fn all(&self) -> Vec<StagedMutation> {
        let mut out = self.inserts();
        out.extend(self.replaces());
        out.extend(self.removes());
        out
    }

    /// The per-kind document lists recorded in the ATR entry.
    #[must_use]
    pub fn to_lists(&self) -> MutationLists {
        let records = |v: Vec<StagedMutation>| v.iter().map(StagedMutation::doc_record).collect();
        MutationLists {
            inserted: records(self.inserts()),
            replaced: records(self.replaces()),
            removed: records(self.removes()),
        }
    }
}
