//! The Active Transaction Record.
//!
//! An ATR is an ordinary document whose `attempts` extended attribute holds
//! one entry per attempt that chose it. The entry's state is the single
//! source of truth for whether that attempt's staged writes are committed.

mod ids;
mod repository;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::forward_compat::ForwardCompatibility;
use crate::kv::{DurabilityLevel, Keyspace, cas_from_macro_string, cas_to_millis};

pub use ids::{
    DEFAULT_NUM_ATRS, NUM_VBUCKETS, all_atr_ids, atr_id, atr_id_for_key, vbucket_for_key,
};
pub use repository::{AtrDocument, AtrRepository, MutationLists};

/// Where an attempt's ATR entry lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtrRef {
    pub keyspace: Keyspace,
    pub id: String,
}

impl fmt::Display for AtrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.id)
    }
}

/// Lifecycle of an attempt as recorded in its ATR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    NothingWritten,
    Pending,
    Aborted,
    Committed,
    Completed,
    RolledBack,
}

impl AttemptState {
    /// Whether the protocol allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::NothingWritten,
                Self::Pending | Self::Completed | Self::RolledBack
            ) | (Self::Pending, Self::Committed | Self::Aborted)
                | (Self::Committed, Self::Completed)
                | (Self::Aborted, Self::RolledBack)
        )
    }

    /// No further protocol step will be taken by the owner.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NothingWritten => "NOTHING_WRITTEN",
            Self::Pending => "PENDING",
            Self::Aborted => "ABORTED",
            Self::Committed => "COMMITTED",
            Self::Completed => "COMPLETED",
            Self::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

/// A document listed in an ATR entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRecord {
    #[serde(rename = "bkt")]
    pub bucket: String,
    #[serde(rename = "scp")]
    pub scope: String,
    #[serde(rename = "col")]
    pub collection: String,
    pub id: String,
}

impl DocRecord {
    #[must_use]
    pub fn new(keyspace: &Keyspace, id: impl Into<String>) -> Self {
        Self {
            bucket: keyspace.bucket.clone(),
            scope: keyspace.scope.clone(),
            collection: keyspace.collection.clone(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.bucket, &self.scope, &self.collection)
    }
}

/// The stored form of an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct AtrEntryWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub st: Option<AttemptState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsco: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsrs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsrc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ins: Option<Vec<DocRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rep: Option<Vec<DocRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rem: Option<Vec<DocRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fc: Option<ForwardCompatibility>,
}

/// One attempt's ATR entry, with CAS timestamps converted to milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct AtrEntry {
    pub attempt_id: String,
    pub transaction_id: Option<String>,
    pub state: AttemptState,
    pub start_ms: Option<u64>,
    pub commit_start_ms: Option<u64>,
    pub complete_ms: Option<u64>,
    pub rollback_start_ms: Option<u64>,
    pub rollback_complete_ms: Option<u64>,
    pub expires_after_ms: Option<u64>,
    pub durability: Option<DurabilityLevel>,
    pub inserted: Vec<DocRecord>,
    pub replaced: Vec<DocRecord>,
    pub removed: Vec<DocRecord>,
    pub forward_compat: Option<ForwardCompatibility>,
}

fn macro_ms(s: Option<&str>) -> Option<u64> {
    s.and_then(cas_from_macro_string).map(cas_to_millis)
}

impl AtrEntry {
    /// Parse the value stored at `attempts.<attempt_id>`.
    ///
    /// An entry without a state reads as `NOTHING_WRITTEN`.
    pub fn from_value(attempt_id: impl Into<String>, value: &Value) -> Result<Self, serde_json::Error> {
        let wire: AtrEntryWire = serde_json::from_value(value.clone())?;
        Ok(Self::from_wire(attempt_id.into(), wire))
    }

    pub(crate) fn from_wire(attempt_id: String, wire: AtrEntryWire) -> Self {
        Self {
            attempt_id,
            start_ms: macro_ms(wire.tst.as_deref()),
            commit_start_ms: macro_ms(wire.tsc.as_deref()),
            complete_ms: macro_ms(wire.tsco.as_deref()),
            rollback_start_ms: macro_ms(wire.tsrs.as_deref()),
            rollback_complete_ms: macro_ms(wire.tsrc.as_deref()),
            transaction_id: wire.tid,
            state: wire.st.unwrap_or(AttemptState::NothingWritten),
            expires_after_ms: wire.exp,
            durability: wire.d.as_deref().and_then(DurabilityLevel::from_short_str),
            inserted: wire.ins.unwrap_or_default(),
            replaced: wire.rep.unwrap_or_default(),
            removed: wire.rem.unwrap_or_default(),
            forward_compat: wire.fc,
        }
    }

    /// Whether the owner has run past its expiry budget, judged by the
    /// server clock.
    #[must_use]
    pub fn has_expired(&self, hlc_now_ms: u64) -> bool {
        match (self.start_ms, self.expires_after_ms) {
            (Some(start), Some(exp)) => start.saturating_add(exp) < hlc_now_ms,
            _ => false,
        }
    }

    #[must_use]
    pub fn age_ms(&self, hlc_now_ms: u64) -> Option<u64> {
        self.start_ms.map(|start| hlc_now_ms.saturating_sub(start))
    }
}
