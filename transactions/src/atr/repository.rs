//! Reads and writes of ATR entries.
//!
//! Every state change is one sub-document mutation on the ATR document. The
//! timestamps are `${Mutation.CAS}` macros so they come from the server clock.

use serde_json::{Value, json};

use super::{AtrEntry, AtrRef, AttemptState, DocRecord};
use crate::kv::{
    DurabilityLevel, KvError, LookupInOptions, LookupInSpec, MutateInOptions, MutateInSpec,
    MutationMacro, ParsedHlc, SharedKv, StoreSemantics,
};

fn entry_path(attempt_id: &str, field: &str) -> String {
    format!("attempts.{attempt_id}.{field}")
}

/// Every entry in one ATR, plus the server clock at the time of the read.
#[derive(Debug, Clone)]
pub struct AtrDocument {
    pub cas: u64,
    pub hlc_now_ms: u64,
    pub entries: Vec<AtrEntry>,
}

/// The mutated documents recorded when an attempt commits or aborts.
#[derive(Debug, Clone, Default)]
pub struct MutationLists {
    pub inserted: Vec<DocRecord>,
    pub replaced: Vec<DocRecord>,
    pub removed: Vec<DocRecord>,
}

impl MutationLists {
    fn specs(&self, attempt_id: &str) -> Vec<MutateInSpec> {
        vec![
            MutateInSpec::upsert_xattr(entry_path(attempt_id, "ins"), json!(self.inserted)),
            MutateInSpec::upsert_xattr(entry_path(attempt_id, "rep"), json!(self.replaced)),
            MutateInSpec::upsert_xattr(entry_path(attempt_id, "rem"), json!(self.removed)),
        ]
    }
}

#[derive(Clone)]
pub struct AtrRepository {
    kv: SharedKv,
    durability: DurabilityLevel,
}

impl AtrRepository {
    #[must_use]
    pub fn new(kv: SharedKv, durability: DurabilityLevel) -> Self {
        Self { kv, durability }
    }

    async fn mutate(
        &self,
        atr: &AtrRef,
        specs: Vec<MutateInSpec>,
        semantics: StoreSemantics,
    ) -> Result<u64, KvError> {
        let result = self
            .kv
            .mutate_in(
                &atr.keyspace,
                &atr.id,
                specs,
                MutateInOptions::new(semantics).durability(self.durability),
            )
            .await?;
        Ok(result.cas)
    }

    /// Add a PENDING entry, creating the ATR document if needed.
    pub async fn set_pending(
        &self,
        atr: &AtrRef,
        transaction_id: &str,
        attempt_id: &str,
        expires_after_ms: u64,
    ) -> Result<u64, KvError> {
        let specs = vec![
            MutateInSpec::insert_xattr(entry_path(attempt_id, "tid"), json!(transaction_id)),
            MutateInSpec::insert_xattr(
                entry_path(attempt_id, "st"),
                json!(AttemptState::Pending.to_string()),
            ),
            MutateInSpec::insert_xattr(entry_path(attempt_id, "tst"), MutationMacro::Cas),
            MutateInSpec::insert_xattr(entry_path(attempt_id, "exp"), json!(expires_after_ms)),
            MutateInSpec::insert_xattr(
                entry_path(attempt_id, "d"),
                json!(self.durability.short_str()),
            ),
            MutateInSpec::SetDoc(json!({})),
        ];
        self.mutate(atr, specs, StoreSemantics::Upsert).await
    }

    /// The commit point. The pending sentinel makes a repeated commit fail
    /// with `PathExists`, which is how an ambiguous commit is detected.
    pub async fn set_committed(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        lists: &MutationLists,
    ) -> Result<u64, KvError> {
        let mut specs = vec![
            MutateInSpec::upsert_xattr(
                entry_path(attempt_id, "st"),
                json!(AttemptState::Committed.to_string()),
            ),
            MutateInSpec::upsert_xattr(entry_path(attempt_id, "tsc"), MutationMacro::Cas),
        ];
        specs.extend(lists.specs(attempt_id));
        specs.push(MutateInSpec::insert_xattr(entry_path(attempt_id, "p"), json!(0)));
        self.mutate(atr, specs, StoreSemantics::Replace).await
    }

    pub async fn set_completed(&self, atr: &AtrRef, attempt_id: &str) -> Result<u64, KvError> {
        let specs = vec![
            MutateInSpec::upsert_xattr(
                entry_path(attempt_id, "st"),
                json!(AttemptState::Completed.to_string()),
            ),
            MutateInSpec::upsert_xattr(entry_path(attempt_id, "tsco"), MutationMacro::Cas),
        ];
        self.mutate(atr, specs, StoreSemantics::Replace).await
    }

    pub async fn set_aborted(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        lists: &MutationLists,
    ) -> Result<u64, KvError> {
        let mut specs = vec![
            MutateInSpec::upsert_xattr(
                entry_path(attempt_id, "st"),
                json!(AttemptState::Aborted.to_string()),
            ),
            MutateInSpec::upsert_xattr(entry_path(attempt_id, "tsrs"), MutationMacro::Cas),
        ];
        specs.extend(lists.specs(attempt_id));
        self.mutate(atr, specs, StoreSemantics::Replace).await
    }

    pub async fn set_rolled_back(&self, atr: &AtrRef, attempt_id: &str) -> Result<u64, KvError> {
        let specs = vec![
            MutateInSpec::upsert_xattr(
                entry_path(attempt_id, "st"),
                json!(AttemptState::RolledBack.to_string()),
            ),
            MutateInSpec::upsert_xattr(entry_path(attempt_id, "tsrc"), MutationMacro::Cas),
        ];
        self.mutate(atr, specs, StoreSemantics::Replace).await
    }

    /// Delete an entry. A PENDING entry is only removed if its owner has not
    /// reached the commit point in the meantime.
    pub async fn remove_entry(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        state: AttemptState,
    ) -> Result<u64, KvError> {
        let mut specs = Vec::with_capacity(2);
        if state == AttemptState::Pending {
            specs.push(MutateInSpec::insert_xattr(entry_path(attempt_id, "p"), json!(0)));
        }
        specs.push(MutateInSpec::remove_xattr(format!("attempts.{attempt_id}")));
        self.mutate(atr, specs, StoreSemantics::Replace).await
    }

    /// Read the state of one entry; `None` if the ATR or entry is absent.
    pub async fn lookup_state(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
    ) -> Result<Option<AttemptState>, KvError> {
        let result = match self
            .kv
            .lookup_in(
                &atr.keyspace,
                &atr.id,
                vec![LookupInSpec::xattr(entry_path(attempt_id, "st"))],
                LookupInOptions::default(),
            )
            .await
        {
            Ok(result) => result,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        result.content_as::<AttemptState>(0)
    }

    /// Read one entry; `None` if the ATR or entry is absent.
    pub async fn find_entry(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
    ) -> Result<Option<AtrEntry>, KvError> {
        let result = match self
            .kv
            .lookup_in(
                &atr.keyspace,
                &atr.id,
                vec![LookupInSpec::xattr(format!("attempts.{attempt_id}"))],
                LookupInOptions::default(),
            )
            .await
        {
            Ok(result) => result,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        result
            .raw(0)
            .map(|v| {
                AtrEntry::from_value(attempt_id, v).map_err(|e| KvError::Decoding(e.to_string()))
            })
            .transpose()
    }

    /// Read one entry together with the server clock, so the caller can
    /// judge whether its owner has expired.
    pub async fn find_entry_with_clock(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
    ) -> Result<Option<(AtrEntry, u64)>, KvError> {
        let result = match self
            .kv
            .lookup_in(
                &atr.keyspace,
                &atr.id,
                vec![
                    LookupInSpec::xattr(format!("attempts.{attempt_id}")),
                    LookupInSpec::xattr(LookupInSpec::HLC),
                ],
                LookupInOptions::default(),
            )
            .await
        {
            Ok(result) => result,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        let Some(value) = result.raw(0) else {
            return Ok(None);
        };
        let entry =
            AtrEntry::from_value(attempt_id, value).map_err(|e| KvError::Decoding(e.to_string()))?;
        let hlc_now_ms = result
            .raw(1)
            .and_then(ParsedHlc::from_value)
            .map_or(0, |h| h.now_ms);
        Ok(Some((entry, hlc_now_ms)))
    }

    /// Read every entry; `None` if the ATR document does not exist.
    pub async fn lookup_all(&self, atr: &AtrRef) -> Result<Option<AtrDocument>, KvError> {
        let result = match self
            .kv
            .lookup_in(
                &atr.keyspace,
                &atr.id,
                vec![
                    LookupInSpec::xattr("attempts"),
                    LookupInSpec::xattr(LookupInSpec::HLC),
                ],
                LookupInOptions::default(),
            )
            .await
        {
            Ok(result) => result,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(err),
        };

        let hlc_now_ms = result
            .raw(1)
            .and_then(ParsedHlc::from_value)
            .map(|h| h.now_ms)
            .ok_or_else(|| KvError::Decoding("missing $vbucket.HLC".to_string()))?;

        let mut entries = Vec::new();
        if let Some(Value::Object(attempts)) = result.raw(0) {
            for (attempt_id, value) in attempts {
                match AtrEntry::from_value(attempt_id.clone(), value) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        tracing::warn!(atr = %atr, attempt_id, %err, "skipping unreadable ATR entry");
                    }
                }
            }
        }
        Ok(Some(AtrDocument {
            cas: result.cas,
            hlc_now_ms,
            entries,
        }))
    }
}
