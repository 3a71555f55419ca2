//! The client record: a heartbeat registry of cleaning clients.
//!
//! Every client that cleans up lost transactions in a keyspace keeps an
//! entry under `records.clients.<uuid>` of one well-known document. The
//! sorted ids of the unexpired clients decide which ATRs each one scans, so
//! work is shared without electing a leader. A membership change shifts the
//! shares on every client's next heartbeat.
//!
//! # Invariants
//!
//! - A client is expired iff the server clock is strictly past its heartbeat
//!   plus its `expires_ms`.
//! - A client always counts itself as active, even before its own entry has
//!   been written and even if its entry looks expired. Its index is therefore
//!   always defined.
//! - All reads and writes go through sub-document operations on the record;
//!   concurrent updaters never overwrite each other's entries.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::CleanupError;
use crate::kv::{
    DurabilityLevel, KvError, Keyspace, LookupInOptions, LookupInSpec, MutateInOptions,
    MutateInSpec, MutationMacro, ParsedHlc, SharedKv, StoreSemantics, cas_from_macro_string,
    cas_to_millis,
};

pub const CLIENT_RECORD_ID: &str = "_txn:client-record";

/// Added to the cleanup window to give the heartbeat lifetime.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(20);

/// Expired clients removed per update, keeping a single mutation within the
/// sixteen specs the server accepts.
pub const MAX_EXPIRED_CLIENTS_REMOVED: usize = 12;

const REMOVE_MAX_DELAY: Duration = Duration::from_millis(250);

fn client_path(client_uuid: &str) -> String {
    format!("records.clients.{client_uuid}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecordEntry {
    /// `${Mutation.CAS}` of the client's last heartbeat.
    #[serde(rename = "heartbeat_ms", default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,
    #[serde(default)]
    pub expires_ms: u64,
    #[serde(default)]
    pub num_atrs: usize,
}

impl ClientRecordEntry {
    #[must_use]
    pub fn heartbeat_ms(&self) -> Option<u64> {
        self.heartbeat
            .as_deref()
            .and_then(cas_from_macro_string)
            .map(cas_to_millis)
    }

    /// An entry without a readable heartbeat counts as expired.
    #[must_use]
    pub fn is_expired(&self, hlc_now_ms: u64) -> bool {
        self.heartbeat_ms()
            .is_none_or(|hb| hlc_now_ms > hb.saturating_add(self.expires_ms))
    }
}

/// Suspends lost-transaction cleanup for every client until `expires`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecordOverride {
    #[serde(default)]
    pub enabled: bool,
    /// Server clock milliseconds.
    #[serde(default)]
    pub expires: u64,
}

/// The `records` extended attribute of the client record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecordDocument {
    #[serde(default)]
    pub clients: BTreeMap<String, ClientRecordEntry>,
    #[serde(rename = "override", default, skip_serializing_if = "Option::is_none")]
    pub record_override: Option<ClientRecordOverride>,
}

/// What one client concludes from reading the client record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecordDetails {
    pub client_uuid: String,
    /// Entries in the record, this client's included if present.
    pub num_existing_clients: usize,
    pub num_active_clients: usize,
    pub num_expired_clients: usize,
    /// Sorted; always contains this client.
    pub active_client_ids: Vec<String>,
    pub expired_client_ids: Vec<String>,
    pub index_of_this_client: usize,
    /// This client has no entry yet.
    pub client_is_new: bool,
    pub override_enabled: bool,
    pub override_active: bool,
    pub override_expires_ms: u64,
    pub hlc_now_ms: u64,
}

impl ClientRecordDetails {
    #[must_use]
    pub fn new(record: &ClientRecordDocument, hlc_now_ms: u64, client_uuid: &str) -> Self {
        let mut active_client_ids = vec![client_uuid.to_string()];
        let mut expired_client_ids = Vec::new();
        for (uuid, entry) in &record.clients {
            if uuid == client_uuid {
                continue;
            }
            if entry.is_expired(hlc_now_ms) {
                expired_client_ids.push(uuid.clone());
            } else {
                active_client_ids.push(uuid.clone());
            }
        }
        active_client_ids.sort();
        let index_of_this_client = active_client_ids
            .iter()
            .position(|id| id == client_uuid)
            .unwrap_or_default();

        let record_override = record.record_override.unwrap_or_default();
        Self {
            client_uuid: client_uuid.to_string(),
            num_existing_clients: record.clients.len(),
            num_active_clients: active_client_ids.len(),
            num_expired_clients: expired_client_ids.len(),
            active_client_ids,
            expired_client_ids,
            index_of_this_client,
            client_is_new: !record.clients.contains_key(client_uuid),
            override_enabled: record_override.enabled,
            override_active: record_override.enabled && record_override.expires > hlc_now_ms,
            override_expires_ms: record_override.expires,
            hlc_now_ms,
        }
    }

    /// Indexes of the ATRs this client scans.
    #[must_use]
    pub fn atr_indices(&self, num_atrs: usize) -> Vec<usize> {
        let active = self.num_active_clients.max(1);
        (0..num_atrs)
            .filter(|i| i % active == self.index_of_this_client)
            .collect()
    }

    /// The expired clients removed by the next update.
    #[must_use]
    pub fn expired_to_remove(&self) -> &[String] {
        let n = self.expired_client_ids.len().min(MAX_EXPIRED_CLIENTS_REMOVED);
        &self.expired_client_ids[..n]
    }
}

/// Access to the client record in one keyspace.
#[derive(Clone)]
pub struct ClientRecord {
    kv: SharedKv,
    keyspace: Keyspace,
    durability: DurabilityLevel,
}

impl ClientRecord {
    #[must_use]
    pub fn new(kv: SharedKv, keyspace: Keyspace, durability: DurabilityLevel) -> Self {
        Self {
            kv,
            keyspace,
            durability,
        }
    }

    #[must_use]
    pub const fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    fn options(&self, semantics: StoreSemantics) -> MutateInOptions {
        MutateInOptions::new(semantics).durability(self.durability)
    }

    /// Create the empty record. Losing the race to another client is fine.
    pub async fn create_placeholder(&self) -> Result<(), KvError> {
        let specs = vec![
            MutateInSpec::insert_xattr("records.clients", json!({})),
            MutateInSpec::SetDoc(json!({})),
        ];
        match self
            .kv
            .mutate_in(
                &self.keyspace,
                CLIENT_RECORD_ID,
                specs,
                self.options(StoreSemantics::Insert),
            )
            .await
        {
            Ok(_) => {
                info!(keyspace = %self.keyspace, "created client record");
                Ok(())
            }
            Err(KvError::DocumentExists) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// The record and the server clock; `None` if the record does not exist.
    pub async fn read(&self) -> Result<Option<(ClientRecordDocument, u64)>, CleanupError> {
        let result = match self
            .kv
            .lookup_in(
                &self.keyspace,
                CLIENT_RECORD_ID,
                vec![
                    LookupInSpec::xattr("records"),
                    LookupInSpec::xattr(LookupInSpec::HLC),
                ],
                LookupInOptions::default(),
            )
            .await
        {
            Ok(result) => result,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record = result
            .content_as::<ClientRecordDocument>(0)
            .map_err(|e| CleanupError::MalformedClientRecord(e.to_string()))?
            .unwrap_or_default();
        let hlc_now_ms = result
            .raw(1)
            .and_then(ParsedHlc::from_value)
            .map(|h| h.now_ms)
            .ok_or_else(|| CleanupError::MalformedClientRecord("missing $vbucket.HLC".to_string()))?;
        Ok(Some((record, hlc_now_ms)))
    }

    /// Refresh this client's heartbeat and drop expired clients.
    pub async fn update(
        &self,
        details: &ClientRecordDetails,
        expires_ms: u64,
        num_atrs: usize,
    ) -> Result<(), KvError> {
        let removals = details.expired_to_remove();
        match self.heartbeat(&details.client_uuid, expires_ms, num_atrs, removals).await {
            // Another client removed one of the expired entries first.
            Err(KvError::PathNotFound(path)) if !removals.is_empty() => {
                debug!(keyspace = %self.keyspace, path, "expired client already removed");
                self.heartbeat(&details.client_uuid, expires_ms, num_atrs, &[])
                    .await
            }
            other => {
                if other.is_ok() && !removals.is_empty() {
                    info!(keyspace = %self.keyspace, removed = ?removals, "removed expired clients");
                }
                other
            }
        }
    }

    async fn heartbeat(
        &self,
        client_uuid: &str,
        expires_ms: u64,
        num_atrs: usize,
        removals: &[String],
    ) -> Result<(), KvError> {
        let path = client_path(client_uuid);
        let mut specs = vec![
            MutateInSpec::upsert_xattr(format!("{path}.heartbeat_ms"), MutationMacro::Cas),
            MutateInSpec::upsert_xattr(format!("{path}.expires_ms"), json!(expires_ms)),
            MutateInSpec::upsert_xattr(format!("{path}.num_atrs"), json!(num_atrs)),
        ];
        specs.extend(
            removals
                .iter()
                .map(|uuid| MutateInSpec::remove_xattr(client_path(uuid))),
        );
        self.kv
            .mutate_in(
                &self.keyspace,
                CLIENT_RECORD_ID,
                specs,
                self.options(StoreSemantics::Replace),
            )
            .await?;
        debug!(keyspace = %self.keyspace, client_uuid, "heartbeat written");
        Ok(())
    }

    /// Remove this client's entry.
    pub async fn remove_client(&self, client_uuid: &str) -> Result<(), KvError> {
        match self
            .kv
            .mutate_in(
                &self.keyspace,
                CLIENT_RECORD_ID,
                vec![MutateInSpec::remove_xattr(client_path(client_uuid))],
                self.options(StoreSemantics::Replace),
            )
            .await
        {
            Ok(_) | Err(KvError::PathNotFound(_) | KvError::DocumentNotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// [`remove_client`](Self::remove_client), retried with a delay of
    /// `2^n` ms plus up to 10 ms of jitter until the delay passes 250 ms.
    pub async fn remove_client_with_retries(&self, client_uuid: &str) -> Result<(), KvError> {
        let mut retries = 0u32;
        loop {
            let Err(err) = self.remove_client(client_uuid).await else {
                info!(keyspace = %self.keyspace, client_uuid, "removed client from client record");
                return Ok(());
            };
            let delay = Duration::from_millis(
                2u64.saturating_pow(retries) + rand::rng().random_range(0..10),
            );
            if delay > REMOVE_MAX_DELAY {
                warn!(keyspace = %self.keyspace, client_uuid, error = %err, "giving up removing client");
                return Err(err);
            }
            debug!(keyspace = %self.keyspace, client_uuid, error = %err, ?delay, "retrying client removal");
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::cas_to_macro_string;
    use crate::simulation::{KvOp, ScriptedFault, SimulatedKv};
    use crate::time::{SimulatedTimeSource, TimeSource};
    use proptest::prelude::*;
    use std::sync::Arc;

    const NOW: u64 = 1_700_000_100_000;

    fn entry(heartbeat_ms: u64, expires_ms: u64) -> ClientRecordEntry {
        ClientRecordEntry {
            heartbeat: Some(cas_to_macro_string(heartbeat_ms * 1_000_000)),
            expires_ms,
            num_atrs: 1024,
        }
    }

    fn record(clients: &[(&str, ClientRecordEntry)]) -> ClientRecordDocument {
        ClientRecordDocument {
            clients: clients
                .iter()
                .map(|(id, e)| ((*id).to_string(), e.clone()))
                .collect(),
            record_override: None,
        }
    }

    #[test]
    fn test_this_client_always_counts_itself() {
        let details = ClientRecordDetails::new(&record(&[]), NOW, "me");
        assert!(details.client_is_new);
        assert_eq!(details.num_existing_clients, 0);
        assert_eq!(details.num_active_clients, 1);
        assert_eq!(details.active_client_ids, vec!["me".to_string()]);
        assert_eq!(details.index_of_this_client, 0);
        assert_eq!(details.atr_indices(4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_expired_other_client_is_excluded_but_self_is_not() {
        let long_ago = NOW - 60_000;
        let details = ClientRecordDetails::new(
            &record(&[("me", entry(long_ago, 10)), ("other", entry(long_ago, 10))]),
            NOW,
            "me",
        );
        assert_eq!(details.num_existing_clients, 2);
        assert_eq!(details.num_expired_clients, 1);
        assert_eq!(details.expired_client_ids, vec!["other".to_string()]);
        assert_eq!(details.num_active_clients, 1);
        assert_eq!(details.index_of_this_client, 0);
        assert!(!details.client_is_new);
    }

    #[test]
    fn test_expiry_boundary() {
        let hb = NOW - 1_000;
        assert!(!entry(hb, 1_000).is_expired(NOW));
        assert!(entry(hb, 1_000).is_expired(NOW + 1));
        assert!(ClientRecordEntry::default().is_expired(NOW));
    }

    #[test]
    fn test_partitioning_by_sorted_index() {
        let fresh = entry(NOW, 60_000);
        let details = ClientRecordDetails::new(
            &record(&[("a", fresh.clone()), ("c", fresh)]),
            NOW,
            "b",
        );
        assert_eq!(details.index_of_this_client, 1);
        assert_eq!(details.num_active_clients, 3);
        assert_eq!(details.atr_indices(10), vec![1, 4, 7]);
    }

    #[test]
    fn test_expired_removals_are_capped() {
        let clients: Vec<(String, ClientRecordEntry)> = (0..20)
            .map(|i| (format!("dead-{i:02}"), entry(NOW - 100_000, 10)))
            .collect();
        let doc = ClientRecordDocument {
            clients: clients.into_iter().collect(),
            record_override: None,
        };
        let details = ClientRecordDetails::new(&doc, NOW, "me");
        assert_eq!(details.num_expired_clients, 20);
        assert_eq!(details.expired_to_remove().len(), MAX_EXPIRED_CLIENTS_REMOVED);
    }

    #[test]
    fn test_override() {
        let mut doc = record(&[]);
        doc.record_override = Some(ClientRecordOverride {
            enabled: true,
            expires: NOW + 1,
        });
        assert!(ClientRecordDetails::new(&doc, NOW, "me").override_active);
        assert!(!ClientRecordDetails::new(&doc, NOW + 1, "me").override_active);
        doc.record_override = Some(ClientRecordOverride {
            enabled: false,
            expires: NOW + 1,
        });
        assert!(!ClientRecordDetails::new(&doc, NOW, "me").override_active);
    }

    proptest! {
        #[test]
        fn test_self_is_always_active(
            others in proptest::collection::btree_map("[a-z]{1,6}", (0u64..200_000, 0u64..100_000), 0..12),
            me in "[a-z]{1,6}",
        ) {
            let doc = ClientRecordDocument {
                clients: others
                    .into_iter()
                    .map(|(id, (age, exp))| (id, entry(NOW - age, exp)))
                    .collect(),
                record_override: None,
            };
            let details = ClientRecordDetails::new(&doc, NOW, &me);
            prop_assert_eq!(&details.active_client_ids[details.index_of_this_client], &me);
            prop_assert!(!details.expired_client_ids.contains(&me));
            prop_assert_eq!(
                details.num_active_clients + details.num_expired_clients,
                details.num_existing_clients + usize::from(details.client_is_new)
            );
        }
    }

    fn setup() -> (Arc<SimulatedTimeSource>, Arc<SimulatedKv>, ClientRecord) {
        let time = Arc::new(SimulatedTimeSource::default_start());
        let kv = Arc::new(SimulatedKv::new(3, time.clone()));
        let record = ClientRecord::new(
            kv.clone(),
            Keyspace::default_collection("b"),
            DurabilityLevel::None,
        );
        (time, kv, record)
    }

    #[tokio::test]
    async fn test_heartbeat_round_trip() {
        let (time, _kv, record) = setup();
        assert!(record.read().await.unwrap().is_none());
        record.create_placeholder().await.unwrap();
        record.create_placeholder().await.unwrap();

        let (doc, hlc) = record.read().await.unwrap().unwrap();
        let details = ClientRecordDetails::new(&doc, hlc, "me");
        assert!(details.client_is_new);
        record.update(&details, 80_000, 1024).await.unwrap();

        let (doc, hlc) = record.read().await.unwrap().unwrap();
        let mine = &doc.clients["me"];
        assert_eq!(mine.expires_ms, 80_000);
        assert_eq!(mine.num_atrs, 1024);
        assert_eq!(mine.heartbeat_ms(), Some(time.now_ms()));
        assert!(!mine.is_expired(hlc));
    }

    #[tokio::test]
    async fn test_update_removes_expired_clients() {
        let (time, _kv, record) = setup();
        record.create_placeholder().await.unwrap();
        let (doc, hlc) = record.read().await.unwrap().unwrap();
        record
            .update(&ClientRecordDetails::new(&doc, hlc, "old"), 10, 1024)
            .await
            .unwrap();

        time.advance(5_000);
        let (doc, hlc) = record.read().await.unwrap().unwrap();
        let details = ClientRecordDetails::new(&doc, hlc, "new");
        assert_eq!(details.expired_client_ids, vec!["old".to_string()]);
        record.update(&details, 80_000, 1024).await.unwrap();

        let (doc, _) = record.read().await.unwrap().unwrap();
        assert!(!doc.clients.contains_key("old"));
        assert!(doc.clients.contains_key("new"));
    }

    #[tokio::test]
    async fn test_remove_client_retries() {
        let (_time, kv, record) = setup();
        record.create_placeholder().await.unwrap();
        let (doc, hlc) = record.read().await.unwrap().unwrap();
        record
            .update(&ClientRecordDetails::new(&doc, hlc, "me"), 80_000, 1024)
            .await
            .unwrap();
        kv.inject(
            ScriptedFault::new(KvOp::MutateIn, CLIENT_RECORD_ID, KvError::TemporaryFailure)
                .times(2),
        );
        record.remove_client_with_retries("me").await.unwrap();
        let (doc, _) = record.read().await.unwrap().unwrap();
        assert!(doc.clients.is_empty());

        // Already gone.
        record.remove_client_with_retries("me").await.unwrap();
    }
}
