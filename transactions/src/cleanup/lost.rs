//! Background cleanup of attempts whose owners disappeared.
//!
//! One task runs per keyspace that has held an ATR. Each tick it heartbeats
//! into the client record, works out its share of the ATRs from the other
//! live clients, and finishes every expired entry in that share.
//!
//! # Usage
//!
//! `Transactions` registers the keyspace of every ATR it writes. The first
//! registration of a keyspace spawns its task; later ones are no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Cleaner, CleanupError, CleanupRequest, ClientRecord, ClientRecordDetails, SAFETY_MARGIN,
    TransactionCleanupAttempt,
};
use crate::atr::{AtrRef, AtrRepository, atr_id};
use crate::config::TransactionsConfig;
use crate::kv::{KvError, Keyspace, SharedKv};

/// What one pass over a keyspace did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Set when the client record's override suspended cleanup.
    pub skipped_override: bool,
    pub details: Option<ClientRecordDetails>,
    pub atrs_checked: usize,
    pub entries_found: usize,
    pub entries_expired: usize,
    pub cleaned: Vec<TransactionCleanupAttempt>,
}

/// Lost-transaction cleanup for one keyspace, on behalf of one client.
#[derive(Clone)]
pub struct PerCollectionCleaner {
    keyspace: Keyspace,
    client_uuid: String,
    record: ClientRecord,
    atrs: AtrRepository,
    cleaner: Cleaner,
    cleanup_window: Duration,
    num_atrs: usize,
}

impl PerCollectionCleaner {
    #[must_use]
    pub fn new(
        kv: SharedKv,
        keyspace: Keyspace,
        client_uuid: impl Into<String>,
        config: &TransactionsConfig,
    ) -> Self {
        Self {
            record: ClientRecord::new(kv.clone(), keyspace.clone(), config.durability),
            atrs: AtrRepository::new(kv.clone(), config.durability),
            cleaner: Cleaner::new(kv, config.durability),
            keyspace,
            client_uuid: client_uuid.into(),
            cleanup_window: config.cleanup_window,
            num_atrs: config.num_atrs,
        }
    }

    #[must_use]
    pub const fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    #[must_use]
    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    /// One pass: heartbeat, then clean expired entries in this client's ATRs.
    ///
    /// A failure reading one ATR is logged and the pass moves on.
    pub async fn run_once(&self) -> Result<TickReport, CleanupError> {
        let details = self.refresh_client_record().await?;
        if details.override_active {
            info!(
                keyspace = %self.keyspace,
                expires_ms = details.override_expires_ms,
                "lost-transaction cleanup suspended by client record override"
            );
            return Ok(TickReport {
                skipped_override: true,
                details: Some(details),
                ..TickReport::default()
            });
        }

        let mut report = TickReport::default();
        for index in details.atr_indices(self.num_atrs) {
            let atr = AtrRef {
                keyspace: self.keyspace.clone(),
                id: atr_id(index).to_string(),
            };
            report.atrs_checked += 1;
            let doc = match self.atrs.lookup_all(&atr).await {
                Ok(Some(doc)) => doc,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%atr, error = %err, "could not read ATR");
                    continue;
                }
            };
            for entry in &doc.entries {
                report.entries_found += 1;
                if !entry.has_expired(doc.hlc_now_ms) {
                    continue;
                }
                report.entries_expired += 1;
                let request =
                    CleanupRequest::from_entry(atr.clone(), entry, self.cleaner.default_durability());
                report.cleaned.push(self.cleaner.cleanup(&request, false).await);
            }
        }
        debug!(
            keyspace = %self.keyspace,
            atrs_checked = report.atrs_checked,
            entries_found = report.entries_found,
            entries_expired = report.entries_expired,
            "lost-transaction pass finished"
        );
        report.details = Some(details);
        Ok(report)
    }

    async fn refresh_client_record(&self) -> Result<ClientRecordDetails, CleanupError> {
        let (record, hlc_now_ms) = if let Some(found) = self.record.read().await? {
            found
        } else {
            self.record.create_placeholder().await?;
            self.record.read().await?.ok_or_else(|| {
                CleanupError::MalformedClientRecord("missing after creation".to_string())
            })?
        };
        let details = ClientRecordDetails::new(&record, hlc_now_ms, &self.client_uuid);
        if details.override_active {
            return Ok(details);
        }

        let expires_ms =
            u64::try_from((self.cleanup_window + SAFETY_MARGIN).as_millis()).unwrap_or(u64::MAX);
        self.record.update(&details, expires_ms, self.num_atrs).await?;
        if details.client_is_new {
            info!(
                keyspace = %self.keyspace,
                client_uuid = %self.client_uuid,
                active_clients = details.num_active_clients,
                index = details.index_of_this_client,
                "joined client record"
            );
        }
        Ok(details)
    }

    /// Leave the client record so the other clients pick up this share.
    pub async fn remove_client(&self) -> Result<(), KvError> {
        self.record.remove_client_with_retries(&self.client_uuid).await
    }
}

/// Spawn the lost-transaction cleanup task for one keyspace.
///
/// The task runs a pass, then sleeps for `window`, until `shutdown` turns
/// `true` or its sender is dropped. On the way out it removes its client from
/// the client record.
///
/// # Invariants
/// - A failed pass is logged and retried on the next tick
/// - The client entry is removed at most once, after the last pass
pub fn spawn_lost_cleanup_task(
    cleaner: PerCollectionCleaner,
    window: Duration,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        lost_cleanup_loop(cleaner, window, shutdown).await;
    })
}

async fn lost_cleanup_loop(
    cleaner: PerCollectionCleaner,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        match cleaner.run_once().await {
            Ok(report) => {
                let failed = report.cleaned.iter().filter(|a| !a.success).count();
                if failed > 0 {
                    warn!(keyspace = %cleaner.keyspace(), failed, "some lost attempts could not be cleaned");
                }
            }
            Err(err) => warn!(keyspace = %cleaner.keyspace(), error = %err, "lost-transaction pass failed"),
        }
        tokio::select! {
            () = tokio::time::sleep(window) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    if let Err(err) = cleaner.remove_client().await {
        warn!(keyspace = %cleaner.keyspace(), error = %err, "could not remove client from client record");
    }
    debug!(keyspace = %cleaner.keyspace(), "lost-transaction cleanup stopped");
}

/// Owns one cleanup task per keyspace for this client.
pub struct LostTransactionManager {
    kv: SharedKv,
    config: TransactionsConfig,
    client_uuid: String,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<HashMap<Keyspace, tokio::task::JoinHandle<()>>>,
}

impl LostTransactionManager {
    #[must_use]
    pub fn new(kv: SharedKv, config: TransactionsConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            kv,
            config,
            client_uuid: Uuid::new_v4().to_string(),
            shutdown,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    #[must_use]
    pub fn cleaner_for(&self, keyspace: Keyspace) -> PerCollectionCleaner {
        PerCollectionCleaner::new(self.kv.clone(), keyspace, &self.client_uuid, &self.config)
    }

    /// Start cleaning `keyspace` if nothing does yet. Returns whether a task
    /// was spawned.
    ///
    /// Outside a Tokio runtime, after shutdown, or with lost cleanup
    /// disabled this does nothing.
    pub fn register_keyspace(&self, keyspace: &Keyspace) -> bool {
        if !self.config.cleanup_lost_attempts || *self.shutdown.borrow() {
            return false;
        }
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(keyspace) {
            return false;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(%keyspace, "no async runtime, lost-transaction cleanup not started");
            return false;
        }
        let handle = spawn_lost_cleanup_task(
            self.cleaner_for(keyspace.clone()),
            self.config.cleanup_window,
            self.shutdown.subscribe(),
        );
        tasks.insert(keyspace.clone(), handle);
        info!(%keyspace, client_uuid = %self.client_uuid, "started lost-transaction cleanup");
        true
    }

    #[must_use]
    pub fn keyspaces(&self) -> Vec<Keyspace> {
        let mut keyspaces: Vec<_> = self.tasks.lock().keys().cloned().collect();
        keyspaces.sort();
        keyspaces
    }

    /// Stop every task and wait for each to leave the client record.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "lost-transaction cleanup task panicked");
            }
        }
    }
}
