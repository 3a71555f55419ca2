//! Common helpers for end-to-end tests.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::atr::AtrRef;
use crate::attempt::{AttemptContext, AttemptParts};
use crate::cleanup::PerCollectionCleaner;
use crate::config::TransactionsConfig;
use crate::kv::{DurabilityLevel, KvError, KvStore, Keyspace};
use crate::query::QueryExecutor;
use crate::simulation::SimulatedKv;
use crate::time::{SimulatedTimeSource, TimeSource};
use crate::transactions::Transactions;

/// ATRs per keyspace in tests; keeps lost-cleanup passes short.
pub const NUM_ATRS: usize = 16;

/// An in-memory cluster with a hand-driven clock.
pub struct TestCluster {
    pub time: Arc<SimulatedTimeSource>,
    pub kv: Arc<SimulatedKv>,
    pub keyspace: Keyspace,
}

impl TestCluster {
    #[must_use]
    pub fn new() -> Self {
        let time = Arc::new(SimulatedTimeSource::default_start());
        let kv = Arc::new(SimulatedKv::new(11, time.clone()));
        Self {
            time,
            kv,
            keyspace: Keyspace::default_collection("travel"),
        }
    }

    #[must_use]
    pub fn config() -> TransactionsConfig {
        TransactionsConfig {
            durability: DurabilityLevel::None,
            num_atrs: NUM_ATRS,
            ..TransactionsConfig::default()
        }
    }

    /// A client with background cleanup switched off.
    #[must_use]
    pub fn transactions(&self) -> Transactions {
        self.transactions_with(TransactionsConfig {
            cleanup_client_attempts: false,
            cleanup_lost_attempts: false,
            ..Self::config()
        })
    }

    #[must_use]
    pub fn transactions_with(&self, config: TransactionsConfig) -> Transactions {
        Transactions::new(self.kv.clone(), config).with_time_source(self.time.clone())
    }

    #[must_use]
    pub fn transactions_with_query(&self, query: Arc<dyn QueryExecutor>) -> Transactions {
        self.transactions().with_query(query)
    }

    /// An attempt driven directly, standing in for another client.
    #[must_use]
    pub fn attempt(&self, transaction_id: &str) -> AttemptContext {
        AttemptContext::new(AttemptParts {
            transaction_id: transaction_id.to_string(),
            transaction_start_ms: self.time.now_ms(),
            config: Self::config(),
            kv: self.kv.clone(),
            query: None,
            time: self.time.clone(),
        })
    }

    /// A lost-transaction cleaner acting for `client_uuid`.
    #[must_use]
    pub fn lost_cleaner(&self, client_uuid: &str) -> PerCollectionCleaner {
        PerCollectionCleaner::new(
            self.kv.clone(),
            self.keyspace.clone(),
            client_uuid,
            &Self::config(),
        )
    }

    /// Write a document outside any transaction.
    pub async fn seed(&self, id: &str, content: Value) {
        #[allow(clippy::expect_used)]
        self.kv
            .insert(&self.keyspace, id, content, DurabilityLevel::None)
            .await
            .expect("seed document");
    }

    /// The committed body of a document, as a non-transactional reader sees it.
    pub async fn content(&self, id: &str) -> Option<Value> {
        match self.kv.get(&self.keyspace, id).await {
            Ok(result) => Some(result.content),
            Err(KvError::DocumentNotFound) => None,
            #[allow(clippy::panic)]
            Err(err) => panic!("unexpected error reading {id}: {err}"),
        }
    }

    /// `attempts.<attempt_id>.st` in `atr`.
    #[must_use]
    pub fn atr_state(&self, atr: &AtrRef, attempt_id: &str) -> Option<Value> {
        self.kv
            .xattr(&atr.keyspace, &atr.id, &format!("attempts.{attempt_id}.st"))
    }
}

/// Captures the last attempt a transaction ran.
#[derive(Default)]
pub struct LastAttempt(Mutex<Option<AttemptContext>>);

impl LastAttempt {
    pub fn record(&self, ctx: &AttemptContext) {
        *self.0.lock() = Some(ctx.clone());
    }

    #[must_use]
    pub fn get(&self) -> AttemptContext {
        #[allow(clippy::expect_used)]
        self.0.lock().clone().expect("an attempt ran")
    }
}
