//! Hand-off of a transaction to the query engine.
//!
//! Once an attempt runs its first query it is in query mode: the engine owns
//! the transaction's state and every later operation, commit and rollback is
//! sent to it as a statement. Only the wire shapes exchanged with the engine
//! are defined here.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::atr::AtrRef;
use crate::doc::TransactionXattrs;
use crate::error::ErrorClass;
use crate::kv::{DurabilityLevel, Keyspace};
use crate::staged_mutation::{StagedMutation, StagedMutationType};

pub const BEGIN_WORK: &str = "BEGIN WORK";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";
pub const EXECUTE_GET: &str = "EXECUTE __get";
pub const EXECUTE_INSERT: &str = "EXECUTE __insert";
pub const EXECUTE_UPDATE: &str = "EXECUTE __update";
pub const EXECUTE_DELETE: &str = "EXECUTE __delete";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("document not found")]
    DocumentNotFound,
    #[error("document already exists")]
    DocumentExists,
    #[error("CAS mismatch")]
    CasMismatch,
    #[error("write-write conflict")]
    WriteWriteConflict,
    #[error("transaction expired in the query engine")]
    Expired,
    #[error("commit outcome unknown")]
    CommitAmbiguous,
    #[error("transient query failure: {0}")]
    Transient(String),
    #[error("query failed: {0}")]
    Other(String),
}

impl QueryError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::DocumentNotFound => ErrorClass::FailDocNotFound,
            Self::DocumentExists => ErrorClass::FailDocAlreadyExists,
            Self::CasMismatch => ErrorClass::FailCasMismatch,
            Self::WriteWriteConflict => ErrorClass::FailWriteWriteConflict,
            Self::Expired => ErrorClass::FailExpiry,
            Self::CommitAmbiguous => ErrorClass::FailAmbiguous,
            Self::Transient(_) => ErrorClass::FailTransient,
            Self::Other(_) => ErrorClass::FailOther,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDataIds {
    pub txn: String,
    pub atmpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDataState {
    pub time_left_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDataConfig {
    pub kv_timeout_ms: u64,
    pub num_atrs: usize,
    pub durability_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDataAtr {
    pub id: String,
    pub bkt: String,
    pub scp: String,
    pub coll: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDataMutation {
    pub bkt: String,
    pub scp: String,
    pub coll: String,
    pub id: String,
    pub cas: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Snapshot of an attempt handed to the engine with `BEGIN WORK`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTxData {
    pub id: TxDataIds,
    pub state: TxDataState,
    pub config: TxDataConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<TxDataAtr>,
    pub mutations: Vec<TxDataMutation>,
}

impl QueryTxData {
    #[must_use]
    pub fn new(
        transaction_id: &str,
        attempt_id: &str,
        time_left_ms: u64,
        kv_timeout_ms: u64,
        num_atrs: usize,
        durability: DurabilityLevel,
        atr: Option<&AtrRef>,
        staged: &[StagedMutation],
    ) -> Self {
        Self {
            id: TxDataIds {
                txn: transaction_id.to_string(),
                atmpt: attempt_id.to_string(),
            },
            state: TxDataState { time_left_ms },
            config: TxDataConfig {
                kv_timeout_ms,
                num_atrs,
                durability_level: durability.query_str().to_string(),
            },
            atr: atr.map(|a| TxDataAtr {
                id: a.id.clone(),
                bkt: a.keyspace.bucket.clone(),
                scp: a.keyspace.scope.clone(),
                coll: a.keyspace.collection.clone(),
            }),
            mutations: staged
                .iter()
                .map(|m| TxDataMutation {
                    bkt: m.keyspace.bucket.clone(),
                    scp: m.keyspace.scope.clone(),
                    coll: m.keyspace.collection.clone(),
                    id: m.id.clone(),
                    cas: m.cas.to_string(),
                    kind: match m.kind {
                        StagedMutationType::Insert => "INSERT",
                        StagedMutationType::Replace => "REPLACE",
                        StagedMutationType::Remove => "REMOVE",
                    }
                    .to_string(),
                })
                .collect(),
        }
    }
}

/// A row returned by `EXECUTE __get`, `__insert` and `__update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryGetResult {
    /// CAS as a decimal string.
    pub scas: String,
    #[serde(default)]
    pub doc: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_meta: Option<TransactionXattrs>,
}

impl QueryGetResult {
    #[must_use]
    pub fn cas(&self) -> u64 {
        self.scas.parse().unwrap_or(0)
    }
}

/// Options sent with every statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOptions {
    pub parameters: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txdata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txtimeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durability_level: Option<String>,
}

impl QueryOptions {
    #[must_use]
    pub fn with_parameters(parameters: Vec<Value>) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }
}

/// The query engine collaborator.
pub trait QueryExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        statement: &'a str,
        options: QueryOptions,
    ) -> BoxFuture<'a, Result<Vec<Value>, QueryError>>;
}

/// The `default:`b`.`s`.`c`` parameter naming a keyspace.
#[must_use]
pub fn keyspace_param(keyspace: &Keyspace) -> Value {
    Value::String(keyspace.to_query_keyspace())
}
