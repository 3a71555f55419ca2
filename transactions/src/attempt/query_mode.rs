//! Operations of an attempt that has handed itself to the query engine.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{AttemptContext, QUERY_EXPIRY_THRESHOLD_MS};
use crate::atr::AttemptState;
use crate::error::{
    AttemptError, ErrorBuilder, ErrorClass, FinalError, OpError, TransactionOperationFailed,
};
use crate::get_result::TransactionGetResult;
use crate::kv::{KvError, Keyspace};
use crate::query::{
    BEGIN_WORK, COMMIT, EXECUTE_DELETE, EXECUTE_GET, EXECUTE_INSERT, EXECUTE_UPDATE,
    QueryError, QueryExecutor, QueryGetResult, QueryOptions, QueryTxData, ROLLBACK,
    keyspace_param,
};

impl AttemptContext {
    /// Run a statement inside this transaction.
    ///
    /// The first query switches the attempt into query mode; every later
    /// operation of the attempt is then carried out by the query engine.
    pub async fn query(
        &self,
        statement: &str,
        options: QueryOptions,
    ) -> Result<Vec<Value>, AttemptError> {
        let executor = self.query_precheck(statement).await?;
        self.send(&executor, statement, options)
            .await
            .map_err(|err| self.save(convert_query_error(err)).into())
    }

    /// Checks before any statement, sending `BEGIN WORK` first if needed.
    async fn query_precheck(
        &self,
        statement: &str,
    ) -> Result<Arc<dyn QueryExecutor>, TransactionOperationFailed> {
        let Some(executor) = self.inner.query.clone() else {
            return Err(self.save(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .do_not_rollback()
                    .cause(OpError::Query(QueryError::Other(
                        "no query engine is configured".to_string(),
                    ))),
            ));
        };
        self.done_check()?;
        self.check_errors()?;
        if self.remaining_ms() < QUERY_EXPIRY_THRESHOLD_MS {
            self.enter_overtime();
            warn!(attempt_id = %self.inner.attempt_id, statement, "attempt expired before query");
            return Err(self.save(
                ErrorBuilder::new(ErrorClass::FailExpiry)
                    .do_not_rollback()
                    .raise(FinalError::Expired)
                    .cause(OpError::AttemptExpired),
            ));
        }
        self.begin_work(&executor).await?;
        Ok(executor)
    }

    async fn begin_work(
        &self,
        executor: &Arc<dyn QueryExecutor>,
    ) -> Result<(), TransactionOperationFailed> {
        let _guard = self.inner.query_begin.lock().await;
        if self.is_query_mode() {
            return Ok(());
        }

        let atr = self.atr();
        let staged = self.staged_mutations();
        let config = &self.inner.config;
        #[allow(clippy::cast_possible_truncation)] // timeouts are far below u64::MAX ms
        let kv_timeout_ms = config.key_value_timeout.as_millis() as u64;
        let txdata = QueryTxData::new(
            &self.inner.transaction_id,
            &self.inner.attempt_id,
            self.remaining_ms(),
            kv_timeout_ms,
            config.num_atrs,
            config.durability,
            atr.as_ref(),
            &staged,
        );
        let txdata = serde_json::to_value(&txdata).map_err(|e| {
            self.save(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .cause(KvError::Decoding(e.to_string())),
            )
        })?;
        let options = QueryOptions {
            txdata: Some(txdata),
            txtimeout_ms: Some(self.remaining_ms()),
            durability_level: Some(config.durability.query_str().to_string()),
            ..QueryOptions::default()
        };
        executor
            .execute(BEGIN_WORK, options)
            .await
            .map_err(|err| self.save(convert_query_error(err)))?;
        self.inner.query_mode.store(true, Ordering::Release);
        info!(attempt_id = %self.inner.attempt_id, staged = staged.len(), "attempt is in query mode");
        Ok(())
    }

    async fn send(
        &self,
        executor: &Arc<dyn QueryExecutor>,
        statement: &str,
        mut options: QueryOptions,
    ) -> Result<Vec<Value>, QueryError> {
        options.txid = Some(self.inner.attempt_id.clone());
        debug!(attempt_id = %self.inner.attempt_id, statement, "sending statement");
        executor.execute(statement, options).await
    }

    pub(super) async fn get_with_query(
        &self,
        keyspace: &Keyspace,
        id: &str,
    ) -> Result<Option<TransactionGetResult>, TransactionOperationFailed> {
        let executor = self.query_precheck(EXECUTE_GET).await?;
        let options = QueryOptions::with_parameters(vec![keyspace_param(keyspace), json!(id)]);
        match self.send(&executor, EXECUTE_GET, options).await {
            Ok(rows) => rows
                .into_iter()
                .next()
                .map(|row| self.result_from_row(keyspace, id, row))
                .transpose(),
            Err(QueryError::DocumentNotFound) => Ok(None),
            Err(err) => Err(self.save(convert_query_error(err))),
        }
    }

    pub(super) async fn insert_with_query(
        &self,
        keyspace: &Keyspace,
        id: &str,
        content: Value,
    ) -> Result<TransactionGetResult, AttemptError> {
        let executor = self.query_precheck(EXECUTE_INSERT).await?;
        let options = QueryOptions::with_parameters(vec![
            keyspace_param(keyspace),
            json!(id),
            content,
            json!({}),
        ]);
        match self.send(&executor, EXECUTE_INSERT, options).await {
            Ok(rows) => Ok(self.single_row(keyspace, id, rows)?),
            Err(QueryError::DocumentExists) => {
                Err(AttemptError::DocumentExists { id: id.to_string() })
            }
            Err(err) => Err(self.save(convert_query_error(err)).into()),
        }
    }

    pub(super) async fn replace_with_query(
        &self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult, AttemptError> {
        let executor = self.query_precheck(EXECUTE_UPDATE).await?;
        let options = QueryOptions {
            txdata: Some(existing_doc_txdata(doc)),
            ..QueryOptions::with_parameters(vec![
                keyspace_param(&doc.keyspace),
                json!(doc.id),
                content,
                json!({}),
            ])
        };
        match self.send(&executor, EXECUTE_UPDATE, options).await {
            Ok(rows) => Ok(self.single_row(&doc.keyspace, &doc.id, rows)?),
            Err(err) => Err(self.save(convert_existing_doc_error(err)).into()),
        }
    }

    pub(super) async fn remove_with_query(
        &self,
        doc: &TransactionGetResult,
    ) -> Result<(), AttemptError> {
        let executor = self.query_precheck(EXECUTE_DELETE).await?;
        let options = QueryOptions {
            txdata: Some(existing_doc_txdata(doc)),
            ..QueryOptions::with_parameters(vec![
                keyspace_param(&doc.keyspace),
                json!(doc.id),
                json!({}),
            ])
        };
        self.send(&executor, EXECUTE_DELETE, options)
            .await
            .map(|_| ())
            .map_err(|err| self.save(convert_existing_doc_error(err)).into())
    }

    pub(super) async fn commit_with_query(&self) -> Result<(), TransactionOperationFailed> {
        self.inner.done.store(true, Ordering::Release);
        let Some(executor) = self.inner.query.clone() else {
            return Err(self.raise(ErrorBuilder::new(ErrorClass::FailOther).do_not_rollback()));
        };
        match self.send(&executor, COMMIT, QueryOptions::default()).await {
            Ok(_) => {
                self.force_state(AttemptState::Completed);
                self.inner.unstaging_complete.store(true, Ordering::Release);
                info!(attempt_id = %self.inner.attempt_id, "query engine committed attempt");
                Ok(())
            }
            Err(err) => {
                let class = err.class();
                let to_raise = match err {
                    QueryError::Expired | QueryError::CommitAmbiguous => {
                        FinalError::CommitAmbiguous
                    }
                    _ => FinalError::Failed,
                };
                Err(self.raise(
                    ErrorBuilder::new(class)
                        .do_not_rollback()
                        .raise(to_raise)
                        .cause(err),
                ))
            }
        }
    }

    pub(super) async fn rollback_with_query(&self) -> Result<(), TransactionOperationFailed> {
        let Some(executor) = self.inner.query.clone() else {
            return Err(self.raise(ErrorBuilder::new(ErrorClass::FailOther).do_not_rollback()));
        };
        match self.send(&executor, ROLLBACK, QueryOptions::default()).await {
            Ok(_) => {
                self.force_state(AttemptState::RolledBack);
                info!(attempt_id = %self.inner.attempt_id, "query engine rolled back attempt");
                Ok(())
            }
            Err(err) => Err(self.raise(
                ErrorBuilder::new(err.class())
                    .do_not_rollback()
                    .cause(err),
            )),
        }
    }

    fn single_row(
        &self,
        keyspace: &Keyspace,
        id: &str,
        rows: Vec<Value>,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let row = rows.into_iter().next().ok_or_else(|| {
            self.save(
                ErrorBuilder::new(ErrorClass::FailOther).cause(OpError::Query(
                    QueryError::Other("query engine returned no row".to_string()),
                )),
            )
        })?;
        self.result_from_row(keyspace, id, row)
    }

    fn result_from_row(
        &self,
        keyspace: &Keyspace,
        id: &str,
        row: Value,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let parsed: QueryGetResult = serde_json::from_value(row).map_err(|e| {
            self.save(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .cause(KvError::Decoding(e.to_string())),
            )
        })?;
        let cas = parsed.cas();
        Ok(TransactionGetResult {
            txn: parsed.txn_meta,
            ..TransactionGetResult::new(keyspace.clone(), id, parsed.doc, cas)
        })
    }
}

/// What the engine needs to stage over a document read outside it.
fn existing_doc_txdata(doc: &TransactionGetResult) -> Value {
    json!({
        "kv": true,
        "scas": doc.cas.to_string(),
        "txnMeta": doc.txn,
    })
}

fn convert_query_error(err: QueryError) -> ErrorBuilder {
    let class = err.class();
    let builder = match &err {
        QueryError::WriteWriteConflict | QueryError::Transient(_) => {
            ErrorBuilder::new(class).retry_transaction()
        }
        QueryError::Expired => ErrorBuilder::new(class).raise(FinalError::Expired),
        QueryError::CommitAmbiguous => ErrorBuilder::new(class)
            .do_not_rollback()
            .raise(FinalError::CommitAmbiguous),
        _ => ErrorBuilder::new(class),
    };
    builder.cause(err)
}

/// A replace or remove whose target moved under it is retried.
fn convert_existing_doc_error(err: QueryError) -> ErrorBuilder {
    match err {
        QueryError::DocumentNotFound | QueryError::CasMismatch => {
            ErrorBuilder::new(err.class()).retry_transaction().cause(err)
        }
        other => convert_query_error(other),
    }
}
