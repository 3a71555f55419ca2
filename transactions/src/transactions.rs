//! Entry point for applications: run transaction logic until it commits,
//! fails for good, or runs out of time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atr::AttemptState;
use crate::attempt::{AttemptContext, AttemptParts};
use crate::cleanup::{Cleaner, CleanupQueue, CleanupSummary, LostTransactionManager};
use crate::config::{PerTransactionConfig, TransactionsConfig};
use crate::error::{
    AttemptError, ErrorBuilder, ErrorClass, FinalError, OpError, TransactionError,
    TransactionOperationFailed,
};
use crate::kv::SharedKv;
use crate::query::QueryExecutor;
use crate::time::{SystemTimeSource, TimeSource};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: u32 = 10;

/// Outcome of a transaction that reached its commit point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction_id: String,
    /// `false` when the transaction committed but some staged writes were
    /// left for cleanup to make visible.
    pub unstaging_complete: bool,
}

/// Runs transactions against one cluster and owns their background cleanup.
pub struct Transactions {
    kv: SharedKv,
    config: TransactionsConfig,
    query: Option<Arc<dyn QueryExecutor>>,
    time: Arc<dyn TimeSource>,
    queue: Mutex<Option<CleanupQueue>>,
    lost: Arc<LostTransactionManager>,
}

impl Transactions {
    /// Starts the background cleanup tasks when called inside a Tokio
    /// runtime.
    #[must_use]
    pub fn new(kv: SharedKv, config: TransactionsConfig) -> Self {
        let queue = if config.cleanup_client_attempts {
            CleanupQueue::new(Cleaner::new(kv.clone(), config.durability))
        } else {
            CleanupQueue::disabled()
        };
        let lost = LostTransactionManager::new(kv.clone(), config.clone());
        if let Some(metadata) = &config.metadata_collection {
            lost.register_keyspace(metadata);
        }
        Self {
            kv,
            config,
            query: None,
            time: Arc::new(SystemTimeSource),
            queue: Mutex::new(Some(queue)),
            lost,
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: Arc<dyn QueryExecutor>) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &TransactionsConfig {
        &self.config
    }

    #[must_use]
    pub fn lost_cleanup(&self) -> &LostTransactionManager {
        &self.lost
    }

    pub async fn run<F, Fut>(&self, logic: F) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        self.run_with_config(&PerTransactionConfig::default(), logic)
            .await
    }

    /// Run `logic` in a fresh attempt until one commits or the failure says
    /// not to retry.
    ///
    /// `logic` returning `Ok` commits the attempt unless it already committed
    /// or rolled back. Returning any error rolls it back. Every attempt shares
    /// the transaction's time budget.
    pub async fn run_with_config<F, Fut>(
        &self,
        overrides: &PerTransactionConfig,
        logic: F,
    ) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        let config = self.config.merged(overrides);
        let transaction_id = Uuid::new_v4().to_string();
        let transaction_start_ms = self.time.now_ms();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0u32;
        let mut earlier_attempts = Vec::new();
        info!(%transaction_id, "transaction started");

        loop {
            attempts += 1;
            let ctx = AttemptContext::new(AttemptParts {
                transaction_id: transaction_id.clone(),
                transaction_start_ms,
                config: config.clone(),
                kv: self.kv.clone(),
                query: self.query.clone(),
                time: self.time.clone(),
            });
            debug!(%transaction_id, attempt_id = %ctx.attempt_id(), attempts, "attempt started");
            let outcome = Self::run_attempt(&ctx, &logic).await;
            self.after_attempt(&ctx);

            let err = match outcome {
                Ok(()) => {
                    info!(%transaction_id, attempts, state = %ctx.state(), "transaction finished");
                    return Ok(TransactionResult {
                        transaction_id,
                        unstaging_complete: ctx.unstaging_complete(),
                    });
                }
                Err(err) => err,
            };

            if err.to_raise() == FinalError::FailedPostCommit {
                warn!(%transaction_id, error = %err, "transaction committed, finishing left to cleanup");
                return Ok(TransactionResult {
                    transaction_id,
                    unstaging_complete: ctx.unstaging_complete(),
                });
            }
            if err.retry() && !ctx.has_expired_client_side() {
                let jitter = Duration::from_millis(rand::rng().random_range(0..10));
                debug!(%transaction_id, attempts, ?backoff, class = ?err.class(), "retrying transaction");
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * BACKOFF_FACTOR).min(MAX_BACKOFF);
                earlier_attempts.push(err);
                continue;
            }

            let expired = err.retry() && ctx.has_expired_client_side();
            warn!(%transaction_id, attempts, class = ?err.class(), to_raise = ?err.to_raise(), "transaction failed");
            return Err(final_error(transaction_id, err, earlier_attempts, expired));
        }
    }

    async fn run_attempt<F, Fut>(
        ctx: &AttemptContext,
        logic: &F,
    ) -> Result<(), TransactionOperationFailed>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        let result = match logic(ctx.clone()).await {
            Ok(()) if ctx.is_done() => match (ctx.state(), ctx.final_error()) {
                (AttemptState::Completed | AttemptState::RolledBack, _) | (_, FinalError::Success) => {
                    Ok(())
                }
                (_, to_raise) => Err(ctx.raise(
                    ErrorBuilder::new(ErrorClass::FailOther)
                        .do_not_rollback()
                        .raise(to_raise)
                        .cause(OpError::IllegalState(
                            "transaction logic ignored a failed commit or rollback".to_string(),
                        )),
                )),
            },
            Ok(()) => ctx.commit().await,
            Err(AttemptError::OperationFailed(err)) => Err(err),
            Err(other) => Err(ctx.raise(ErrorBuilder::new(ErrorClass::FailOther).cause(other))),
        };
        let Err(err) = result else {
            return Ok(());
        };
        if !err.auto_rollback() {
            return Err(err);
        }
        match ctx.rollback_internal().await {
            Ok(()) => Err(err),
            Err(rollback_err) => {
                warn!(
                    attempt_id = %ctx.attempt_id(),
                    error = %rollback_err,
                    "rollback after failure did not complete"
                );
                if rollback_err.to_raise() > err.to_raise() {
                    Err(rollback_err)
                } else {
                    Err(err.without_rollback())
                }
            }
        }
    }

    /// Hand an unfinished attempt to cleanup and make sure its ATR keyspace
    /// is watched for lost attempts.
    fn after_attempt(&self, ctx: &AttemptContext) {
        if let Some(atr) = ctx.atr() {
            self.lost.register_keyspace(&atr.keyspace);
        }
        if matches!(
            ctx.state(),
            AttemptState::NothingWritten | AttemptState::Completed | AttemptState::RolledBack
        ) {
            return;
        }
        let Some(request) = ctx.cleanup_request() else {
            return;
        };
        debug!(attempt_id = %request.attempt_id, state = %request.state, "queueing attempt for cleanup");
        if let Some(queue) = self.queue.lock().as_ref() {
            queue.enqueue(request);
        }
    }

    /// Finish queued cleanup and stop the background tasks. Returns a
    /// summary of the cleanups this client ran for its own attempts.
    pub async fn shutdown(&self) -> CleanupSummary {
        let queue = self.queue.lock().take();
        let summary = match queue {
            Some(mut queue) => queue.shutdown().await,
            None => CleanupSummary::default(),
        };
        self.lost.shutdown().await;
        info!(
            cleaned = summary.succeeded,
            failed = summary.failed,
            "transactions shut down"
        );
        summary
    }
}

fn final_error(
    transaction_id: String,
    cause: TransactionOperationFailed,
    earlier_attempts: Vec<TransactionOperationFailed>,
    expired: bool,
) -> TransactionError {
    match cause.to_raise() {
        FinalError::Expired => TransactionError::Expired {
            transaction_id,
            cause,
            earlier_attempts,
        },
        FinalError::CommitAmbiguous => TransactionError::CommitAmbiguous {
            transaction_id,
            cause,
            earlier_attempts,
        },
        _ if expired => TransactionError::Expired {
            transaction_id,
            cause,
            earlier_attempts,
        },
        _ => TransactionError::Failed {
            transaction_id,
            cause,
            earlier_attempts,
        },
    }
}
