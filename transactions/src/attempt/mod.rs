//! One attempt at running a transaction.
//!
//! An [`AttemptContext`] is handed to the application's transaction logic.
//! Document operations stage their writes through it; when the logic
//! returns, the owning [`Transactions`](crate::Transactions) commits or rolls
//! the attempt back.
//!
//! # Expiry
//!
//! Every attempt of a transaction shares the transaction's time budget. Once
//! it is spent, operations fail with `FailExpiry` and the attempt switches
//! into *expiry overtime*: rollback gets one more pass at clearing staged
//! writes, and any failure during that pass surfaces as expired.
//!
//! # Concurrency
//!
//! The context is cheap to clone and operations on different documents may
//! run concurrently. Staged mutations, saved errors and [`StateBits`] are
//! shared; writing the ATR's PENDING entry is serialised so only the first
//! mutation creates it.

mod commit;
mod get;
pub(crate) mod query_mode;
mod rollback;
mod stage;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::atr::{AtrRef, AtrRepository, AttemptState};
use crate::cleanup::CleanupRequest;
use crate::config::TransactionsConfig;
use crate::doc::DocumentRepository;
use crate::error::{ErrorBuilder, ErrorClass, FinalError, OpError, TransactionOperationFailed};
use crate::kv::{KvError, SharedKv};
use crate::query::QueryExecutor;
use crate::staged_mutation::{StagedMutation, StagedMutationCollection};
use crate::state_bits::{BehaviorFlag, StateBits};
use crate::time::TimeSource;

/// Pause between repeats of a single protocol step.
pub const OP_RETRY_DELAY: Duration = Duration::from_millis(3);

/// How long a write waits on another attempt's staged write before giving up.
pub const WRITE_WRITE_CONFLICT_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on repeats of a single protocol step.
pub const MAX_OP_RETRIES: u32 = 100_000;

/// Queries are refused when less than this much of the budget remains.
pub const QUERY_EXPIRY_THRESHOLD_MS: u64 = 10;

/// What an attempt needs from the `Transactions` that starts it.
pub(crate) struct AttemptParts {
    pub transaction_id: String,
    pub transaction_start_ms: u64,
    pub config: TransactionsConfig,
    pub kv: SharedKv,
    pub query: Option<Arc<dyn QueryExecutor>>,
    pub time: Arc<dyn TimeSource>,
}

struct Inner {
    transaction_id: String,
    attempt_id: String,
    transaction_start_ms: u64,
    config: TransactionsConfig,
    query: Option<Arc<dyn QueryExecutor>>,
    time: Arc<dyn TimeSource>,
    atrs: AtrRepository,
    docs: DocumentRepository,
    atr: Mutex<Option<AtrRef>>,
    state: Mutex<AttemptState>,
    staged: StagedMutationCollection,
    bits: StateBits,
    errors: Mutex<Vec<TransactionOperationFailed>>,
    overtime: AtomicBool,
    done: AtomicBool,
    unstaging_complete: AtomicBool,
    query_mode: AtomicBool,
    /// Held while the PENDING entry is written.
    atr_init: tokio::sync::Mutex<()>,
    /// Held while `BEGIN WORK` is sent.
    query_begin: tokio::sync::Mutex<()>,
}

/// Handle to a running attempt.
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<Inner>,
}

impl AttemptContext {
    pub(crate) fn new(parts: AttemptParts) -> Self {
        let atrs = AtrRepository::new(parts.kv.clone(), parts.config.durability);
        let docs = DocumentRepository::new(parts.kv, parts.config.durability);
        Self {
            inner: Arc::new(Inner {
                transaction_id: parts.transaction_id,
                attempt_id: uuid::Uuid::new_v4().to_string(),
                transaction_start_ms: parts.transaction_start_ms,
                config: parts.config,
                query: parts.query,
                time: parts.time,
                atrs,
                docs,
                atr: Mutex::new(None),
                state: Mutex::new(AttemptState::NothingWritten),
                staged: StagedMutationCollection::new(),
                bits: StateBits::new(),
                errors: Mutex::new(Vec::new()),
                overtime: AtomicBool::new(false),
                done: AtomicBool::new(false),
                unstaging_complete: AtomicBool::new(false),
                query_mode: AtomicBool::new(false),
                atr_init: tokio::sync::Mutex::new(()),
                query_begin: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn transaction_id(&self) -> &str {
        &self.inner.transaction_id
    }

    #[must_use]
    pub fn attempt_id(&self) -> &str {
        &self.inner.attempt_id
    }

    #[must_use]
    pub fn state(&self) -> AttemptState {
        *self.inner.state.lock()
    }

    /// The ATR holding this attempt's entry, once one has been chosen.
    #[must_use]
    pub fn atr(&self) -> Option<AtrRef> {
        self.inner.atr.lock().clone()
    }

    /// Whether commit or rollback has started.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn unstaging_complete(&self) -> bool {
        self.inner.unstaging_complete.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn final_error(&self) -> FinalError {
        self.inner.bits.final_error()
    }

    pub(crate) fn staged_mutations(&self) -> Vec<StagedMutation> {
        self.inner.staged.all()
    }

    /// What cleanup needs to finish this attempt; `None` until it has an
    /// ATR entry.
    pub(crate) fn cleanup_request(&self) -> Option<CleanupRequest> {
        let atr = self.atr()?;
        let lists = self.inner.staged.to_lists();
        Some(CleanupRequest {
            attempt_id: self.inner.attempt_id.clone(),
            atr,
            state: self.state(),
            inserted: lists.inserted,
            replaced: lists.replaced,
            removed: lists.removed,
            durability: self.inner.config.durability,
            forward_compat: None,
        })
    }

    fn is_query_mode(&self) -> bool {
        self.inner.query_mode.load(Ordering::Acquire)
    }

    // Expiry

    fn elapsed_ms(&self) -> u64 {
        self.inner
            .time
            .now_ms()
            .saturating_sub(self.inner.transaction_start_ms)
    }

    #[allow(clippy::cast_possible_truncation)] // budgets are far below u64::MAX ms
    fn expiration_ms(&self) -> u64 {
        self.inner.config.expiration_time.as_millis() as u64
    }

    /// Whether the transaction's budget is spent, by this client's clock.
    #[must_use]
    pub fn has_expired_client_side(&self) -> bool {
        self.elapsed_ms() > self.expiration_ms()
    }

    fn remaining_ms(&self) -> u64 {
        self.expiration_ms().saturating_sub(self.elapsed_ms())
    }

    fn in_overtime(&self) -> bool {
        self.inner.overtime.load(Ordering::Acquire)
    }

    fn enter_overtime(&self) {
        if !self.inner.overtime.swap(true, Ordering::AcqRel) {
            warn!(attempt_id = %self.inner.attempt_id, "entering expiry overtime");
        }
    }

    /// Fail an operation that starts after the budget is spent.
    fn check_expiry(&self, operation: &str, id: &str) -> Result<(), TransactionOperationFailed> {
        if !self.has_expired_client_side() {
            return Ok(());
        }
        self.enter_overtime();
        warn!(attempt_id = %self.inner.attempt_id, operation, id, "attempt expired");
        Err(self.save(
            ErrorBuilder::new(ErrorClass::FailExpiry)
                .raise(FinalError::Expired)
                .cause(OpError::AttemptExpired),
        ))
    }

    /// Protocol steps stop repeating once the budget is spent, unless the
    /// attempt is already in overtime.
    fn expired_outside_overtime(&self) -> Result<(), OpError> {
        if !self.in_overtime() && self.has_expired_client_side() {
            return Err(OpError::AttemptExpired);
        }
        Ok(())
    }

    // Key-value calls

    /// Bound `fut` by the key-value timeout. A call that times out may still
    /// have been applied.
    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, KvError>>,
    ) -> Result<T, KvError> {
        tokio::time::timeout(self.inner.config.key_value_timeout, fut)
            .await
            .unwrap_or(Err(KvError::AmbiguousTimeout))
    }

    /// One repeatable protocol step: refused after expiry, then timed.
    async fn step<T>(&self, fut: impl Future<Output = Result<T, KvError>>) -> Result<T, OpError> {
        self.expired_outside_overtime()?;
        Ok(self.timed(fut).await?)
    }

    async fn retry_delay(&self, retries: &mut u32) -> Result<(), TransactionOperationFailed> {
        *retries += 1;
        if *retries > MAX_OP_RETRIES {
            return Err(self.raise(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .cause(OpError::IllegalState("operation retry limit reached".to_string())),
            ));
        }
        tokio::time::sleep(OP_RETRY_DELAY).await;
        Ok(())
    }

    // Errors

    /// Build `builder` into this attempt's state bits.
    pub(crate) fn raise(&self, builder: ErrorBuilder) -> TransactionOperationFailed {
        builder.build_into(&self.inner.bits)
    }

    /// Like [`raise`](Self::raise), also remembering the failure so a later
    /// commit refuses to proceed.
    fn save(&self, builder: ErrorBuilder) -> TransactionOperationFailed {
        let err = self.raise(builder);
        self.inner.errors.lock().push(err.clone());
        err
    }

    fn has_saved_errors(&self) -> bool {
        !self.inner.errors.lock().is_empty()
    }

    /// Refuse work once commit or rollback has begun.
    fn done_check(&self) -> Result<(), TransactionOperationFailed> {
        let state = self.state();
        if self.is_done() || !matches!(state, AttemptState::NothingWritten | AttemptState::Pending)
        {
            return Err(self.raise(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .do_not_rollback()
                    .cause(OpError::IllegalState(format!(
                        "attempt is {state}, no further operations are allowed"
                    ))),
            ));
        }
        Ok(())
    }

    fn check_errors(&self) -> Result<(), TransactionOperationFailed> {
        if self.has_saved_errors() {
            return Err(self.raise(
                ErrorBuilder::new(ErrorClass::FailOther).cause(OpError::PreviousOperationFailed),
            ));
        }
        Ok(())
    }

    // State

    fn transition(&self, next: AttemptState) -> Result<(), TransactionOperationFailed> {
        let current = {
            let mut state = self.inner.state.lock();
            let current = *state;
            if current == next || current.can_transition_to(next) {
                *state = next;
                return Ok(());
            }
            current
        };
        error!(
            attempt_id = %self.inner.attempt_id,
            from = %current,
            to = %next,
            "illegal attempt state transition"
        );
        Err(self.raise(
            ErrorBuilder::new(ErrorClass::FailOther)
                .do_not_rollback()
                .cause(OpError::IllegalState(format!("{current} -> {next}"))),
        ))
    }

    /// The query engine owns the ATR entry in query mode; mirror its outcome.
    fn force_state(&self, next: AttemptState) {
        *self.inner.state.lock() = next;
    }

    fn set_behavior_flags(&self, flags: &[BehaviorFlag]) {
        self.inner.bits.merge(flags, FinalError::Success);
    }
}
