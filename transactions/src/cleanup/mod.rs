//! Cleanup of attempts their owner did not finish.
//!
//! Two paths lead here:
//!
//! - An attempt of this client that ended part way through commit or
//!   rollback is queued as a [`CleanupRequest`] and handled straight away by
//!   the [`CleanupQueue`] task.
//! - An attempt of a client that died is found by the
//!   [`LostTransactionManager`], which scans its share of every known ATR
//!   once per cleanup window. Shares are agreed through the client record,
//!   a heartbeat document every cleaning client updates.
//!
//! Either way the [`Cleaner`] finishes the attempt the way its ATR entry
//! says it should end and then removes the entry.

mod cleaner;
mod client_record;
mod lost;
mod queue;

use thiserror::Error;

use crate::error::TransactionOperationFailed;
use crate::kv::KvError;

pub use cleaner::{Cleaner, CleanupRequest, TransactionCleanupAttempt};
pub use client_record::{
    CLIENT_RECORD_ID, ClientRecord, ClientRecordDetails, ClientRecordDocument, ClientRecordEntry,
    ClientRecordOverride, MAX_EXPIRED_CLIENTS_REMOVED, SAFETY_MARGIN,
};
pub use lost::{LostTransactionManager, PerCollectionCleaner, TickReport};
pub use queue::{CleanupQueue, CleanupSummary, RECENT_OUTCOMES};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Kv(#[from] KvError),
    /// The entry uses protocol features this client does not implement.
    #[error("cleanup blocked by forward compatibility")]
    ForwardCompatibility(#[source] TransactionOperationFailed),
    /// The owner reached the commit point while the entry was being removed.
    #[error("attempt {0} committed during cleanup")]
    CommittedConcurrently(String),
    #[error("client record is malformed: {0}")]
    MalformedClientRecord(String),
}
