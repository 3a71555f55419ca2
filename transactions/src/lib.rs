// Life of a transaction:
// 1. `Transactions::run` creates an attempt and hands it to the logic
// 2. The first write adds a PENDING entry to an ATR (active transaction record)
// 3. Each write is staged in the document's `txn` extended attribute
// 4. Commit:
//     - Flip the ATR entry to COMMITTED (the commit point)
//     - Make every staged write visible
//     - Flip the ATR entry to COMPLETED
//    Rollback:
//     - Flip the ATR entry to ABORTED
//     - Clear every staged write
//     - Flip the ATR entry to ROLLED_BACK
// 5. Anything left half way is finished by cleanup, either straight away for
//    this client's own attempts or, for clients that died, once the entry
//    has expired
//
// System components:
//  - Key-value layer (and an in-memory simulation of it)
//  - ATR and staged-document repositories
//  - Attempt state machine
//  - Cleanup: per-client queue, lost-transaction scanner, client record

pub mod atr;
pub mod attempt;
pub mod cleanup;
pub mod config;
pub mod doc;
pub mod error;
pub mod forward_compat;
pub mod get_result;
pub mod kv;
pub mod query;
pub mod simulation;
pub mod staged_mutation;
pub mod state_bits;
pub mod time;
mod transactions;

#[cfg(test)]
mod e2e_tests;

pub use attempt::AttemptContext;
pub use config::{PerTransactionConfig, TransactionsConfig};
pub use error::{AttemptError, ErrorClass, FinalError, TransactionError, TransactionOperationFailed};
pub use get_result::TransactionGetResult;
pub use transactions::{TransactionResult, Transactions};
