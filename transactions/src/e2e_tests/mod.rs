//! End-to-end tests through the public `Transactions` API.
//!
//! Each file covers one scenario against the in-memory cluster, with time
//! driven by hand so expiry and cleanup are deterministic.

#![cfg(test)]

mod helpers;

mod test_client_record;
mod test_commit;
mod test_failed_post_commit;
mod test_lost_cleanup;
mod test_query_mode;
mod test_rollback;
mod test_transition_guards;
mod test_write_write_conflict;
