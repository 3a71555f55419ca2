//! Accumulated behaviour flags and worst-case final error for one attempt.
//!
//! Operations on an attempt may run concurrently; each failure merges its
//! directives here. Flags are only ever added and the final error only ever
//! raised, so the merge is a single compare-and-swap loop over one word.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FinalError;

const FLAG_MASK: u64 = 0b1111;
const FINAL_ERROR_SHIFT: u32 = 4;
const FINAL_ERROR_MASK: u64 = 0b111 << FINAL_ERROR_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BehaviorFlag {
    CommitNotAllowed = 1,
    AppRollbackNotAllowed = 2,
    ShouldNotRollback = 4,
    ShouldNotRetry = 8,
}

#[derive(Debug, Default)]
pub struct StateBits {
    bits: AtomicU64,
}

impl StateBits {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    /// Add `flags` and raise the final error to at least `final_error`.
    pub fn merge(&self, flags: &[BehaviorFlag], final_error: FinalError) {
        let add = flags.iter().fold(0u64, |acc, f| acc | *f as u64);
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let current_error = (current & FINAL_ERROR_MASK) >> FINAL_ERROR_SHIFT;
            let next_error = current_error.max(final_error as u64);
            let next = (current & FLAG_MASK) | add | (next_error << FINAL_ERROR_SHIFT);
            if next == current {
                return;
            }
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn set_flag(&self, flag: BehaviorFlag) {
        self.merge(&[flag], FinalError::Success);
    }

    #[must_use]
    pub fn has(&self, flag: BehaviorFlag) -> bool {
        self.bits.load(Ordering::Acquire) & flag as u64 != 0
    }

    #[must_use]
    pub fn final_error(&self) -> FinalError {
        FinalError::from_bits((self.bits.load(Ordering::Acquire) & FINAL_ERROR_MASK) >> FINAL_ERROR_SHIFT)
    }
}
