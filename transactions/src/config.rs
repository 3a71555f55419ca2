//! Transactions configuration.
//!
//! Configuration is loaded from environment variables, falling back to
//! defaults for anything unset.
//!
//! # Environment Variables
//!
//! - `TXN_EXPIRATION_MS`: Budget for a whole transaction (default: `15000`)
//! - `TXN_DURABILITY`: `none`, `majority`, `majority_and_persist_to_active`
//!   or `persist_to_majority` (default: `majority`)
//! - `TXN_KV_TIMEOUT_MS`: Timeout for each key-value call (default: `2500`)
//! - `TXN_CLEANUP_WINDOW_MS`: How often each ATR is checked for lost
//!   attempts (default: `60000`)
//! - `TXN_CLEANUP_LOST_ATTEMPTS`: Run lost-transaction cleanup (default: `true`)
//! - `TXN_CLEANUP_CLIENT_ATTEMPTS`: Clean up this client's own unfinished
//!   attempts (default: `true`)
//! - `TXN_METADATA_COLLECTION`: `bucket.scope.collection` to hold every ATR
//!   (default: unset, the ATR goes next to the first mutated document)

use std::time::Duration;

use thiserror::Error;

use crate::atr::DEFAULT_NUM_ATRS;
use crate::kv::{DurabilityLevel, Keyspace};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Settings shared by every transaction run through one `Transactions`.
///
/// # Pre-conditions
///
/// - `num_atrs` is between 1 and [`DEFAULT_NUM_ATRS`]; values outside are
///   clamped when an ATR is chosen
/// - `unstaging_concurrency` is at least 1
///
/// # Invariants
///
/// - `expiration_time` is the budget for the whole transaction, shared by all
///   of its attempts; each ATR entry records what was left of it
/// - Only `expiration_time` and `durability` can differ between two runs on
///   the same `Transactions` (see [`Self::merged`])
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionsConfig {
    pub expiration_time: Duration,
    pub durability: DurabilityLevel,
    /// Bound on each key-value call an attempt makes. A call that runs over
    /// counts as ambiguous.
    pub key_value_timeout: Duration,
    /// How often each keyspace is scanned for lost attempts. Client record
    /// entries expire after this plus [`crate::cleanup::SAFETY_MARGIN`].
    pub cleanup_window: Duration,
    pub cleanup_lost_attempts: bool,
    pub cleanup_client_attempts: bool,
    /// Where ATRs are placed. `None` puts each ATR in the default collection
    /// of the first document an attempt mutates.
    pub metadata_collection: Option<Keyspace>,
    /// Maximum staged documents committed or rolled back at once.
    pub unstaging_concurrency: usize,
    pub num_atrs: usize,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            expiration_time: Self::DEFAULT_EXPIRATION,
            durability: DurabilityLevel::Majority,
            key_value_timeout: Self::DEFAULT_KV_TIMEOUT,
            cleanup_window: Self::DEFAULT_CLEANUP_WINDOW,
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            metadata_collection: None,
            unstaging_concurrency: Self::DEFAULT_UNSTAGING_CONCURRENCY,
            num_atrs: DEFAULT_NUM_ATRS,
        }
    }
}

impl TransactionsConfig {
    pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(15);
    pub const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2500);
    pub const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(60);
    pub const DEFAULT_UNSTAGING_CONCURRENCY: usize = 100;

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for a variable that is set but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            expiration_time: load_millis(&lookup, "TXN_EXPIRATION_MS")?
                .unwrap_or(defaults.expiration_time),
            durability: load_durability(&lookup)?.unwrap_or(defaults.durability),
            key_value_timeout: load_millis(&lookup, "TXN_KV_TIMEOUT_MS")?
                .unwrap_or(defaults.key_value_timeout),
            cleanup_window: load_millis(&lookup, "TXN_CLEANUP_WINDOW_MS")?
                .unwrap_or(defaults.cleanup_window),
            cleanup_lost_attempts: load_bool(&lookup, "TXN_CLEANUP_LOST_ATTEMPTS")?
                .unwrap_or(defaults.cleanup_lost_attempts),
            cleanup_client_attempts: load_bool(&lookup, "TXN_CLEANUP_CLIENT_ATTEMPTS")?
                .unwrap_or(defaults.cleanup_client_attempts),
            metadata_collection: load_keyspace(&lookup)?,
            ..defaults
        })
    }

    /// This configuration with `overrides` applied.
    ///
    /// # Post-conditions
    ///
    /// - Every field other than `expiration_time` and `durability` equals
    ///   `self`'s
    #[must_use]
    pub fn merged(&self, overrides: &PerTransactionConfig) -> Self {
        Self {
            expiration_time: overrides.expiration_time.unwrap_or(self.expiration_time),
            durability: overrides.durability.unwrap_or(self.durability),
            ..self.clone()
        }
    }
}

/// Overrides for a single `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerTransactionConfig {
    pub expiration_time: Option<Duration>,
    pub durability: Option<DurabilityLevel>,
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message,
    }
}

fn load_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| invalid(name, format!("'{value}' is not a number of milliseconds")))
        })
        .transpose()
}

fn load_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<bool>, ConfigError> {
    lookup(name)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(name, format!("'{value}' is not a boolean"))),
        })
        .transpose()
}

fn load_durability(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<DurabilityLevel>, ConfigError> {
    const NAME: &str = "TXN_DURABILITY";
    lookup(NAME)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(DurabilityLevel::None),
            "majority" => Ok(DurabilityLevel::Majority),
            "majority_and_persist_to_active" => Ok(DurabilityLevel::MajorityAndPersistToActive),
            "persist_to_majority" => Ok(DurabilityLevel::PersistToMajority),
            _ => Err(invalid(NAME, format!("'{value}' is not a durability level"))),
        })
        .transpose()
}

fn load_keyspace(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<Keyspace>, ConfigError> {
    const NAME: &str = "TXN_METADATA_COLLECTION";
    lookup(NAME)
        .map(|value| {
            Keyspace::parse(value.trim())
                .ok_or_else(|| invalid(NAME, format!("'{value}' is not bucket.scope.collection")))
        })
        .transpose()
}
