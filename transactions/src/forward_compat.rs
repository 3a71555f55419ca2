//! Forward compatibility gates.
//!
//! A newer client may record in an ATR entry or a staged document which
//! protocol features another client must understand before it touches that
//! state. Each gate names a checkpoint; the recorded block lists, per
//! checkpoint, the requirements and what to do when one is unmet.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorBuilder, ErrorClass, OpError};

/// Protocol version implemented here.
pub const PROTOCOL_VERSION: (u32, u32) = (2, 0);

/// Extensions implemented here.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // transaction id recorded in ATR entries
    "TI",
    // ATR entries record mutated documents by keyspace
    "MO",
    // durability level recorded in ATR entries
    "SD",
    // query mode
    "QU",
    // custom metadata collection
    "CM",
    // insert over an existing document reports DocumentExists
    "IX",
    "BF3705",
    "BF3787",
    "BF3838",
];

const DEFAULT_RETRY_AFTER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardCompatStage {
    /// Reading the ATR of a conflicting attempt.
    WriteWriteConflictReadingAtr,
    WriteWriteConflictReplacing,
    WriteWriteConflictRemoving,
    WriteWriteConflictInserting,
    /// Reading a conflicting document while inserting.
    WriteWriteConflictInsertingGet,
    Gets,
    GetsReadingAtr,
    CleanupEntry,
}

impl ForwardCompatStage {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::WriteWriteConflictReadingAtr => "WW_R",
            Self::WriteWriteConflictReplacing => "WW_RP",
            Self::WriteWriteConflictRemoving => "WW_RM",
            Self::WriteWriteConflictInserting => "WW_I",
            Self::WriteWriteConflictInsertingGet => "WW_IG",
            Self::Gets => "G",
            Self::GetsReadingAtr => "G_A",
            Self::CleanupEntry => "CL_E",
        }
    }
}

impl fmt::Display for ForwardCompatStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    #[serde(rename = "r")]
    Retry,
    #[serde(rename = "f")]
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(rename = "b")]
    pub behavior: Behavior,
    #[serde(rename = "ra", default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Requirement {
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        let protocol_ok = self
            .protocol
            .as_deref()
            .is_none_or(|p| parse_version(p).is_some_and(|v| v <= PROTOCOL_VERSION));
        let extension_ok = self
            .extension
            .as_deref()
            .is_none_or(|e| SUPPORTED_EXTENSIONS.contains(&e));
        protocol_ok && extension_ok
    }
}

fn parse_version(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// The `fc` block: checkpoint code to requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardCompatibility(pub HashMap<String, Vec<Requirement>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    RetryAfter(Duration),
    Fail,
}

impl ForwardCompatibility {
    /// The first unmet requirement at `stage` decides.
    #[must_use]
    pub fn evaluate(&self, stage: ForwardCompatStage) -> Verdict {
        let Some(requirements) = self.0.get(stage.code()) else {
            return Verdict::Proceed;
        };
        requirements
            .iter()
            .find(|r| !r.is_satisfied())
            .map_or(Verdict::Proceed, |r| match r.behavior {
                Behavior::Retry => Verdict::RetryAfter(
                    r.retry_after_ms
                        .map_or(DEFAULT_RETRY_AFTER, Duration::from_millis),
                ),
                Behavior::Fail => Verdict::Fail,
            })
    }
}

/// Gate `stage` on `fc`, waiting first when the block asks to retry.
pub async fn check(
    stage: ForwardCompatStage,
    fc: Option<&ForwardCompatibility>,
) -> Result<(), ErrorBuilder> {
    let Some(fc) = fc else {
        return Ok(());
    };
    match fc.evaluate(stage) {
        Verdict::Proceed => Ok(()),
        Verdict::RetryAfter(delay) => {
            tracing::debug!(%stage, ?delay, "forward compatibility requires retry");
            tokio::time::sleep(delay).await;
            Err(ErrorBuilder::new(ErrorClass::FailOther)
                .retry_transaction()
                .cause(OpError::ForwardCompatibility(stage.to_string())))
        }
        Verdict::Fail => {
            tracing::warn!(%stage, "forward compatibility failure");
            Err(ErrorBuilder::new(ErrorClass::FailOther)
                .cause(OpError::ForwardCompatibility(stage.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(value: serde_json::Value) -> ForwardCompatibility {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_known_protocol_and_extension_proceed() {
        let fc = block(json!({
            "WW_R": [{"p": "2.0", "b": "f"}, {"e": "TI", "b": "f"}]
        }));
        assert_eq!(
            fc.evaluate(ForwardCompatStage::WriteWriteConflictReadingAtr),
            Verdict::Proceed
        );
        assert_eq!(fc.evaluate(ForwardCompatStage::Gets), Verdict::Proceed);
    }

    #[test]
    fn test_unknown_requirements() {
        let fc = block(json!({
            "G": [{"p": "2.1", "b": "f"}],
            "CL_E": [{"e": "XX", "b": "r", "ra": 50}],
            "WW_I": [{"e": "XX", "b": "r"}]
        }));
        assert_eq!(fc.evaluate(ForwardCompatStage::Gets), Verdict::Fail);
        assert_eq!(
            fc.evaluate(ForwardCompatStage::CleanupEntry),
            Verdict::RetryAfter(Duration::from_millis(50))
        );
        assert_eq!(
            fc.evaluate(ForwardCompatStage::WriteWriteConflictInserting),
            Verdict::RetryAfter(DEFAULT_RETRY_AFTER)
        );
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("2.0"), Some((2, 0)));
        assert_eq!(parse_version("3"), Some((3, 0)));
        assert_eq!(parse_version("x.1"), None);
    }

    #[tokio::test]
    async fn test_check_builds_failures() {
        assert!(check(ForwardCompatStage::Gets, None).await.is_ok());

        let fc = block(json!({"G": [{"e": "XX", "b": "f"}], "G_A": [{"e": "XX", "b": "r", "ra": 1}]}));
        let err = check(ForwardCompatStage::Gets, Some(&fc)).await.unwrap_err().build();
        assert_eq!(err.class(), ErrorClass::FailOther);
        assert!(!err.retry());

        let err = check(ForwardCompatStage::GetsReadingAtr, Some(&fc))
            .await
            .unwrap_err()
            .build();
        assert!(err.retry());
    }
}
