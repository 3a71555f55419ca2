//! The key-value layer transactions are built on.
//!
//! Only the narrow surface the protocol needs is modelled: full-document
//! get/insert/upsert/replace/remove and sub-document lookups and mutations
//! over extended attributes, all guarded by CAS.

mod cas;
mod error;
mod hlc;
pub mod path;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use cas::{cas_from_macro_string, cas_to_macro_string, cas_to_millis, crc32_to_string};
pub use error::KvError;
pub use hlc::ParsedHlc;

/// Name of the default scope and collection.
pub const DEFAULT_NAME: &str = "_default";

/// A fully-qualified collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Keyspace {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// The default collection of `bucket`.
    #[must_use]
    pub fn default_collection(bucket: impl Into<String>) -> Self {
        Self::new(bucket, DEFAULT_NAME, DEFAULT_NAME)
    }

    /// The default collection of this keyspace's bucket.
    #[must_use]
    pub fn bucket_default(&self) -> Self {
        Self::default_collection(self.bucket.clone())
    }

    /// Parse `bucket`, `bucket.scope` or `bucket.scope.collection`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let bucket = parts.next().filter(|b| !b.is_empty())?;
        let scope = parts.next().unwrap_or(DEFAULT_NAME);
        let collection = parts.next().unwrap_or(DEFAULT_NAME);
        if parts.next().is_some() || scope.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(bucket, scope, collection))
    }

    /// The `` `bucket`.`scope`.`collection` `` form the query engine expects.
    #[must_use]
    pub fn to_query_keyspace(&self) -> String {
        format!(
            "default:`{}`.`{}`.`{}`",
            self.bucket, self.scope, self.collection
        )
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Durability requirement for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityLevel {
    None,
    #[default]
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    /// The compact form stored in ATR entries.
    #[must_use]
    pub const fn short_str(self) -> &'static str {
        match self {
            Self::None => "n",
            Self::Majority => "m",
            Self::MajorityAndPersistToActive => "pa",
            Self::PersistToMajority => "pm",
        }
    }

    #[must_use]
    pub fn from_short_str(s: &str) -> Option<Self> {
        match s {
            "n" => Some(Self::None),
            "m" => Some(Self::Majority),
            "pa" => Some(Self::MajorityAndPersistToActive),
            "pm" => Some(Self::PersistToMajority),
            _ => None,
        }
    }

    /// The upper-case form sent to the query engine.
    #[must_use]
    pub const fn query_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Majority => "MAJORITY",
            Self::MajorityAndPersistToActive => "MAJORITY_AND_PERSIST_TO_ACTIVE",
            Self::PersistToMajority => "PERSIST_TO_MAJORITY",
        }
    }
}

/// Server-side macros expanded after the new CAS is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMacro {
    /// `${Mutation.CAS}`
    Cas,
    /// `${Mutation.value_crc32c}`
    ValueCrc32c,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpecValue {
    Json(Value),
    Macro(MutationMacro),
}

impl From<Value> for SpecValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupInSpec {
    Get { path: String, xattr: bool },
    GetFull,
}

impl LookupInSpec {
    /// The server's hybrid logical clock.
    pub const HLC: &str = "$vbucket.HLC";
    /// Virtual metadata of the document itself.
    pub const DOCUMENT: &str = "$document";

    #[must_use]
    pub fn xattr(path: impl Into<String>) -> Self {
        Self::Get {
            path: path.into(),
            xattr: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutateInSpec {
    /// Fails with `PathExists` if the path is already present.
    Insert {
        path: String,
        value: SpecValue,
        xattr: bool,
    },
    Upsert {
        path: String,
        value: SpecValue,
        xattr: bool,
    },
    /// Fails with `PathNotFound` if the path is absent.
    Remove { path: String, xattr: bool },
    /// Replaces the body with the extended attribute at `path`.
    ReplaceBodyWithXattr { path: String },
    SetDoc(Value),
}

impl MutateInSpec {
    #[must_use]
    pub fn insert_xattr(path: impl Into<String>, value: impl Into<SpecValue>) -> Self {
        Self::Insert {
            path: path.into(),
            value: value.into(),
            xattr: true,
        }
    }

    #[must_use]
    pub fn upsert_xattr(path: impl Into<String>, value: impl Into<SpecValue>) -> Self {
        Self::Upsert {
            path: path.into(),
            value: value.into(),
            xattr: true,
        }
    }

    #[must_use]
    pub fn remove_xattr(path: impl Into<String>) -> Self {
        Self::Remove {
            path: path.into(),
            xattr: true,
        }
    }
}

impl From<MutationMacro> for SpecValue {
    fn from(value: MutationMacro) -> Self {
        Self::Macro(value)
    }
}

/// What to do when the document does or does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    #[default]
    Replace,
    Upsert,
    Insert,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LookupInOptions {
    pub access_deleted: bool,
}

impl LookupInOptions {
    #[must_use]
    pub const fn access_deleted() -> Self {
        Self {
            access_deleted: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MutateInOptions {
    pub semantics: StoreSemantics,
    /// Zero means no CAS guard.
    pub cas: u64,
    pub durability: DurabilityLevel,
    pub access_deleted: bool,
    pub create_as_deleted: bool,
    pub revive_document: bool,
}

impl MutateInOptions {
    #[must_use]
    pub fn new(semantics: StoreSemantics) -> Self {
        Self {
            semantics,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    #[must_use]
    pub const fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    #[must_use]
    pub const fn access_deleted(mut self, access_deleted: bool) -> Self {
        self.access_deleted = access_deleted;
        self
    }

    #[must_use]
    pub const fn create_as_deleted(mut self, create_as_deleted: bool) -> Self {
        self.create_as_deleted = create_as_deleted;
        self
    }

    #[must_use]
    pub const fn revive_document(mut self, revive_document: bool) -> Self {
        self.revive_document = revive_document;
        self
    }
}

/// Result of a sub-document lookup; `fields[i]` corresponds to `specs[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupInResult {
    pub cas: u64,
    pub is_deleted: bool,
    pub fields: Vec<Option<Value>>,
}

impl LookupInResult {
    #[must_use]
    pub fn exists(&self, index: usize) -> bool {
        matches!(self.fields.get(index), Some(Some(_)))
    }

    #[must_use]
    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.fields.get(index).and_then(Option::as_ref)
    }

    /// Decode field `index`, `None` if the path was absent.
    pub fn content_as<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, KvError> {
        self.raw(index)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| KvError::Decoding(e.to_string()))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub content: Value,
    pub cas: u64,
}

/// The key-value collaborator.
///
/// Object safe so a single store can be shared as `Arc<dyn KvStore>` between
/// attempts and background cleanup tasks.
pub trait KvStore: Send + Sync {
    fn get<'a>(&'a self, keyspace: &'a Keyspace, id: &'a str)
    -> BoxFuture<'a, Result<GetResult, KvError>>;

    fn insert<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        content: Value,
        durability: DurabilityLevel,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>>;

    fn upsert<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        content: Value,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>>;

    /// Zero `cas` skips the CAS check.
    fn replace<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        content: Value,
        cas: u64,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>>;

    /// Zero `cas` skips the CAS check.
    fn remove<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        cas: u64,
        durability: DurabilityLevel,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>>;

    fn lookup_in<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        specs: Vec<LookupInSpec>,
        options: LookupInOptions,
    ) -> BoxFuture<'a, Result<LookupInResult, KvError>>;

    fn mutate_in<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        specs: Vec<MutateInSpec>,
        options: MutateInOptions,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>>;
}

pub type SharedKv = Arc<dyn KvStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_parse() {
        assert_eq!(
            Keyspace::parse("travel"),
            Some(Keyspace::default_collection("travel"))
        );
        assert_eq!(
            Keyspace::parse("travel.inventory.hotels"),
            Some(Keyspace::new("travel", "inventory", "hotels"))
        );
        assert_eq!(Keyspace::parse(""), None);
        assert_eq!(Keyspace::parse("a.b.c.d"), None);
        assert_eq!(Keyspace::parse("a..c"), None);
    }

    #[test]
    fn test_keyspace_display() {
        let ks = Keyspace::new("b", "s", "c");
        assert_eq!(ks.to_string(), "b.s.c");
        assert_eq!(ks.to_query_keyspace(), "default:`b`.`s`.`c`");
        assert_eq!(ks.bucket_default(), Keyspace::default_collection("b"));
    }

    #[test]
    fn test_durability_short_strings() {
        for level in [
            DurabilityLevel::None,
            DurabilityLevel::Majority,
            DurabilityLevel::MajorityAndPersistToActive,
            DurabilityLevel::PersistToMajority,
        ] {
            assert_eq!(DurabilityLevel::from_short_str(level.short_str()), Some(level));
        }
        assert_eq!(DurabilityLevel::from_short_str("x"), None);
    }

    #[test]
    fn test_lookup_in_result_content_as() {
        let result = LookupInResult {
            cas: 1,
            is_deleted: false,
            fields: vec![Some(serde_json::json!(42)), None],
        };
        assert!(result.exists(0));
        assert!(!result.exists(1));
        assert!(!result.exists(2));
        assert_eq!(result.content_as::<u32>(0), Ok(Some(42)));
        assert_eq!(result.content_as::<u32>(1), Ok(None));
        assert!(result.content_as::<String>(0).is_err());
    }
}
