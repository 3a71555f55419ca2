//! In-memory key-value store for deterministic testing.
//!
//! Implements [`KvStore`] with the sub-document and extended-attribute
//! behaviour transactions depend on:
//! - CAS values drawn from a hybrid logical clock over the time source
//! - `$document` and `$vbucket.HLC` virtual extended attributes
//! - `${Mutation.CAS}` / `${Mutation.value_crc32c}` macro expansion
//! - tombstones that keep their extended attributes
//! - fault injection, both seeded-random and scripted one-shot

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value, json};

use crate::kv::{
    DurabilityLevel, GetResult, KvError, KvStore, Keyspace, LookupInOptions, LookupInResult,
    LookupInSpec, MutateInOptions, MutateInSpec, MutationMacro, MutationResult, SpecValue,
    StoreSemantics, cas_to_macro_string, crc32_to_string, path,
};
use crate::time::TimeSource;

use futures::future::BoxFuture;

/// Maximum total size of a document's extended attributes.
pub const DEFAULT_MAX_XATTR_SIZE: usize = 1024 * 1024;

/// Probabilistic fault injection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultConfig {
    /// Probability that an operation fails with `TemporaryFailure` before it
    /// is applied.
    pub transient_rate: f64,
    /// Probability that a mutation is applied and then reported as an
    /// `AmbiguousTimeout`.
    pub ambiguous_rate: f64,
}

impl FaultConfig {
    #[must_use]
    pub const fn no_faults() -> Self {
        Self {
            transient_rate: 0.0,
            ambiguous_rate: 0.0,
        }
    }

    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            transient_rate: 0.01,
            ambiguous_rate: 0.005,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvOp {
    Get,
    Insert,
    Upsert,
    Replace,
    Remove,
    LookupIn,
    MutateIn,
}

impl KvOp {
    const fn is_mutation(self) -> bool {
        !matches!(self, Self::Get | Self::LookupIn)
    }
}

/// A fault fired on matching calls, in the order injected.
#[derive(Debug, Clone)]
pub struct ScriptedFault {
    op: KvOp,
    id: String,
    error: KvError,
    skip: usize,
    times: usize,
    apply_first: bool,
}

impl ScriptedFault {
    /// Fail the next `op` on document `id` with `error`.
    #[must_use]
    pub fn new(op: KvOp, id: impl Into<String>, error: KvError) -> Self {
        Self {
            op,
            id: id.into(),
            error,
            skip: 0,
            times: 1,
            apply_first: false,
        }
    }

    /// Let `n` matching calls through before firing.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Fire on `n` consecutive matching calls.
    #[must_use]
    pub const fn times(mut self, n: usize) -> Self {
        self.times = n;
        self
    }

    /// Apply the mutation before reporting the error.
    #[must_use]
    pub const fn after_apply(mut self) -> Self {
        self.apply_first = true;
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct SimulatedKvStats {
    pub reads: u64,
    pub mutations: u64,
    pub injected_faults: u64,
}

#[derive(Debug, Clone)]
struct Record {
    body: Value,
    xattrs: Value,
    cas: u64,
    revid: u64,
    exptime: u64,
    deleted: bool,
}

impl Record {
    fn empty() -> Self {
        Self {
            body: Value::Object(Map::new()),
            xattrs: Value::Object(Map::new()),
            cas: 0,
            revid: 0,
            exptime: 0,
            deleted: false,
        }
    }
}

type DocKey = (Keyspace, String);

struct Inner {
    docs: HashMap<DocKey, Record>,
    last_cas: u64,
    fault_config: FaultConfig,
    scripted: Vec<ScriptedFault>,
    rng: StdRng,
    stats: SimulatedKvStats,
    max_xattr_size: usize,
}

enum Injected {
    Before(KvError),
    After(KvError),
}

/// In-memory [`KvStore`].
///
/// Operations complete without suspending, so concurrency is interleaving of
/// whole operations. A single lock guards every document.
pub struct SimulatedKv {
    inner: Mutex<Inner>,
    time: Arc<dyn TimeSource>,
}

impl SimulatedKv {
    #[must_use]
    pub fn new(seed: u64, time: Arc<dyn TimeSource>) -> Self {
        Self::with_config(seed, time, FaultConfig::default())
    }

    #[must_use]
    pub fn with_config(seed: u64, time: Arc<dyn TimeSource>, fault_config: FaultConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                docs: HashMap::new(),
                last_cas: 0,
                fault_config,
                scripted: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
                stats: SimulatedKvStats::default(),
                max_xattr_size: DEFAULT_MAX_XATTR_SIZE,
            }),
            time,
        }
    }

    pub fn set_fault_config(&self, config: FaultConfig) {
        self.inner.lock().fault_config = config;
    }

    pub fn set_max_xattr_size(&self, size: usize) {
        self.inner.lock().max_xattr_size = size;
    }

    pub fn inject(&self, fault: ScriptedFault) {
        self.inner.lock().scripted.push(fault);
    }

    /// Drop scripted faults that have not fired yet.
    pub fn clear_scripted_faults(&self) {
        self.inner.lock().scripted.clear();
    }

    #[must_use]
    pub fn stats(&self) -> SimulatedKvStats {
        self.inner.lock().stats.clone()
    }

    /// Whether a live (non-tombstone) document exists.
    #[must_use]
    pub fn contains(&self, keyspace: &Keyspace, id: &str) -> bool {
        self.inner
            .lock()
            .docs
            .get(&(keyspace.clone(), id.to_string()))
            .is_some_and(|r| !r.deleted)
    }

    #[must_use]
    pub fn is_tombstone(&self, keyspace: &Keyspace, id: &str) -> bool {
        self.inner
            .lock()
            .docs
            .get(&(keyspace.clone(), id.to_string()))
            .is_some_and(|r| r.deleted)
    }

    /// The extended attribute at `xattr_path`, tombstones included.
    #[must_use]
    pub fn xattr(&self, keyspace: &Keyspace, id: &str, xattr_path: &str) -> Option<Value> {
        let inner = self.inner.lock();
        let record = inner.docs.get(&(keyspace.clone(), id.to_string()))?;
        path::get(&record.xattrs, xattr_path).cloned()
    }

    /// Ids of the live documents in `keyspace`, sorted.
    #[must_use]
    pub fn document_ids(&self, keyspace: &Keyspace) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner
            .docs
            .iter()
            .filter(|((ks, _), r)| ks == keyspace && !r.deleted)
            .map(|((_, id), _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn run<T>(
        &self,
        op: KvOp,
        keyspace: &Keyspace,
        id: &str,
        apply: impl FnOnce(&mut Inner, u64, DocKey) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let mut inner = self.inner.lock();
        if op.is_mutation() {
            inner.stats.mutations += 1;
        } else {
            inner.stats.reads += 1;
        }

        let injected = inner.take_fault(op, id);
        if let Some(Injected::Before(err)) = injected {
            tracing::debug!(?op, id, %err, "injected fault");
            return Err(err);
        }

        let now_ms = self.time.now_ms();
        let result = apply(&mut *inner, now_ms, (keyspace.clone(), id.to_string()));

        match injected {
            Some(Injected::After(err)) if result.is_ok() => {
                tracing::debug!(?op, id, %err, "injected fault after apply");
                Err(err)
            }
            _ => result,
        }
    }
}

impl Inner {
    fn take_fault(&mut self, op: KvOp, id: &str) -> Option<Injected> {
        if let Some(pos) = self.scripted.iter().position(|f| f.op == op && f.id == id) {
            let fault = &mut self.scripted[pos];
            if fault.skip > 0 {
                fault.skip -= 1;
            } else {
                let injected = if fault.apply_first {
                    Injected::After(fault.error.clone())
                } else {
                    Injected::Before(fault.error.clone())
                };
                fault.times = fault.times.saturating_sub(1);
                let exhausted = fault.times == 0;
                if exhausted {
                    self.scripted.remove(pos);
                }
                self.stats.injected_faults += 1;
                return Some(injected);
            }
        }

        if self.should_inject(self.fault_config.transient_rate) {
            self.stats.injected_faults += 1;
            return Some(Injected::Before(KvError::TemporaryFailure));
        }
        if op.is_mutation() && self.should_inject(self.fault_config.ambiguous_rate) {
            self.stats.injected_faults += 1;
            return Some(Injected::After(KvError::AmbiguousTimeout));
        }
        None
    }

    fn should_inject(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Next CAS: nanoseconds, strictly increasing.
    fn next_cas(&mut self, now_ms: u64) -> u64 {
        let physical = now_ms.saturating_mul(1_000_000);
        self.last_cas = physical.max(self.last_cas + 1);
        self.last_cas
    }

    fn hlc_now_ms(&self, now_ms: u64) -> u64 {
        now_ms.max(self.last_cas / 1_000_000)
    }

    fn live(&self, key: &DocKey) -> Result<&Record, KvError> {
        match self.docs.get(key) {
            Some(r) if !r.deleted => Ok(r),
            _ => Err(KvError::DocumentNotFound),
        }
    }

    fn check_cas(record: &Record, cas: u64) -> Result<(), KvError> {
        if cas != 0 && record.cas != cas {
            return Err(KvError::CasMismatch);
        }
        Ok(())
    }

    fn store(&mut self, key: DocKey, mut record: Record, now_ms: u64) -> u64 {
        let cas = self.next_cas(now_ms);
        record.cas = cas;
        record.revid += 1;
        self.docs.insert(key, record);
        cas
    }
}

fn body_crc(body: &Value) -> u32 {
    crc32fast::hash(&serde_json::to_vec(body).unwrap_or_default())
}

fn virtual_document(record: &Record) -> Value {
    json!({
        "CAS": cas_to_macro_string(record.cas),
        "revid": record.revid.to_string(),
        "exptime": record.exptime,
        "value_crc32c": crc32_to_string(body_crc(&record.body)),
        "deleted": record.deleted,
    })
}

/// Seconds with a millisecond fraction, so expiry is exact in tests.
fn hlc_seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

fn lookup_field(record: &Record, spec: &LookupInSpec, hlc_now_ms: u64) -> Option<Value> {
    match spec {
        LookupInSpec::GetFull => (!record.deleted).then(|| record.body.clone()),
        LookupInSpec::Get { path: p, xattr: false } => path::get(&record.body, p).cloned(),
        LookupInSpec::Get { path: p, xattr: true } => {
            if let Some(rest) = p.strip_prefix("$document") {
                let doc = virtual_document(record);
                return match rest.strip_prefix('.') {
                    Some(sub) => path::get(&doc, sub).cloned(),
                    None => Some(doc),
                };
            }
            if let Some(rest) = p.strip_prefix("$vbucket") {
                let vb = json!({
                    "HLC": { "now": hlc_seconds(hlc_now_ms), "mode": "real" }
                });
                return match rest.strip_prefix('.') {
                    Some(sub) => path::get(&vb, sub).cloned(),
                    None => Some(vb),
                };
            }
            path::get(&record.xattrs, p).cloned()
        }
    }
}

fn spec_value(value: &SpecValue) -> Value {
    match value {
        SpecValue::Json(v) => v.clone(),
        SpecValue::Macro(_) => Value::Null,
    }
}

/// Apply `specs` to `record` in place. Macros are returned for expansion once
/// the new CAS is known.
fn apply_specs(
    record: &mut Record,
    specs: &[MutateInSpec],
) -> Result<Vec<(String, MutationMacro)>, KvError> {
    let mut macros = Vec::new();
    for spec in specs {
        match spec {
            MutateInSpec::Insert { path: p, value, xattr } => {
                let target = if *xattr { &mut record.xattrs } else { &mut record.body };
                match path::insert(target, p, spec_value(value)) {
                    path::InsertOutcome::Inserted => {}
                    path::InsertOutcome::AlreadyExists => {
                        return Err(KvError::PathExists(p.clone()));
                    }
                    path::InsertOutcome::BadParent => return Err(KvError::PathNotFound(p.clone())),
                }
                if let (SpecValue::Macro(m), true) = (value, *xattr) {
                    macros.push((p.clone(), *m));
                }
            }
            MutateInSpec::Upsert { path: p, value, xattr } => {
                let target = if *xattr { &mut record.xattrs } else { &mut record.body };
                if !path::upsert(target, p, spec_value(value)) {
                    return Err(KvError::PathNotFound(p.clone()));
                }
                if let (SpecValue::Macro(m), true) = (value, *xattr) {
                    macros.push((p.clone(), *m));
                }
            }
            MutateInSpec::Remove { path: p, xattr } => {
                let target = if *xattr { &mut record.xattrs } else { &mut record.body };
                if path::remove(target, p).is_none() {
                    return Err(KvError::PathNotFound(p.clone()));
                }
            }
            MutateInSpec::ReplaceBodyWithXattr { path: p } => {
                let staged = path::get(&record.xattrs, p)
                    .cloned()
                    .ok_or_else(|| KvError::PathNotFound(p.clone()))?;
                record.body = staged;
            }
            MutateInSpec::SetDoc(body) => record.body = body.clone(),
        }
    }
    Ok(macros)
}

impl KvStore for SimulatedKv {
    fn get<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
    ) -> BoxFuture<'a, Result<GetResult, KvError>> {
        Box::pin(async move {
            self.run(KvOp::Get, keyspace, id, |inner, _, key| {
                let record = inner.live(&key)?;
                Ok(GetResult {
                    content: record.body.clone(),
                    cas: record.cas,
                })
            })
        })
    }

    fn insert<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        content: Value,
        _durability: DurabilityLevel,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>> {
        Box::pin(async move {
            self.run(KvOp::Insert, keyspace, id, |inner, now_ms, key| {
                let revid = match inner.docs.get(&key) {
                    Some(r) if !r.deleted => return Err(KvError::DocumentExists),
                    Some(r) => r.revid,
                    None => 0,
                };
                let record = Record {
                    body: content,
                    revid,
                    ..Record::empty()
                };
                Ok(MutationResult {
                    cas: inner.store(key, record, now_ms),
                })
            })
        })
    }

    fn upsert<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        content: Value,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>> {
        Box::pin(async move {
            self.run(KvOp::Upsert, keyspace, id, |inner, now_ms, key| {
                let revid = inner.docs.get(&key).map_or(0, |r| r.revid);
                let record = Record {
                    body: content,
                    revid,
                    ..Record::empty()
                };
                Ok(MutationResult {
                    cas: inner.store(key, record, now_ms),
                })
            })
        })
    }

    fn replace<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        content: Value,
        cas: u64,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>> {
        Box::pin(async move {
            self.run(KvOp::Replace, keyspace, id, |inner, now_ms, key| {
                let existing = inner.live(&key)?;
                Inner::check_cas(existing, cas)?;
                let record = Record {
                    body: content,
                    revid: existing.revid,
                    ..Record::empty()
                };
                Ok(MutationResult {
                    cas: inner.store(key, record, now_ms),
                })
            })
        })
    }

    fn remove<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        cas: u64,
        _durability: DurabilityLevel,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>> {
        Box::pin(async move {
            self.run(KvOp::Remove, keyspace, id, |inner, now_ms, key| {
                let existing = inner.live(&key)?;
                Inner::check_cas(existing, cas)?;
                let record = Record {
                    body: Value::Null,
                    revid: existing.revid,
                    deleted: true,
                    ..Record::empty()
                };
                Ok(MutationResult {
                    cas: inner.store(key, record, now_ms),
                })
            })
        })
    }

    fn lookup_in<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        specs: Vec<LookupInSpec>,
        options: LookupInOptions,
    ) -> BoxFuture<'a, Result<LookupInResult, KvError>> {
        Box::pin(async move {
            self.run(KvOp::LookupIn, keyspace, id, |inner, now_ms, key| {
                let hlc_now_ms = inner.hlc_now_ms(now_ms);
                let record = match inner.docs.get(&key) {
                    Some(r) if !r.deleted || options.access_deleted => r,
                    _ => return Err(KvError::DocumentNotFound),
                };
                Ok(LookupInResult {
                    cas: record.cas,
                    is_deleted: record.deleted,
                    fields: specs
                        .iter()
                        .map(|spec| lookup_field(record, spec, hlc_now_ms))
                        .collect(),
                })
            })
        })
    }

    fn mutate_in<'a>(
        &'a self,
        keyspace: &'a Keyspace,
        id: &'a str,
        specs: Vec<MutateInSpec>,
        options: MutateInOptions,
    ) -> BoxFuture<'a, Result<MutationResult, KvError>> {
        Box::pin(async move {
            self.run(KvOp::MutateIn, keyspace, id, |inner, now_ms, key| {
                let existing = inner.docs.get(&key);
                let visible = existing.filter(|r| !r.deleted || options.access_deleted);
                let fresh = |revid| Record {
                    revid,
                    deleted: options.create_as_deleted,
                    ..Record::empty()
                };
                let mut record = match (options.semantics, visible) {
                    (StoreSemantics::Insert, Some(_)) => return Err(KvError::DocumentExists),
                    (StoreSemantics::Replace, None) => return Err(KvError::DocumentNotFound),
                    (StoreSemantics::Insert | StoreSemantics::Upsert, None) => {
                        fresh(existing.map_or(0, |r| r.revid))
                    }
                    (StoreSemantics::Upsert | StoreSemantics::Replace, Some(r)) => {
                        Inner::check_cas(r, options.cas)?;
                        r.clone()
                    }
                };

                let macros = apply_specs(&mut record, &specs)?;
                if options.revive_document {
                    record.deleted = false;
                }

                let xattr_size = serde_json::to_vec(&record.xattrs).map_or(0, |v| v.len());
                if xattr_size > inner.max_xattr_size {
                    return Err(KvError::ValueTooLarge);
                }

                let cas = inner.next_cas(now_ms);
                let crc = crc32_to_string(body_crc(&record.body));
                for (p, m) in macros {
                    let expanded = match m {
                        MutationMacro::Cas => Value::String(cas_to_macro_string(cas)),
                        MutationMacro::ValueCrc32c => Value::String(crc.clone()),
                    };
                    path::upsert(&mut record.xattrs, &p, expanded);
                }
                record.cas = cas;
                record.revid += 1;
                inner.docs.insert(key, record);
                Ok(MutationResult { cas })
            })
        })
    }
}
