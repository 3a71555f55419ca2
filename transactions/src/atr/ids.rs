//! Mapping document ids to ATR ids.
//!
//! A document is assigned the ATR of its vbucket, so the ATR usually lives on
//! the same node as the first document an attempt mutates. Each ATR id is the
//! first `_txn:atr-<vbucket>-#<hex>` candidate that itself hashes to that
//! vbucket.

use std::fmt::Write;
use std::sync::LazyLock;

pub const NUM_VBUCKETS: u16 = 1024;

/// Default number of ATRs, one per vbucket.
pub const DEFAULT_NUM_ATRS: usize = NUM_VBUCKETS as usize;

#[allow(clippy::cast_possible_truncation)] // masked to 15 bits
#[must_use]
pub fn vbucket_for_key(key: &str) -> u16 {
    let crc = crc32fast::hash(key.as_bytes());
    (((crc >> 16) & 0x7fff) as u16) % NUM_VBUCKETS
}

static ATR_IDS: LazyLock<Vec<String>> =
    LazyLock::new(|| (0..NUM_VBUCKETS).map(find_atr_id).collect());

fn find_atr_id(vbucket: u16) -> String {
    let mut candidate = String::new();
    for n in 0u32.. {
        candidate.clear();
        let _ = write!(candidate, "_txn:atr-{vbucket}-#{n:x}");
        if vbucket_for_key(&candidate) == vbucket {
            break;
        }
    }
    candidate
}

/// ATR id `index` of the first `num_atrs`.
#[must_use]
pub fn atr_id(index: usize) -> &'static str {
    &ATR_IDS[index % ATR_IDS.len()]
}

/// The ATR a document id maps to when `num_atrs` ATRs are in use.
#[must_use]
pub fn atr_id_for_key(key: &str, num_atrs: usize) -> &'static str {
    let num_atrs = num_atrs.clamp(1, DEFAULT_NUM_ATRS);
    atr_id(usize::from(vbucket_for_key(key)) % num_atrs)
}

/// All ATR ids in use when `num_atrs` ATRs are configured.
pub fn all_atr_ids(num_atrs: usize) -> impl Iterator<Item = &'static str> {
    (0..num_atrs.clamp(1, DEFAULT_NUM_ATRS)).map(atr_id)
}
