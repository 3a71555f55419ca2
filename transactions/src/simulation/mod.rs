//! Deterministic simulation of the cluster transactions run against.
//!
//! Time is controlled, randomness is seeded and faults can be injected at
//! the key-value boundary, so a failing scenario replays identically.

mod kv;

pub use kv::{
    DEFAULT_MAX_XATTR_SIZE, FaultConfig, KvOp, ScriptedFault, SimulatedKv, SimulatedKvStats,
};
