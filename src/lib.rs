//! latchtree: a concurrent B+tree engine.
//!
//! Readers and writers descend with hand-over-hand latching, structural changes are
//! journaled before their node writes, and [`Btree::recover`] replays the journal after a
//! crash.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::btree::{
    Btree, BtreeConfig, BtreeStatsSnapshot, KeyRange, MemNodeStore, NodeStore, PutType,
};
pub use types::{BtreeError, CpId, Gen, NodeId, Result};
