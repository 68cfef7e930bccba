#![forbid(unsafe_code)]

//! Concurrent B+tree with lock-coupled descent and journaled structural changes.

/// Checkpoint tokens threaded through every mutation.
pub mod cp;

/// Tree configuration and fault-injection switches.
pub mod config;

/// Key and value traits, put policies and key ranges.
pub mod key;

/// In-memory node representation and per-node operations.
pub mod node;
mod stats;

/// Node storage contract and the in-memory store with a durable image.
pub mod store;
mod tree;

pub use config::{BtreeConfig, ConfigError, Flips};
pub use cp::BtreeCp;
pub use key::{BtreeKey, BtreeValue, ExtentKey, KeyRange, PutType, SplitKeyFn};
pub use node::{BtreeNode, LeafPut, NodeBody};
pub use stats::{BtreeStats, BtreeStatsSnapshot};
pub use store::{FreeMode, MemNodeStore, NodePtr, NodeStore};
pub use tree::{Btree, MergeOutcome, NodeCount, QueryCursor, ReplayOutcome};
