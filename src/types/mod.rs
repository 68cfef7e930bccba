#![forbid(unsafe_code)]

//! Shared identifiers, generation counters and the crate error type.

use std::fmt;

/// Identifier of a tree node inside a [`NodeStore`](crate::storage::btree::NodeStore).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

/// Per-node generation, bumped on every durable write of the node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Gen(pub u64);

/// Identifier of a checkpoint (consistency point).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct CpId(pub u64);

impl Gen {
    /// Returns true when `self` was produced by at least one write after `seen`.
    ///
    /// Used both by the live lock upgrade (has someone written the node since we looked?)
    /// and by journal replay (has the logged write already reached disk?).
    pub fn has_advanced_past(self, seen: Gen) -> bool {
        self.0 > seen.0
    }

    /// Generation the node carries after one more durable write.
    pub fn next(self) -> Gen {
        Gen(self.0.wrapping_add(1))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Gen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl fmt::Display for CpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cp{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Errors produced by the tree and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum BtreeError {
    /// IO failure while persisting or loading a store image.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Structural inconsistency; the tree must not keep operating.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Bad argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The put policy rejected the entry (duplicate insert, replace of a missing key).
    #[error("put rejected by policy")]
    PutFailed,
    /// The node store could not allocate another node.
    #[error("no space available for a new node")]
    SpaceNotAvail,
    /// The store refused the write because it is frozen.
    #[error("fast path not possible")]
    FastPathNotPossible,
    /// A write carried an older checkpoint than the node's last write.
    #[error("checkpoint mismatch")]
    CpMismatch,
    /// Transient condition; the top-level operation restarts from the root.
    #[error("retry")]
    Retry,
}

impl BtreeError {
    /// True for the internal restart signal.
    pub fn is_retry(&self) -> bool {
        matches!(self, BtreeError::Retry)
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BtreeError>;
