//! Low-level primitives for the tree engine.
//!
//! Includes node latches with lock tracking and the structural-change journal.

/// Node latches and RAII lock guards.
///
/// Latch acquisition is tracked per thread under the `lock-tracking` feature.
pub mod concurrency;

/// Journal entries describing splits, merges and root collapses.
///
/// Entries are framed with a checksum so torn writes are detected on replay.
pub mod journal;
