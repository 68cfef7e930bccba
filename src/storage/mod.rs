//! Storage engines built on the primitives layer.

/// Concurrent B+tree index.
pub mod btree;
