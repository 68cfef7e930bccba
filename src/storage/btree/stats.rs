use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct BtreeStatsSnapshot {
    /// Number of user entries stored in leaves
    pub obj_count: i64,
    /// Number of leaf nodes created minus freed
    pub leaf_nodes: i64,
    /// Number of interior nodes created minus freed
    pub interior_nodes: i64,
    /// Number of node splits performed
    pub splits: u64,
    /// Number of splits that failed after locking
    pub split_failures: u64,
    /// Number of merges performed
    pub merges: u64,
    /// Levels between the root and the leaves, inclusive
    pub depth: u64,
    /// Number of node writes issued to the store
    pub node_writes: u64,
    /// Lock upgrades that lost a race with another writer
    pub gen_mismatches: u64,
    /// Top-level restarts
    pub retries: u64,
    /// Mutations that ended in an error status
    pub write_errors: u64,
    /// Reads that ended in an error status
    pub query_errors: u64,
    /// Point puts issued
    pub puts: u64,
    /// Point gets issued
    pub gets: u64,
    /// Point removes issued
    pub removes: u64,
    /// Range updates issued
    pub range_updates: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default, Debug)]
pub struct BtreeStats {
    obj_count: AtomicI64,
    leaf_nodes: AtomicI64,
    interior_nodes: AtomicI64,
    splits: AtomicU64,
    split_failures: AtomicU64,
    merges: AtomicU64,
    depth: AtomicU64,
    node_writes: AtomicU64,
    gen_mismatches: AtomicU64,
    retries: AtomicU64,
    write_errors: AtomicU64,
    query_errors: AtomicU64,
    puts: AtomicU64,
    gets: AtomicU64,
    removes: AtomicU64,
    range_updates: AtomicU64,
}

impl BtreeStats {
    /// Returns the current number of stored entries.
    pub fn obj_count(&self) -> i64 {
        self.obj_count.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current tree depth.
    pub fn depth(&self) -> u64 {
        self.depth.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of splits performed.
    pub fn splits(&self) -> u64 {
        self.splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of merges performed.
    pub fn merges(&self) -> u64 {
        self.merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of top-level restarts.
    pub fn retries(&self) -> u64 {
        self.retries.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of upgrades that observed a changed generation.
    pub fn gen_mismatches(&self) -> u64 {
        self.gen_mismatches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of failed mutations.
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn add_obj_count(&self, delta: i64) {
        self.obj_count.fetch_add(delta, AtomicOrdering::Relaxed);
    }

    pub(crate) fn reset_obj_count(&self, value: i64) {
        self.obj_count.store(value, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_nodes(&self, is_leaf: bool, delta: i64) {
        let counter = if is_leaf {
            &self.leaf_nodes
        } else {
            &self.interior_nodes
        };
        counter.fetch_add(delta, AtomicOrdering::Relaxed);
    }

    pub(crate) fn reset_nodes(&self, leaves: i64, interiors: i64) {
        self.leaf_nodes.store(leaves, AtomicOrdering::Relaxed);
        self.interior_nodes.store(interiors, AtomicOrdering::Relaxed);
    }

    pub(crate) fn set_depth(&self, depth: u64) {
        self.depth.store(depth, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_depth(&self) {
        self.depth.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn dec_depth(&self) {
        self.depth.fetch_sub(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_splits(&self) {
        self.splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_split_failures(&self) {
        self.split_failures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_writes(&self) {
        self.node_writes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_gen_mismatches(&self) {
        self.gen_mismatches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_retries(&self) {
        self.retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_write_errors(&self) {
        self.write_errors.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_query_errors(&self) {
        self.query_errors.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_puts(&self) {
        self.puts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_gets(&self) {
        self.gets.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_removes(&self) {
        self.removes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_range_updates(&self) {
        self.range_updates.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BtreeStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        BtreeStatsSnapshot {
            obj_count: self.obj_count(),
            leaf_nodes: self.leaf_nodes.load(AtomicOrdering::Relaxed),
            interior_nodes: self.interior_nodes.load(AtomicOrdering::Relaxed),
            splits: load(&self.splits),
            split_failures: load(&self.split_failures),
            merges: load(&self.merges),
            depth: load(&self.depth),
            node_writes: load(&self.node_writes),
            gen_mismatches: load(&self.gen_mismatches),
            retries: load(&self.retries),
            write_errors: load(&self.write_errors),
            query_errors: load(&self.query_errors),
            puts: load(&self.puts),
            gets: load(&self.gets),
            removes: load(&self.removes),
            range_updates: load(&self.range_updates),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self, name: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "latchtree::btree::stats",
            tree = name,
            obj_count = snapshot.obj_count,
            leaf_nodes = snapshot.leaf_nodes,
            interior_nodes = snapshot.interior_nodes,
            depth = snapshot.depth,
            splits = snapshot.splits,
            split_failures = snapshot.split_failures,
            merges = snapshot.merges,
            node_writes = snapshot.node_writes,
            gen_mismatches = snapshot.gen_mismatches,
            retries = snapshot.retries,
            write_errors = snapshot.write_errors,
            query_errors = snapshot.query_errors,
            "btree stats snapshot"
        );
    }
}
