//! The concurrent tree: lock-coupled descent, structural changes and replay.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::config::{BtreeConfig, Flips};
use super::cp::BtreeCp;
use super::key::{BtreeKey, BtreeValue, SplitKeyFn};
use super::node::BtreeNode;
use super::stats::{BtreeStats, BtreeStatsSnapshot};
use super::store::{FreeMode, NodeStore};
use crate::primitives::concurrency::{assert_no_locks_held, LockType, LockedNode};
use crate::primitives::journal::NodeOp;
use crate::types::{BtreeError, CpId, NodeId, Result};

mod api;
mod maintenance;
mod merge;
mod range;
mod replay;
mod split;

pub use maintenance::NodeCount;
pub use range::QueryCursor;
pub(crate) use range::RangeCursor;

pub(crate) type NodeGuard<K, V> = LockedNode<BtreeNode<K, V>>;

const UPGRADE_TARGET: &str = "latchtree::btree::upgrade";

/// Outcome of a merge attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MergeOutcome {
    /// Entries moved or a node was dropped.
    Merged,
    /// The span had nothing to rebalance.
    NotRequired,
}

/// Outcome of replaying one journal entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplayOutcome {
    /// The change was redone.
    Applied,
    /// The change had already reached the store.
    NotNeeded,
}

/// A concurrent B+tree over a [`NodeStore`].
pub struct Btree<K: BtreeKey, V: BtreeValue> {
    cfg: BtreeConfig,
    store: Arc<dyn NodeStore<K, V>>,
    root: RwLock<NodeId>,
    cp: RwLock<BtreeCp>,
    stats: Arc<BtreeStats>,
    flips: Mutex<Flips>,
    split_key_fn: Option<SplitKeyFn<K, V>>,
    poisoned: AtomicBool,
}

impl<K: BtreeKey, V: BtreeValue> Btree<K, V> {
    /// Creates an empty tree in a store that holds none yet.
    pub fn create(cfg: BtreeConfig, store: Arc<dyn NodeStore<K, V>>) -> Result<Self> {
        cfg.validate()?;
        if store.root_id().is_some() {
            return Err(BtreeError::Invalid("store already holds a tree"));
        }
        let cp = BtreeCp::new(next_cp(store.last_flushed_cp()));
        let (root_id, latch) = store.alloc_node(true)?;
        {
            let mut root = latch.write();
            store.write_node(&mut root, &cp)?;
        }
        store.set_root_id(root_id)?;
        let tree = Self::assemble(cfg, store, root_id, cp);
        tree.stats.set_depth(1);
        tree.stats.reset_nodes(1, 0);
        info!(target: "latchtree::btree", tree = %tree.cfg.name, root = root_id.0, "tree created");
        Ok(tree)
    }

    /// Opens the tree a store already holds, without replaying its journal.
    pub fn open(cfg: BtreeConfig, store: Arc<dyn NodeStore<K, V>>) -> Result<Self> {
        cfg.validate()?;
        let root_id = store.root_id().ok_or(BtreeError::Invalid("store holds no tree"))?;
        let cp = BtreeCp::new(next_cp(store.last_flushed_cp()));
        let tree = Self::assemble(cfg, store, root_id, cp);
        tree.refresh_stats()?;
        Ok(tree)
    }

    /// Opens the tree a store holds and replays every pending journal entry.
    pub fn recover(cfg: BtreeConfig, store: Arc<dyn NodeStore<K, V>>) -> Result<Self> {
        Self::recover_with(cfg, store, None)
    }

    /// Like [`Btree::recover`], with the divider used for straddling split keys.
    pub fn recover_with(
        cfg: BtreeConfig,
        store: Arc<dyn NodeStore<K, V>>,
        split_key_fn: Option<SplitKeyFn<K, V>>,
    ) -> Result<Self> {
        cfg.validate()?;
        let root_id = store.root_id().ok_or(BtreeError::Invalid("store holds no tree"))?;
        let cp = BtreeCp::new(next_cp(store.last_flushed_cp()));
        let mut tree = Self::assemble(cfg, store, root_id, cp);
        tree.split_key_fn = split_key_fn;
        let entries = tree.store.journal_entries()?;
        let mut applied = 0usize;
        for entry in &entries {
            if tree.replay(entry)? == ReplayOutcome::Applied {
                applied += 1;
            }
        }
        {
            let cp = tree.cp.read();
            for entry in &entries {
                for node in entry.nodes_with(NodeOp::Removal) {
                    tree.store.free_node(node.id, &cp, FreeMode::Deferred)?;
                }
            }
        }
        tree.checkpoint()?;
        tree.refresh_stats()?;
        info!(
            target: "latchtree::btree::replay",
            tree = %tree.cfg.name,
            entries = entries.len(),
            applied,
            "recovery complete"
        );
        Ok(tree)
    }

    fn assemble(
        cfg: BtreeConfig,
        store: Arc<dyn NodeStore<K, V>>,
        root_id: NodeId,
        cp: BtreeCp,
    ) -> Self {
        Self {
            cfg,
            store,
            root: RwLock::new(root_id),
            cp: RwLock::new(cp),
            stats: Arc::new(BtreeStats::default()),
            flips: Mutex::new(Flips::default()),
            split_key_fn: None,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Installs the divider replay uses for entries straddling a split key.
    pub fn with_split_key_fn(mut self, split_key_fn: SplitKeyFn<K, V>) -> Self {
        self.split_key_fn = Some(split_key_fn);
        self
    }

    /// Replaces the fault-injection switches.
    pub fn set_flips(&self, flips: Flips) {
        *self.flips.lock() = flips;
    }

    /// Tree configuration.
    pub fn config(&self) -> &BtreeConfig {
        &self.cfg
    }

    /// Root node id; fixed for the lifetime of the tree.
    pub fn root_id(&self) -> NodeId {
        *self.root.read()
    }

    /// Live statistics counters.
    pub fn stats(&self) -> Arc<BtreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the statistics counters.
    pub fn stats_snapshot(&self) -> BtreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emits the statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing(&self.cfg.name);
    }

    /// Id of the checkpoint mutations currently join.
    pub fn current_cp(&self) -> CpId {
        self.cp.read().id()
    }

    /// True once a corruption was detected; mutations are refused from then on.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(AtomicOrdering::Acquire)
    }

    /// Completes the open checkpoint and starts the next one.
    ///
    /// Waits for in-flight operations. Deferred frees are applied and the journal is
    /// truncated.
    pub fn checkpoint(&self) -> Result<CpId> {
        let mut cp = self.cp.write();
        let next = BtreeCp::new(next_cp(cp.id()));
        let done = std::mem::replace(&mut *cp, next);
        self.store.cp_flush(&done)?;
        info!(
            target: "latchtree::btree",
            tree = %self.cfg.name,
            cp = done.id().0,
            "checkpoint complete"
        );
        Ok(done.id())
    }

    pub(crate) fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(BtreeError::Corruption("tree poisoned by an earlier corruption"));
        }
        Ok(())
    }

    /// Books an operation's final status into the counters.
    pub(crate) fn finish<T>(&self, op: &'static str, is_read: bool, res: Result<T>) -> Result<T> {
        assert_no_locks_held();
        if let Err(err) = &res {
            if let BtreeError::Corruption(what) = err {
                self.poisoned.store(true, AtomicOrdering::Release);
                error!(target: "latchtree::btree", tree = %self.cfg.name, op, what, "corruption detected; tree poisoned");
            }
            if is_read {
                self.stats.inc_query_errors();
            } else {
                self.stats.inc_write_errors();
            }
        }
        res
    }

    /// Runs `attempt` until it stops asking for a restart from the root.
    pub(crate) fn retry_loop<T>(&self, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        loop {
            match attempt() {
                Err(BtreeError::Retry) => {
                    assert_no_locks_held();
                    self.stats.inc_retries();
                    self.stats.inc_write_errors();
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }

    pub(crate) fn validate_entry(&self, key: &K, value: &V) -> Result<()> {
        if key.serialized_size() > self.cfg.max_key_size {
            return Err(BtreeError::Invalid("key exceeds max_key_size"));
        }
        if value.serialized_size() > self.cfg.max_value_size {
            return Err(BtreeError::Invalid("value exceeds max_value_size"));
        }
        Ok(())
    }

    pub(crate) fn lock(&self, id: NodeId, lock_type: LockType) -> Result<NodeGuard<K, V>> {
        let latch = self.store.read_node(id)?;
        Ok(LockedNode::lock(&latch, id, lock_type))
    }

    /// Read-locks a child, switching to a write latch when it turns out to be a leaf.
    ///
    /// The caller holds the parent, so the child cannot be split or merged in between.
    pub(crate) fn lock_child(&self, id: NodeId) -> Result<NodeGuard<K, V>> {
        let child = self.lock(id, LockType::Read)?;
        if child.is_leaf() {
            Ok(child.relock_write())
        } else {
            Ok(child)
        }
    }

    pub(crate) fn write_node(&self, node: &mut NodeGuard<K, V>, cp: &BtreeCp) -> Result<()> {
        self.store.write_node(node.body_mut()?, cp)?;
        self.stats.inc_node_writes();
        Ok(())
    }

    /// Trades a read latch on `node` (and optionally its child) for write latches.
    ///
    /// Both latches are dropped in between. If either node was written or freed meanwhile
    /// the upgrade fails with [`BtreeError::Retry`].
    pub(crate) fn upgrade_node(
        &self,
        node: NodeGuard<K, V>,
        child: Option<NodeGuard<K, V>>,
    ) -> Result<(NodeGuard<K, V>, Option<NodeGuard<K, V>>)> {
        let child_seen = child.map(|c| (c.latch(), c.id(), c.gen()));
        let node = if node.is_write() {
            node
        } else {
            let (latch, id, seen) = (node.latch(), node.id(), node.gen());
            drop(node);
            self.apply_upgrade_flips(id)?;
            let node = LockedNode::write(&latch, id);
            if !node.is_valid() || node.gen().has_advanced_past(seen) {
                self.stats.inc_gen_mismatches();
                warn!(
                    target: UPGRADE_TARGET,
                    node = id.0,
                    seen = seen.0,
                    now = node.gen().0,
                    valid = node.is_valid(),
                    "lock upgrade lost a race"
                );
                return Err(BtreeError::Retry);
            }
            node
        };
        let child = match child_seen {
            None => None,
            Some((latch, id, seen)) => {
                let child = LockedNode::write(&latch, id);
                if !child.is_valid() || child.gen().has_advanced_past(seen) {
                    self.stats.inc_gen_mismatches();
                    warn!(target: UPGRADE_TARGET, node = id.0, "child changed during upgrade");
                    return Err(BtreeError::Retry);
                }
                Some(child)
            }
        };
        Ok((node, child))
    }

    fn apply_upgrade_flips(&self, id: NodeId) -> Result<()> {
        let delay = {
            let mut flips = self.flips.lock();
            if flips.upgrade_fail_count > 0 {
                flips.upgrade_fail_count -= 1;
                warn!(target: UPGRADE_TARGET, node = id.0, "forced lock upgrade failure");
                return Err(BtreeError::Retry);
            }
            flips.upgrade_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

fn next_cp(cp: CpId) -> CpId {
    CpId(cp.0 + 1)
}

pub(crate) fn encode_key<K: BtreeKey>(key: &K) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.serialized_size());
    key.encode(&mut out);
    out
}

pub(crate) fn decode_key<K: BtreeKey>(raw: &Option<Vec<u8>>) -> Result<Option<K>> {
    raw.as_deref().map(K::decode).transpose()
}
