use std::fmt::Write as _;

use serde::Serialize;
use tracing::info;

use super::Btree;
use crate::primitives::concurrency::LockType;
use crate::primitives::journal::{JournalEntry, JournalOp, NodeOp};
use crate::storage::btree::key::{BtreeKey, BtreeValue};
use crate::storage::btree::node::BtreeNode;
use crate::storage::btree::store::FreeMode;
use crate::types::{BtreeError, NodeId, Result};

/// Node totals by kind.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct NodeCount {
    /// Leaf nodes.
    pub leaves: u64,
    /// Interior nodes.
    pub interiors: u64,
}

#[derive(Default)]
struct VerifyWalk {
    levels: Vec<Vec<(NodeId, Option<NodeId>)>>,
    leaf_depth: Option<usize>,
    entries: u64,
}

impl<K: BtreeKey, V: BtreeValue> Btree<K, V> {
    /// Checks every structural invariant while holding the tree exclusively.
    ///
    /// Covers key order, the parent key bounds, uniform leaf depth, edges only on the
    /// right spine, node validity, sibling links per level and the object count.
    pub fn verify(&self) -> Result<()> {
        let root_id = self.root.write();
        let mut walk = VerifyWalk::default();
        self.verify_node(*root_id, 0, None, None, true, &mut walk)?;
        for level in &walk.levels {
            for pair in level.windows(2) {
                if pair[0].1 != Some(pair[1].0) {
                    return Err(BtreeError::Corruption("sibling link skips a node"));
                }
            }
            if level.last().is_some_and(|(_, next)| next.is_some()) {
                return Err(BtreeError::Corruption("rightmost node links to a sibling"));
            }
        }
        if walk.entries as i64 != self.stats.obj_count() {
            return Err(BtreeError::Corruption("object count drifted from the leaves"));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        id: NodeId,
        depth: usize,
        lower: Option<&K>,
        upper: Option<&K>,
        right_spine: bool,
        walk: &mut VerifyWalk,
    ) -> Result<()> {
        let node = self.lock(id, LockType::Read)?;
        if !node.is_valid() {
            return Err(BtreeError::Corruption("reachable node is marked invalid"));
        }
        if !node.is_sorted() {
            return Err(BtreeError::Corruption("node keys out of order"));
        }
        let first = node.nth_key(0);
        let last = node.last_key();
        if lower.zip(first).is_some_and(|(lo, key)| key <= lo) {
            return Err(BtreeError::Corruption("key below its parent bound"));
        }
        if upper.zip(last).is_some_and(|(hi, key)| key > hi) {
            return Err(BtreeError::Corruption("key above its parent bound"));
        }
        if walk.levels.len() <= depth {
            walk.levels.resize_with(depth + 1, Vec::new);
        }
        walk.levels[depth].push((id, node.next()));

        if node.is_leaf() {
            match walk.leaf_depth {
                Some(expected) if expected != depth => {
                    return Err(BtreeError::Corruption("leaves at different depths"));
                }
                _ => walk.leaf_depth = Some(depth),
            }
            walk.entries += node.total_entries() as u64;
            return Ok(());
        }
        if node.has_valid_edge() != right_spine {
            return Err(BtreeError::Corruption("edge child off the right spine"));
        }
        if node.total_entries() == 0 && !node.has_valid_edge() {
            return Err(BtreeError::Corruption("interior node without children"));
        }
        let entries = node.interior_entries();
        for (idx, (key, child)) in entries.iter().enumerate() {
            let child_lower = if idx == 0 { lower } else { Some(&entries[idx - 1].0) };
            self.verify_node(*child, depth + 1, child_lower, Some(key), false, walk)?;
        }
        if let Some(edge) = node.edge_id() {
            let edge_lower = entries.last().map(|(key, _)| key).or(lower);
            self.verify_node(edge, depth + 1, edge_lower, upper, right_spine, walk)?;
        }
        Ok(())
    }

    /// Visits every reachable node, parents before children unless `post_order`.
    fn walk<F>(&self, id: NodeId, depth: usize, post_order: bool, visit: &mut F) -> Result<()>
    where
        F: FnMut(&BtreeNode<K, V>, usize) -> Result<()>,
    {
        let node = self.lock(id, LockType::Read)?;
        if !post_order {
            visit(&node, depth)?;
        }
        if let Some(last) = node.last_child_index() {
            for idx in 0..=last {
                if let Some(child) = node.child_at(idx) {
                    self.walk(child, depth + 1, post_order, visit)?;
                }
            }
        }
        if post_order {
            visit(&node, depth)?;
        }
        Ok(())
    }

    /// Leaf and interior node totals, counted by traversal.
    pub fn node_count(&self) -> Result<NodeCount> {
        let root_id = self.root.read();
        let mut count = NodeCount::default();
        self.walk(*root_id, 0, false, &mut |node, _| {
            if node.is_leaf() {
                count.leaves += 1;
            } else {
                count.interiors += 1;
            }
            Ok(())
        })?;
        Ok(count)
    }

    /// Number of levels, a lone leaf root being depth 1.
    pub fn depth(&self) -> Result<u64> {
        let root_id = self.root.read();
        let mut depth = 1;
        let mut node = self.lock(*root_id, LockType::Read)?;
        while let Some(child) = node.child_at(0) {
            node = self.lock(child, LockType::Read)?;
            depth += 1;
        }
        Ok(depth)
    }

    /// One line per node, indented by level.
    pub fn dump(&self) -> Result<String> {
        let root_id = self.root.read();
        let mut out = String::new();
        self.walk(*root_id, 0, false, &mut |node, depth| {
            let _ = writeln!(out, "{:indent$}{node}", "", indent = depth * 2);
            Ok(())
        })?;
        Ok(out)
    }

    /// Recomputes the object, node and depth gauges from the nodes themselves.
    pub(crate) fn refresh_stats(&self) -> Result<()> {
        let root_id = self.root.read();
        let (mut entries, mut leaves, mut interiors, mut depth) = (0i64, 0i64, 0i64, 0usize);
        self.walk(*root_id, 0, false, &mut |node, level| {
            if node.is_leaf() {
                leaves += 1;
                entries += node.total_entries() as i64;
                depth = depth.max(level + 1);
            } else {
                interiors += 1;
            }
            Ok(())
        })?;
        self.stats.reset_obj_count(entries);
        self.stats.reset_nodes(leaves, interiors);
        self.stats.set_depth(depth as u64);
        Ok(())
    }

    /// Frees every node below the root and leaves an empty leaf root behind.
    ///
    /// The reset is journaled with a removal record per freed node, so a crash before the
    /// closing checkpoint redoes it instead of orphaning the subtrees.
    pub fn destroy(&self) -> Result<()> {
        self.check_poisoned()?;
        {
            let root_id = self.root.write();
            let cp = self.cp.read();
            let mut doomed = Vec::new();
            let root = *root_id;
            self.walk(root, 0, true, &mut |node, _| {
                if node.id() != root {
                    doomed.push((node.id(), node.gen()));
                }
                Ok(())
            })?;
            let mut node = self.lock(root, LockType::Write)?;
            let mut entry = JournalEntry::new(JournalOp::Reset, true, cp.id(), (root, node.gen()));
            for (id, gen) in &doomed {
                entry.append_node(NodeOp::Removal, *id, *gen, None);
            }
            self.store.write_journal_entry(&entry)?;
            node.body_mut()?.reset(true);
            self.write_node(&mut node, &cp)?;
            drop(node);
            for (id, _) in &doomed {
                self.store.free_node(*id, &cp, FreeMode::Deferred)?;
            }
            self.stats.reset_obj_count(0);
            self.stats.reset_nodes(1, 0);
            self.stats.set_depth(1);
            info!(
                target: "latchtree::btree",
                tree = %self.cfg.name,
                freed = doomed.len(),
                "tree destroyed"
            );
        }
        self.checkpoint()?;
        Ok(())
    }
}
