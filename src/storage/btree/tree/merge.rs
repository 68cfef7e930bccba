use tracing::{debug, trace};

use super::{encode_key, Btree, MergeOutcome, NodeGuard};
use crate::primitives::concurrency::{LockType, LockedNode};
use crate::primitives::journal::{JournalEntry, JournalOp, NodeOp};
use crate::storage::btree::cp::BtreeCp;
use crate::storage::btree::key::{BtreeKey, BtreeValue};
use crate::storage::btree::node::BtreeNode;
use crate::storage::btree::store::FreeMode;
use crate::types::{BtreeError, NodeId, Result};

const MERGE_TARGET: &str = "latchtree::btree::merge";

impl<K: BtreeKey, V: BtreeValue> Btree<K, V> {
    /// Like [`Btree::merge_nodes`], treating an exhausted store as nothing to do.
    pub(crate) fn try_merge(
        &self,
        parent: &mut NodeGuard<K, V>,
        ind: usize,
        cp: &BtreeCp,
    ) -> Result<MergeOutcome> {
        match self.merge_nodes(parent, ind, cp) {
            Err(BtreeError::SpaceNotAvail) => {
                debug!(
                    target: MERGE_TARGET,
                    parent = parent.id().0,
                    "no space for merge replacements; merge skipped"
                );
                Ok(MergeOutcome::NotRequired)
            }
            other => other,
        }
    }

    /// Rebalances the children around `ind` under the write-latched `parent`.
    ///
    /// The span starts at the underfull child and covers up to `max_nodes_to_rebalance`
    /// children; the last child pairs with its left neighbour instead. Entries are pulled
    /// left into the leftmost child and into fresh copies of the others; copies left empty
    /// are dropped.
    pub(crate) fn merge_nodes(
        &self,
        parent: &mut NodeGuard<K, V>,
        ind: usize,
        cp: &BtreeCp,
    ) -> Result<MergeOutcome> {
        let last = parent
            .last_child_index()
            .ok_or(BtreeError::Corruption("merge under a childless node"))?;
        let width = self.cfg.max_nodes_to_rebalance;
        let end = (ind + width - 1).min(last);
        let start = if end > ind { ind } else { ind.saturating_sub(1) };
        if start >= end {
            return Ok(MergeOutcome::NotRequired);
        }

        let mut olds: Vec<NodeGuard<K, V>> = Vec::with_capacity(end - start + 1);
        for idx in start..=end {
            let id = parent
                .child_at(idx)
                .ok_or(BtreeError::Corruption("merge span past the last child"))?;
            olds.push(self.lock(id, LockType::Write)?);
        }
        if olds[0].occupied_size() > self.cfg.ideal_fill_size() {
            trace!(target: MERGE_TARGET, parent = parent.id().0, "leftmost child already full");
            return Ok(MergeOutcome::NotRequired);
        }
        let is_leaf = olds[0].is_leaf();

        let mut repls: Vec<NodeGuard<K, V>> = Vec::with_capacity(olds.len() - 1);
        for old in &olds[1..] {
            match self.store.alloc_node(is_leaf) {
                Ok((id, latch)) => {
                    let mut repl = LockedNode::write(&latch, id);
                    repl.body_mut()?.copy_contents_from(old);
                    repls.push(repl);
                }
                Err(err) => {
                    self.free_replacements(repls, cp)?;
                    return Err(err);
                }
            }
        }

        let leftmost_backup = BtreeNode::clone(&olds[0]);
        let moved = {
            let mut members: Vec<&mut BtreeNode<K, V>> = Vec::with_capacity(olds.len());
            members.push(olds[0].body_mut()?);
            for repl in repls.iter_mut() {
                members.push(repl.body_mut()?);
            }
            self.pull_left(&mut members)?
        };

        let (kept, dropped): (Vec<_>, Vec<_>) = repls.into_iter().partition(|r| !r.is_empty());
        if moved == 0 && dropped.is_empty() {
            self.free_replacements(kept, cp)?;
            return Ok(MergeOutcome::NotRequired);
        }
        let mut kept = kept;

        // Routing key of every survivor, leftmost first; `None` marks the new edge.
        let covers_edge = end == parent.total_entries();
        let end_key = if covers_edge {
            None
        } else {
            Some(
                parent
                    .nth_key(end)
                    .ok_or(BtreeError::Corruption("merge span past parent entries"))?
                    .clone(),
            )
        };
        let survivor_count = kept.len() + 1;
        let mut keys: Vec<Option<K>> = Vec::with_capacity(survivor_count);
        for pos in 0..survivor_count {
            let node: &BtreeNode<K, V> = if pos == 0 { &*olds[0] } else { &*kept[pos - 1] };
            if pos + 1 == survivor_count {
                keys.push(end_key.clone());
            } else {
                let key = node
                    .last_key()
                    .ok_or(BtreeError::Corruption("empty node kept by merge"))?;
                keys.push(Some(key.end_key()));
            }
        }

        let tail_next = olds.last().and_then(|old| old.next());
        let ids: Vec<NodeId> = std::iter::once(olds[0].id())
            .chain(kept.iter().map(|r| r.id()))
            .collect();
        for pos in 0..survivor_count {
            let next = ids.get(pos + 1).copied().or(tail_next);
            if pos == 0 {
                olds[0].body_mut()?.set_next(next);
            } else {
                kept[pos - 1].body_mut()?.set_next(next);
            }
        }

        let mut entry =
            JournalEntry::new(JournalOp::Merge, false, cp.id(), (parent.id(), parent.gen()));
        entry.append_node(
            NodeOp::InplaceWrite,
            olds[0].id(),
            olds[0].gen(),
            keys[0].as_ref().map(encode_key),
        );
        for old in &olds[1..] {
            entry.append_node(NodeOp::Removal, old.id(), old.gen(), None);
        }
        for (repl, key) in kept.iter().zip(&keys[1..]) {
            entry.append_node(
                NodeOp::Creation,
                repl.id(),
                repl.gen(),
                key.as_ref().map(encode_key),
            );
        }
        if let Err(err) = self.store.write_journal_entry(&entry) {
            *olds[0].body_mut()? = leftmost_backup;
            self.free_replacements(kept, cp)?;
            self.free_replacements(dropped, cp)?;
            return Err(err);
        }

        let survivors: Vec<(Option<K>, NodeId)> = keys.into_iter().zip(ids).collect();
        parent.body_mut()?.replace_children(start, end, &survivors)?;
        self.stats.inc_merges();
        self.stats
            .add_nodes(is_leaf, survivor_count as i64 - olds.len() as i64);

        for repl in kept.iter_mut().rev() {
            self.write_node(repl, cp)?;
        }
        self.write_node(&mut olds[0], cp)?;
        self.write_node(parent, cp)?;

        let removed = olds.len() - 1;
        for mut old in olds.drain(1..) {
            old.body_mut()?.set_valid(false);
            let id = old.id();
            drop(old);
            self.store.free_node(id, cp, FreeMode::Deferred)?;
        }
        let discarded = dropped.len();
        self.free_replacements(dropped, cp)?;
        debug!(
            target: MERGE_TARGET,
            parent = parent.id().0,
            start,
            end,
            removed,
            survivors = survivor_count,
            discarded,
            "children merged"
        );
        Ok(MergeOutcome::Merged)
    }

    /// Fills every member up to the ideal size from its right-hand neighbours.
    ///
    /// Returns the number of entries that changed node.
    fn pull_left(&self, members: &mut [&mut BtreeNode<K, V>]) -> Result<usize> {
        let ideal = self.cfg.ideal_fill_size();
        let mut moved = 0;
        let mut next = 1;
        for target in 0..members.len() {
            next = next.max(target + 1);
            while next < members.len() {
                let room = ideal.saturating_sub(members[target].occupied_size());
                if room == 0 {
                    break;
                }
                let (left, right) = members.split_at_mut(next);
                moved += left[target].move_in_from_right_by_size(&mut *right[0], room)?;
                if !right[0].is_empty() {
                    break;
                }
                next += 1;
            }
        }
        Ok(moved)
    }

    fn free_replacements(&self, repls: Vec<NodeGuard<K, V>>, cp: &BtreeCp) -> Result<()> {
        for repl in repls {
            let id = repl.id();
            drop(repl);
            self.store.free_node(id, cp, FreeMode::Immediate)?;
        }
        Ok(())
    }

    /// Pulls the root's only child up into the root while it has no keyed entries.
    pub(crate) fn check_collapse_root(&self) -> Result<()> {
        {
            let root_id = self.root.read();
            let root = self.lock(*root_id, LockType::Read)?;
            if collapsible_edge(&root).is_none() {
                return Ok(());
            }
        }
        let root_id = self.root.write();
        let cp = self.cp.read();
        loop {
            let mut root = self.lock(*root_id, LockType::Write)?;
            let Some(child_id) = collapsible_edge(&root) else {
                return Ok(());
            };
            let mut child = self.lock(child_id, LockType::Write)?;
            let mut entry =
                JournalEntry::new(JournalOp::Merge, true, cp.id(), (root.id(), root.gen()));
            entry.append_node(NodeOp::InplaceWrite, root.id(), root.gen(), None);
            entry.append_node(NodeOp::Removal, child.id(), child.gen(), None);
            self.store.write_journal_entry(&entry)?;

            BtreeNode::swap_contents(root.body_mut()?, child.body_mut()?);
            child.body_mut()?.set_valid(false);
            self.stats.dec_depth();
            self.stats.add_nodes(false, -1);
            self.write_node(&mut root, &cp)?;
            drop(child);
            self.store.free_node(child_id, &cp, FreeMode::Deferred)?;
            debug!(
                target: MERGE_TARGET,
                root = root_id.0,
                child = child_id.0,
                depth = self.stats.depth(),
                "root collapsed"
            );
        }
    }
}

fn collapsible_edge<K: BtreeKey, V: BtreeValue>(node: &BtreeNode<K, V>) -> Option<NodeId> {
    if node.is_leaf() || node.total_entries() > 0 {
        None
    } else {
        node.edge_id()
    }
}
