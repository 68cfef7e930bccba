use tracing::{debug, trace};

use super::{decode_key, Btree, NodeGuard, ReplayOutcome};
use crate::primitives::concurrency::LockedNode;
use crate::primitives::journal::{JournalEntry, JournalNode, JournalOp, NodeOp};
use crate::storage::btree::cp::BtreeCp;
use crate::storage::btree::key::{BtreeKey, BtreeValue};
use crate::storage::btree::node::BtreeNode;
use crate::types::{BtreeError, NodeId, Result};

const REPLAY_TARGET: &str = "latchtree::btree::replay";

impl<K: BtreeKey, V: BtreeValue> Btree<K, V> {
    /// Redoes one journaled structural change unless it already reached the store.
    ///
    /// Nodes are written at most once per entry, so their generations end up where the
    /// live change left them and replaying the same entry again is a no-op.
    pub fn replay(&self, entry: &JournalEntry) -> Result<ReplayOutcome> {
        if entry.op == JournalOp::Reset && *self.root.read() != entry.parent {
            return Err(BtreeError::Corruption("reset entry names a node other than the root"));
        }
        let cp = self.cp.read();
        let latch = self.store.read_node(entry.parent)?;
        let mut parent = LockedNode::write(&latch, entry.parent);
        if parent.gen().has_advanced_past(entry.parent_gen) {
            trace!(target: REPLAY_TARGET, entry = %entry, "already durable");
            return Ok(ReplayOutcome::NotNeeded);
        }
        match (entry.op, entry.is_root) {
            (JournalOp::Split, _) => self.replay_split(&mut parent, entry, &cp)?,
            (JournalOp::Merge, false) => self.replay_merge(&mut parent, entry, &cp)?,
            (JournalOp::Merge, true) => self.replay_collapse(&mut parent, entry, &cp)?,
            (JournalOp::Reset, _) => self.replay_reset(&mut parent, &cp)?,
        }
        debug!(target: REPLAY_TARGET, entry = %entry, "journal entry replayed");
        Ok(ReplayOutcome::Applied)
    }

    fn replay_split(
        &self,
        parent: &mut NodeGuard<K, V>,
        entry: &JournalEntry,
        cp: &BtreeCp,
    ) -> Result<()> {
        let [child1_rec, child2_rec] = entry.nodes.as_slice() else {
            return Err(BtreeError::Corruption("split entry must name two nodes"));
        };
        let split_key: K = decode_key(&child1_rec.key)?
            .ok_or(BtreeError::Corruption("split entry without a split key"))?;
        let child2_key: Option<K> = decode_key(&child2_rec.key)?;

        let mut child1 = if entry.is_root {
            // The root still holds the unsplit contents, which belong to child1.
            let latch = self.store.reserve_node(child1_rec.id, parent.is_leaf())?;
            let mut child1 = LockedNode::write(&latch, child1_rec.id);
            if !child1.gen().has_advanced_past(child1_rec.gen) {
                child1.body_mut()?.copy_contents_from(parent);
                child1.body_mut()?.set_valid(true);
            }
            parent.body_mut()?.reset(false);
            child1
        } else {
            let latch = self.store.read_node(child1_rec.id)?;
            LockedNode::write(&latch, child1_rec.id)
        };

        if child1.gen().has_advanced_past(child1_rec.gen) {
            let latch = self.store.read_node(child2_rec.id)?;
            let child2 = LockedNode::read(&latch, child2_rec.id);
            if !child2.gen().has_advanced_past(child2_rec.gen) {
                return Err(BtreeError::Corruption(
                    "split child written before its new sibling",
                ));
            }
        } else {
            self.redo_split_children(&mut child1, child2_rec, &split_key, cp)?;
        }

        let p = parent.body_mut()?;
        match &child2_key {
            Some(key) => {
                let (found, idx) = p.find(key);
                if !found {
                    return Err(BtreeError::Corruption("split slot key missing in parent"));
                }
                p.update_child(idx, child2_rec.id)?;
            }
            None => p.set_edge(Some(child2_rec.id))?,
        }
        let (found, idx) = p.find(&split_key);
        if found {
            return Err(BtreeError::Corruption("split key already routed in parent"));
        }
        p.insert(idx, split_key, child1_rec.id)?;
        self.write_node(parent, cp)
    }

    fn redo_split_children(
        &self,
        child1: &mut NodeGuard<K, V>,
        child2_rec: &JournalNode,
        split_key: &K,
        cp: &BtreeCp,
    ) -> Result<()> {
        let is_leaf = child1.is_leaf();
        let latch = self.store.reserve_node(child2_rec.id, is_leaf)?;
        let mut child2 = LockedNode::write(&latch, child2_rec.id);
        {
            let c2 = child2.body_mut()?;
            c2.reset(is_leaf);
            c2.set_valid(true);
            c2.set_gen(child2_rec.gen);
        }
        let c1 = child1.body_mut()?;
        let c2 = child2.body_mut()?;
        c1.split_after_key(c2, split_key, self.split_key_fn.as_ref())?;
        c2.set_next(c1.next());
        c1.set_next(Some(child2_rec.id));
        self.write_node(&mut child2, cp)?;
        self.write_node(child1, cp)
    }

    fn replay_merge(
        &self,
        parent: &mut NodeGuard<K, V>,
        entry: &JournalEntry,
        cp: &BtreeCp,
    ) -> Result<()> {
        let leftmost_rec = entry
            .nodes
            .first()
            .filter(|node| node.op == NodeOp::InplaceWrite)
            .ok_or(BtreeError::Corruption("merge entry without its leftmost node"))?;
        let removals: Vec<&JournalNode> = entry.nodes_with(NodeOp::Removal).collect();
        let creations: Vec<&JournalNode> = entry.nodes_with(NodeOp::Creation).collect();
        let last_removed = removals
            .last()
            .ok_or(BtreeError::Corruption("merge entry removes nothing"))?
            .id;

        let mut survivors: Vec<(Option<K>, NodeId)> = Vec::with_capacity(creations.len() + 1);
        survivors.push((decode_key(&leftmost_rec.key)?, leftmost_rec.id));
        for rec in &creations {
            survivors.push((decode_key(&rec.key)?, rec.id));
        }

        let latch = self.store.read_node(leftmost_rec.id)?;
        let mut leftmost = LockedNode::write(&latch, leftmost_rec.id);
        if !leftmost.gen().has_advanced_past(leftmost_rec.gen) {
            self.redo_merge_children(&mut leftmost, &removals, &creations, &survivors, cp)?;
        }
        drop(leftmost);

        let start = child_index(parent, leftmost_rec.id)?;
        let end = child_index(parent, last_removed)?;
        parent.body_mut()?.replace_children(start, end, &survivors)?;
        self.write_node(parent, cp)
    }

    fn redo_merge_children(
        &self,
        leftmost: &mut NodeGuard<K, V>,
        removals: &[&JournalNode],
        creations: &[&JournalNode],
        survivors: &[(Option<K>, NodeId)],
        cp: &BtreeCp,
    ) -> Result<()> {
        let is_leaf = leftmost.is_leaf();
        let mut tail_next = leftmost.next();
        for rec in removals {
            let latch = self.store.read_node(rec.id)?;
            let mut old = BtreeNode::clone(&LockedNode::read(&latch, rec.id));
            tail_next = old.next();
            leftmost
                .body_mut()?
                .move_in_from_right_by_size(&mut old, usize::MAX)?;
            if !old.is_empty() {
                return Err(BtreeError::Corruption("merge replay left entries behind"));
            }
        }

        let mut created: Vec<NodeGuard<K, V>> = Vec::with_capacity(creations.len());
        for rec in creations {
            let latch = self.store.reserve_node(rec.id, is_leaf)?;
            let mut node = LockedNode::write(&latch, rec.id);
            let body = node.body_mut()?;
            body.reset(is_leaf);
            body.set_valid(true);
            body.set_gen(rec.gen);
            created.push(node);
        }

        // Peel the survivors off the combined node from the right, each starting after
        // the routing key of the survivor to its left.
        for pos in (0..created.len()).rev() {
            let bound = survivors[pos]
                .0
                .as_ref()
                .ok_or(BtreeError::Corruption("keyless survivor before the last"))?;
            leftmost
                .body_mut()?
                .split_after_key(created[pos].body_mut()?, bound, None)?;
        }

        let mut next = tail_next;
        for node in created.iter_mut().rev() {
            node.body_mut()?.set_next(next);
            next = Some(node.id());
        }
        leftmost.body_mut()?.set_next(next);

        for node in created.iter_mut().rev() {
            self.write_node(node, cp)?;
        }
        self.write_node(leftmost, cp)
    }

    fn replay_collapse(
        &self,
        root: &mut NodeGuard<K, V>,
        entry: &JournalEntry,
        cp: &BtreeCp,
    ) -> Result<()> {
        let child_rec = entry
            .nodes_with(NodeOp::Removal)
            .next()
            .ok_or(BtreeError::Corruption("collapse entry without its child"))?;
        if root.is_leaf() || root.total_entries() > 0 || root.edge_id() != Some(child_rec.id) {
            return Err(BtreeError::Corruption(
                "collapse replay on a root of the wrong shape",
            ));
        }
        let latch = self.store.read_node(child_rec.id)?;
        let child = LockedNode::read(&latch, child_rec.id);
        root.body_mut()?.copy_contents_from(&child);
        drop(child);
        self.write_node(root, cp)
    }

    /// Empties the root again; recovery frees the nodes its removal records name.
    fn replay_reset(&self, root: &mut NodeGuard<K, V>, cp: &BtreeCp) -> Result<()> {
        root.body_mut()?.reset(true);
        self.write_node(root, cp)
    }
}

fn child_index<K: BtreeKey, V: BtreeValue>(
    node: &BtreeNode<K, V>,
    child: NodeId,
) -> Result<usize> {
    let last = node
        .last_child_index()
        .ok_or(BtreeError::Corruption("replay parent has no children"))?;
    (0..=last)
        .find(|&idx| node.child_at(idx) == Some(child))
        .ok_or(BtreeError::Corruption("replay child missing from its parent"))
}
