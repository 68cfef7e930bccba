use tracing::{debug, warn};

use super::{encode_key, Btree, NodeGuard};
use crate::primitives::concurrency::{LockType, LockedNode};
use crate::primitives::journal::{JournalEntry, JournalOp, NodeOp};
use crate::storage::btree::cp::BtreeCp;
use crate::storage::btree::key::{BtreeKey, BtreeValue};
use crate::storage::btree::node::BtreeNode;
use crate::storage::btree::store::FreeMode;
use crate::types::{BtreeError, Result};

const SPLIT_TARGET: &str = "latchtree::btree::split";

impl<K: BtreeKey, V: BtreeValue> Btree<K, V> {
    /// Splits the root in place when it is full.
    ///
    /// The root keeps its id: its contents move into a fresh node that becomes the
    /// root's edge and is then split like any other child.
    pub(crate) fn check_split_root(&self) -> Result<()> {
        let root_id = self.root.write();
        let cp = self.cp.read();
        let mut root = self.lock(*root_id, LockType::Write)?;
        if !root.is_split_needed(&self.cfg) {
            return Ok(());
        }
        let (child_id, latch) = self.store.alloc_node(false).inspect_err(|_| {
            self.stats.inc_split_failures();
        })?;
        let mut child = LockedNode::write(&latch, child_id);
        BtreeNode::swap_contents(root.body_mut()?, child.body_mut()?);
        root.body_mut()?.set_edge(Some(child_id))?;

        let child2 = match self.prepare_split(&mut root, &mut child, 0, true, &cp) {
            Ok(child2) => child2,
            Err(err) => {
                root.body_mut()?.set_edge(None)?;
                BtreeNode::swap_contents(root.body_mut()?, child.body_mut()?);
                drop(child);
                self.store.free_node(child_id, &cp, FreeMode::Immediate)?;
                return Err(err);
            }
        };
        self.stats.inc_depth();
        self.stats.add_nodes(false, 1);
        self.commit_split(&mut root, &mut child, child2, &cp)?;
        debug!(
            target: SPLIT_TARGET,
            root = root_id.0,
            child = child_id.0,
            depth = self.stats.depth(),
            "root split"
        );
        Ok(())
    }

    /// Splits `child1`, addressed by `parent_ind` in `parent`, into two siblings.
    ///
    /// Both nodes must be write-latched.
    pub(crate) fn split_node(
        &self,
        parent: &mut NodeGuard<K, V>,
        child1: &mut NodeGuard<K, V>,
        parent_ind: usize,
        cp: &BtreeCp,
    ) -> Result<()> {
        let child2 = self.prepare_split(parent, child1, parent_ind, false, cp)?;
        self.commit_split(parent, child1, child2, cp)
    }

    /// Moves entries into a new sibling, patches the parent and journals the change.
    ///
    /// Any failure up to and including the journal write leaves both nodes as they were.
    fn prepare_split(
        &self,
        parent: &mut NodeGuard<K, V>,
        child1: &mut NodeGuard<K, V>,
        parent_ind: usize,
        is_root: bool,
        cp: &BtreeCp,
    ) -> Result<NodeGuard<K, V>> {
        let (child2_id, latch) = self.store.alloc_node(child1.is_leaf()).inspect_err(|_| {
            self.stats.inc_split_failures();
        })?;
        let mut child2 = LockedNode::write(&latch, child2_id);
        let parent_backup = BtreeNode::clone(parent);
        let child1_backup = BtreeNode::clone(child1);

        match self.fill_split(parent, child1, &mut child2, parent_ind, is_root, cp) {
            Ok(()) => Ok(child2),
            Err(err) => {
                *parent.body_mut()? = parent_backup;
                *child1.body_mut()? = child1_backup;
                drop(child2);
                self.stats.inc_split_failures();
                warn!(
                    target: SPLIT_TARGET,
                    parent = parent.id().0,
                    child = child1.id().0,
                    error = %err,
                    "split abandoned"
                );
                self.store.free_node(child2_id, cp, FreeMode::Immediate)?;
                Err(err)
            }
        }
    }

    fn fill_split(
        &self,
        parent: &mut NodeGuard<K, V>,
        child1: &mut NodeGuard<K, V>,
        child2: &mut NodeGuard<K, V>,
        parent_ind: usize,
        is_root: bool,
        cp: &BtreeCp,
    ) -> Result<()> {
        let is_edge = parent_ind == parent.total_entries();
        let child2_key = if is_edge {
            None
        } else {
            Some(
                parent
                    .nth_key(parent_ind)
                    .ok_or(BtreeError::Corruption("split index past parent entries"))?
                    .clone(),
            )
        };

        let c1 = child1.body_mut()?;
        let c2 = child2.body_mut()?;
        c2.set_next(c1.next());
        c1.set_next(Some(c2.id()));
        let split_size = self.cfg.split_size(c1.occupied_size());
        let moved = c1.move_out_to_right_by_size(c2, split_size)?;
        if moved == 0 || c1.total_entries() == 0 {
            return Err(BtreeError::Corruption("split left a node empty"));
        }
        let split_key = c1
            .last_key()
            .ok_or(BtreeError::Corruption("split left a node empty"))?
            .end_key();

        let p = parent.body_mut()?;
        p.update_child(parent_ind, c2.id())?;
        p.insert(parent_ind, split_key.clone(), c1.id())?;

        let mut entry = JournalEntry::new(JournalOp::Split, is_root, cp.id(), (p.id(), p.gen()));
        let child1_op = if is_root {
            NodeOp::Creation
        } else {
            NodeOp::InplaceWrite
        };
        entry.append_node(child1_op, c1.id(), c1.gen(), Some(encode_key(&split_key)));
        entry.append_node(
            NodeOp::Creation,
            c2.id(),
            c2.gen(),
            child2_key.as_ref().map(encode_key),
        );
        self.store.write_journal_entry(&entry)?;
        Ok(())
    }

    /// Writes a prepared split: the new sibling, then the split node, then the parent.
    fn commit_split(
        &self,
        parent: &mut NodeGuard<K, V>,
        child1: &mut NodeGuard<K, V>,
        mut child2: NodeGuard<K, V>,
        cp: &BtreeCp,
    ) -> Result<()> {
        self.stats.inc_splits();
        self.stats.add_nodes(child1.is_leaf(), 1);
        self.write_node(&mut child2, cp)?;
        self.write_node(child1, cp)?;
        self.write_node(parent, cp)?;
        debug!(
            target: SPLIT_TARGET,
            parent = parent.id().0,
            child1 = child1.id().0,
            child2 = child2.id().0,
            left = child1.total_entries(),
            right = child2.total_entries(),
            "node split"
        );
        Ok(())
    }
}
