use tracing::{trace, warn};

use super::{Btree, MergeOutcome, NodeGuard};
use crate::primitives::concurrency::{assert_no_locks_held, LockType};
use crate::storage::btree::cp::BtreeCp;
use crate::storage::btree::key::{BtreeKey, BtreeValue, PutType};
use crate::types::{BtreeError, Result};

const API_TARGET: &str = "latchtree::btree::api";

impl<K: BtreeKey, V: BtreeValue> Btree<K, V> {
    /// Stores `value` under `key` according to `put_type`.
    ///
    /// Returns the value the key held before, if any.
    pub fn put(&self, key: K, value: V, put_type: PutType) -> Result<Option<V>> {
        assert_no_locks_held();
        self.stats.inc_puts();
        let res = self
            .check_poisoned()
            .and_then(|()| self.validate_entry(&key, &value))
            .and_then(|()| self.retry_loop(|| self.put_attempt(&key, &value, put_type)));
        self.finish("put", false, res)
    }

    /// Shorthand for an upsert.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.put(key, value, PutType::ReplaceIfExistsElseInsert)
    }

    fn put_attempt(&self, key: &K, value: &V, put_type: PutType) -> Result<Option<V>> {
        let root_id = self.root.read();
        let cp = self.cp.read();
        let mut node = self.lock(*root_id, LockType::Read)?;
        if node.is_leaf() {
            node = node.relock_write();
        }
        if node.is_split_needed(&self.cfg) {
            drop(node);
            drop(cp);
            drop(root_id);
            self.check_split_root()?;
            return Err(BtreeError::Retry);
        }
        loop {
            if node.is_leaf() {
                return self.put_in_leaf(node, key, value, put_type, &cp);
            }
            let (idx, child_id) = node.child_for(key)?;
            let child = self.lock_child(child_id)?;
            if child.is_split_needed(&self.cfg) {
                let (mut parent, child) = self.upgrade_node(node, Some(child))?;
                let mut child =
                    child.ok_or(BtreeError::Corruption("upgrade dropped the child latch"))?;
                self.split_node(&mut parent, &mut child, idx, &cp)?;
                return Err(BtreeError::Retry);
            }
            node = child;
        }
    }

    fn put_in_leaf(
        &self,
        mut leaf: NodeGuard<K, V>,
        key: &K,
        value: &V,
        put_type: PutType,
        cp: &BtreeCp,
    ) -> Result<Option<V>> {
        let put = leaf
            .body_mut()?
            .leaf_put(key.clone(), value.clone(), put_type)?;
        if let Err(err) = self.write_node(&mut leaf, cp) {
            let body = leaf.body_mut()?;
            match &put.existing {
                Some(old) => {
                    body.leaf_put(key.clone(), old.clone(), PutType::ReplaceOnlyIfExists)?;
                }
                None => {
                    body.leaf_remove(key);
                }
            }
            return Err(err);
        }
        if put.inserted {
            self.stats.add_obj_count(1);
        }
        trace!(target: API_TARGET, leaf = leaf.id().0, inserted = put.inserted, "put applied");
        Ok(put.existing)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        assert_no_locks_held();
        self.stats.inc_gets();
        let res = self.do_get(key);
        self.finish("get", true, res)
    }

    fn do_get(&self, key: &K) -> Result<Option<V>> {
        let root_id = self.root.read();
        let mut node = self.lock(*root_id, LockType::Read)?;
        while !node.is_leaf() {
            let (_, child_id) = node.child_for(key)?;
            node = self.lock(child_id, LockType::Read)?;
        }
        Ok(node.leaf_get(key).cloned())
    }

    /// Removes `key`, returning its value. Underfull nodes on the path are merged.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        assert_no_locks_held();
        self.stats.inc_removes();
        let res = self.check_poisoned().and_then(|()| self.remove_internal(key));
        self.finish("remove", false, res)
    }

    pub(super) fn remove_internal(&self, key: &K) -> Result<Option<V>> {
        let (removed, mut merged) = self.retry_loop(|| self.remove_attempt(key, false))?;
        while merged {
            merged = match self.remove_attempt(key, true) {
                Ok((_, merged)) => merged,
                Err(BtreeError::Retry) => {
                    self.stats.inc_retries();
                    false
                }
                Err(err) => return Err(err),
            };
        }
        self.check_collapse_root()?;
        Ok(removed)
    }

    /// One descent along `key`'s path.
    ///
    /// With `rebalance_only` nothing is removed and the pass stops after the first merge.
    /// Returns the removed value and whether a merge happened.
    fn remove_attempt(&self, key: &K, rebalance_only: bool) -> Result<(Option<V>, bool)> {
        let root_id = self.root.read();
        let cp = self.cp.read();
        let mut node = self.lock(*root_id, LockType::Read)?;
        if node.is_leaf() {
            if rebalance_only {
                return Ok((None, false));
            }
            node = node.relock_write();
            return self.remove_in_leaf(&mut node, key, &cp).map(|v| (v, false));
        }
        loop {
            let (idx, child_id) = node.child_for(key)?;
            let mut child = self.lock_child(child_id)?;
            if child.is_merge_needed(&self.cfg) {
                drop(child);
                let (mut parent, _) = self.upgrade_node(node, None)?;
                if self.try_merge(&mut parent, idx, &cp)? == MergeOutcome::Merged {
                    if rebalance_only {
                        return Ok((None, true));
                    }
                    return Err(BtreeError::Retry);
                }
                let (_, child_id) = parent.child_for(key)?;
                child = self.lock_child(child_id)?;
                node = parent;
            }
            if !child.is_leaf() {
                node = child;
                continue;
            }
            if rebalance_only {
                return Ok((None, false));
            }
            let removed = self.remove_in_leaf(&mut child, key, &cp)?;
            let mut merged = false;
            if removed.is_some() && child.is_merge_needed(&self.cfg) {
                drop(child);
                merged = self.merge_after_remove(node, idx, &cp)?;
            }
            return Ok((removed, merged));
        }
    }

    fn remove_in_leaf(
        &self,
        leaf: &mut NodeGuard<K, V>,
        key: &K,
        cp: &BtreeCp,
    ) -> Result<Option<V>> {
        let Some(old) = leaf.body_mut()?.leaf_remove(key) else {
            return Ok(None);
        };
        if let Err(err) = self.write_node(leaf, cp) {
            leaf.body_mut()?
                .leaf_put(key.clone(), old, PutType::InsertOnlyIfNotExists)?;
            return Err(err);
        }
        self.stats.add_obj_count(-1);
        Ok(Some(old))
    }

    /// Rebalances around the leaf a removal just shrank.
    ///
    /// The removal itself already succeeded, so a lost upgrade race or a failed merge only
    /// skips the rebalance.
    fn merge_after_remove(
        &self,
        parent: NodeGuard<K, V>,
        idx: usize,
        cp: &BtreeCp,
    ) -> Result<bool> {
        let mut parent = match self.upgrade_node(parent, None) {
            Ok((parent, _)) => parent,
            Err(BtreeError::Retry) => return Ok(false),
            Err(err) => return Err(err),
        };
        match self.try_merge(&mut parent, idx, cp) {
            Ok(outcome) => Ok(outcome == MergeOutcome::Merged),
            Err(err @ BtreeError::Corruption(_)) => Err(err),
            Err(err) => {
                warn!(
                    target: API_TARGET,
                    parent = parent.id().0,
                    error = %err,
                    "merge after remove failed; rebalance skipped"
                );
                Ok(false)
            }
        }
    }
}
