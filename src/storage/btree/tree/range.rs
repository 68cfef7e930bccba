use std::ops::Bound;

use tracing::trace;

use super::{Btree, NodeGuard};
use crate::primitives::concurrency::{assert_no_locks_held, LockType};
use crate::storage::btree::cp::BtreeCp;
use crate::storage::btree::key::{BtreeKey, BtreeValue, KeyRange};
use crate::storage::btree::node::BtreeNode;
use crate::types::{BtreeError, Result};

const RANGE_TARGET: &str = "latchtree::btree::range";

/// Position inside a range walk: the end bound of the last finished subrange.
///
/// Survives restarts, so a walk that hits a split resumes after the last leaf it
/// completed.
#[derive(Debug)]
pub(crate) struct RangeCursor<K> {
    last_end: Option<Bound<K>>,
}

impl<K> Default for RangeCursor<K> {
    fn default() -> Self {
        Self { last_end: None }
    }
}

impl<K: Ord + Clone> RangeCursor<K> {
    /// Part of `range` not processed yet, `None` once nothing is left.
    pub(crate) fn remaining(&self, range: &KeyRange<K>) -> Option<KeyRange<K>> {
        let start = match &self.last_end {
            None => range.start.clone(),
            Some(Bound::Included(key)) => Bound::Excluded(key.clone()),
            Some(Bound::Excluded(key)) => Bound::Included(key.clone()),
            Some(Bound::Unbounded) => return None,
        };
        let rest = KeyRange {
            start,
            end: range.end.clone(),
        };
        (!rest.is_empty()).then_some(rest)
    }

    pub(crate) fn advance(&mut self, end: Bound<K>) {
        self.last_end = Some(end);
    }
}

/// Resumable position for paging through a range with [`Btree::query_batch`].
#[derive(Clone, Debug)]
pub struct QueryCursor<K> {
    range: KeyRange<K>,
    last: Option<K>,
    done: bool,
}

impl<K: Ord + Clone> QueryCursor<K> {
    /// Cursor positioned before the first entry of `range`.
    pub fn new(range: KeyRange<K>) -> Self {
        Self {
            done: range.is_empty(),
            range,
            last: None,
        }
    }

    /// True once a page came back short.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Key of the last entry handed out.
    pub fn last_key(&self) -> Option<&K> {
        self.last.as_ref()
    }

    fn remaining(&self) -> Option<KeyRange<K>> {
        if self.done {
            return None;
        }
        let rest = match &self.last {
            None => self.range.clone(),
            Some(key) => self.range.resume_after(key),
        };
        (!rest.is_empty()).then_some(rest)
    }
}

impl<K: BtreeKey, V: BtreeValue> Btree<K, V> {
    /// Replaces the entries of `range`, leaf by leaf, with what `update` returns.
    ///
    /// `update` receives the entries of one leaf that fall inside the range together
    /// with the subrange that leaf covers, and returns their replacements. Every
    /// replacement must lie inside that subrange. Leaves already processed stay updated
    /// when a later leaf fails.
    pub fn range_update<F>(&self, range: KeyRange<K>, mut update: F) -> Result<()>
    where
        F: FnMut(&[(K, V)], &KeyRange<K>) -> Result<Vec<(K, V)>>,
    {
        self.stats.inc_range_updates();
        let mut cursor = RangeCursor::default();
        let res = self.check_poisoned().and_then(|()| {
            self.retry_loop(|| match cursor.remaining(&range) {
                None => Ok(()),
                Some(rest) => self.range_attempt(&rest, &mut cursor, &mut update),
            })
        });
        self.finish("range_update", false, res)
    }

    fn range_attempt<F>(
        &self,
        rest: &KeyRange<K>,
        cursor: &mut RangeCursor<K>,
        update: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&[(K, V)], &KeyRange<K>) -> Result<Vec<(K, V)>>,
    {
        let root_id = self.root.read();
        let cp = self.cp.read();
        let mut root = self.lock(*root_id, LockType::Read)?;
        if root.is_leaf() {
            root = root.relock_write();
        }
        if root.is_split_needed(&self.cfg) {
            drop(root);
            drop(cp);
            drop(root_id);
            self.check_split_root()?;
            return Err(BtreeError::Retry);
        }
        self.range_descend(root, rest.clone(), cursor, update, &cp)
    }

    fn range_descend<F>(
        &self,
        node: NodeGuard<K, V>,
        sub: KeyRange<K>,
        cursor: &mut RangeCursor<K>,
        update: &mut F,
        cp: &BtreeCp,
    ) -> Result<()>
    where
        F: FnMut(&[(K, V)], &KeyRange<K>) -> Result<Vec<(K, V)>>,
    {
        if node.is_leaf() {
            return self.range_update_leaf(node, &sub, cursor, update, cp);
        }
        let Some((start, end)) = node.get_all(&sub) else {
            cursor.advance(sub.end.clone());
            return Ok(());
        };
        let total = node.total_entries();
        for idx in start..=end {
            let Some(rest) = cursor.remaining(&sub) else {
                return Ok(());
            };
            let child_sub = match node.nth_key(idx) {
                Some(key) if idx < total => rest.clip_end(key),
                _ => rest,
            };
            if child_sub.is_empty() {
                cursor.advance(child_sub.end);
                continue;
            }
            let child_id = node
                .child_at(idx)
                .ok_or(BtreeError::Corruption("range span past the last child"))?;
            let child = self.lock_child(child_id)?;
            if child.is_split_needed(&self.cfg) {
                if node.is_split_needed(&self.cfg) {
                    return Err(BtreeError::Retry);
                }
                let (mut parent, child) = self.upgrade_node(node, Some(child))?;
                let mut child =
                    child.ok_or(BtreeError::Corruption("upgrade dropped the child latch"))?;
                self.split_node(&mut parent, &mut child, idx, cp)?;
                return Err(BtreeError::Retry);
            }
            if idx == end {
                drop(node);
                return self.range_descend(child, child_sub, cursor, update, cp);
            }
            self.range_descend(child, child_sub, cursor, update, cp)?;
        }
        Ok(())
    }

    fn range_update_leaf<F>(
        &self,
        mut leaf: NodeGuard<K, V>,
        sub: &KeyRange<K>,
        cursor: &mut RangeCursor<K>,
        update: &mut F,
        cp: &BtreeCp,
    ) -> Result<()>
    where
        F: FnMut(&[(K, V)], &KeyRange<K>) -> Result<Vec<(K, V)>>,
    {
        let span = leaf.get_all(sub);
        let matched: &[(K, V)] = match span {
            Some((start, end)) => &leaf.leaf_entries()[start..=end],
            None => &[],
        };
        let matched_len = matched.len();
        let replacements = update(matched, sub)?;
        for (key, value) in &replacements {
            if !sub.contains(key) {
                return Err(BtreeError::Invalid(
                    "range update replacement outside its subrange",
                ));
            }
            self.validate_entry(key, value)?;
        }

        let backup = BtreeNode::clone(&leaf);
        let delta = leaf.body_mut()?.leaf_replace(span, replacements)?;
        if leaf.occupied_size() > self.cfg.node_area_size {
            *leaf.body_mut()? = backup;
            return Err(BtreeError::Invalid("range update replacements overflow the leaf"));
        }
        if let Err(err) = self.write_node(&mut leaf, cp) {
            *leaf.body_mut()? = backup;
            return Err(err);
        }
        self.stats.add_obj_count(delta);
        cursor.advance(sub.end.clone());
        trace!(
            target: RANGE_TARGET,
            leaf = leaf.id().0,
            matched = matched_len,
            delta,
            "leaf range updated"
        );
        Ok(())
    }

    /// Entries inside `range` in key order, at most `limit` of them.
    ///
    /// Each leaf is reached by a fresh descent from the root, so the result is not a
    /// snapshot when writers run concurrently.
    pub fn query(&self, range: KeyRange<K>, limit: Option<usize>) -> Result<Vec<(K, V)>> {
        let res = self.query_inner(&range, limit);
        self.finish("query", true, res)
    }

    /// Next page of at most `batch_size` entries after `cursor`'s position.
    ///
    /// A short page means the range is exhausted and the cursor reports
    /// [`QueryCursor::is_done`]. Entries inserted behind the cursor are not revisited.
    pub fn query_batch(
        &self,
        cursor: &mut QueryCursor<K>,
        batch_size: usize,
    ) -> Result<Vec<(K, V)>> {
        let res = if batch_size == 0 {
            Err(BtreeError::Invalid("query batch size must be non-zero"))
        } else {
            match cursor.remaining() {
                Some(rest) => self.query_inner(&rest, Some(batch_size)),
                None => Ok(Vec::new()),
            }
        };
        let page = self.finish("query_batch", true, res)?;
        if page.len() < batch_size {
            cursor.done = true;
        }
        if let Some((key, _)) = page.last() {
            cursor.last = Some(key.clone());
        }
        Ok(page)
    }

    /// First entry inside `range`, reached by descending on the range start.
    pub fn get_any(&self, range: &KeyRange<K>) -> Result<Option<(K, V)>> {
        assert_no_locks_held();
        self.stats.inc_gets();
        let res = self.query_inner(range, Some(1)).map(|mut hits| hits.pop());
        self.finish("get_any", true, res)
    }

    /// Removes the first entry inside `range` and returns it.
    pub fn remove_any(&self, range: &KeyRange<K>) -> Result<Option<(K, V)>> {
        assert_no_locks_held();
        self.stats.inc_removes();
        let res = self.check_poisoned().and_then(|()| self.remove_first_in(range));
        self.finish("remove_any", false, res)
    }

    fn remove_first_in(&self, range: &KeyRange<K>) -> Result<Option<(K, V)>> {
        loop {
            let Some((key, _)) = self.query_inner(range, Some(1))?.pop() else {
                return Ok(None);
            };
            // The key can be taken by another remover between lookup and removal.
            if let Some(value) = self.remove_internal(&key)? {
                return Ok(Some((key, value)));
            }
            self.stats.inc_retries();
            trace!(target: RANGE_TARGET, "first key of range vanished; looking again");
        }
    }

    fn query_inner(&self, range: &KeyRange<K>, limit: Option<usize>) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        let mut cursor = RangeCursor::default();
        while let Some(rest) = cursor.remaining(range) {
            if limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            match self.query_leaf(&rest, limit, &mut out)? {
                Some(bound) => cursor.advance(Bound::Included(bound)),
                None => break,
            }
        }
        Ok(out)
    }

    /// Collects the matches of the leaf holding `rest.start`; returns that leaf's
    /// upper bound, or `None` for the rightmost leaf.
    fn query_leaf(
        &self,
        rest: &KeyRange<K>,
        limit: Option<usize>,
        out: &mut Vec<(K, V)>,
    ) -> Result<Option<K>> {
        let root_id = self.root.read();
        let mut node = self.lock(*root_id, LockType::Read)?;
        let mut bound: Option<K> = None;
        while !node.is_leaf() {
            let idx = node.route_start(&rest.start);
            if idx < node.total_entries() {
                bound = node.nth_key(idx).cloned();
            }
            let child_id = node
                .child_at(idx)
                .ok_or(BtreeError::Corruption("query routed past the last child"))?;
            node = self.lock(child_id, LockType::Read)?;
        }
        for (key, value) in node.leaf_entries() {
            if limit.is_some_and(|limit| out.len() >= limit) || rest.is_past_end(key) {
                break;
            }
            if rest.contains(key) {
                out.push((key.clone(), value.clone()));
            }
        }
        Ok(bound)
    }
}
