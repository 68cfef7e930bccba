use std::fmt;
use std::ops::Bound;

use super::config::{BtreeConfig, CHILD_PTR_SIZE};
use super::key::{BtreeKey, BtreeValue, KeyRange, PutType, SplitKeyFn};
use crate::types::{BtreeError, CpId, Gen, NodeId, Result};

const NODE_IMAGE_MAGIC: [u8; 4] = *b"LTN1";
const NODE_IMAGE_HDR_LEN: usize = 4 + 8 + 8 + 1 + 8 + 8 + 8 + 4;
const FLAG_LEAF: u8 = 0b01;
const FLAG_VALID: u8 = 0b10;

/// Entries held by a node.
#[derive(Clone, Debug)]
pub enum NodeBody<K, V> {
    /// Sorted key/value pairs.
    Leaf(Vec<(K, V)>),
    /// Sorted routing keys with the child each one bounds, plus the optional edge child.
    Interior {
        /// `(upper bound key, child)` pairs.
        entries: Vec<(K, NodeId)>,
        /// Rightmost child, covering everything past the last key.
        edge: Option<NodeId>,
    },
}

/// In-memory form of a tree node.
#[derive(Clone, Debug)]
pub struct BtreeNode<K, V> {
    id: NodeId,
    gen: Gen,
    valid: bool,
    next: Option<NodeId>,
    last_cp: CpId,
    body: NodeBody<K, V>,
}

/// Result of a leaf put.
#[derive(Debug)]
pub struct LeafPut<V> {
    /// Whether a new entry was created.
    pub inserted: bool,
    /// Value present before the put, if any.
    pub existing: Option<V>,
}

impl<K: BtreeKey, V: BtreeValue> BtreeNode<K, V> {
    /// Empty leaf.
    pub fn new_leaf(id: NodeId) -> Self {
        Self::with_body(id, NodeBody::Leaf(Vec::new()))
    }

    /// Empty interior node without an edge.
    pub fn new_interior(id: NodeId) -> Self {
        Self::with_body(
            id,
            NodeBody::Interior {
                entries: Vec::new(),
                edge: None,
            },
        )
    }

    fn with_body(id: NodeId, body: NodeBody<K, V>) -> Self {
        Self {
            id,
            gen: Gen::default(),
            valid: true,
            next: None,
            last_cp: CpId::default(),
            body,
        }
    }

    /// Node identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current generation.
    pub fn gen(&self) -> Gen {
        self.gen
    }

    pub(crate) fn set_gen(&mut self, gen: Gen) {
        self.gen = gen;
    }

    /// False once the node has been freed by a merge or collapse.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Next sibling on the same level.
    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Option<NodeId>) {
        self.next = next;
    }

    /// Checkpoint of the last durable write.
    pub fn last_cp(&self) -> CpId {
        self.last_cp
    }

    pub(crate) fn set_last_cp(&mut self, cp: CpId) {
        self.last_cp = cp;
    }

    /// Borrow the raw entries.
    pub fn body(&self) -> &NodeBody<K, V> {
        &self.body
    }

    /// True for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    /// Number of keyed entries (the edge is not counted).
    pub fn total_entries(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(entries) => entries.len(),
            NodeBody::Interior { entries, .. } => entries.len(),
        }
    }

    /// True for interior nodes with an edge child.
    pub fn has_valid_edge(&self) -> bool {
        matches!(self.body, NodeBody::Interior { edge: Some(_), .. })
    }

    /// Edge child, if any.
    pub fn edge_id(&self) -> Option<NodeId> {
        match &self.body {
            NodeBody::Interior { edge, .. } => *edge,
            NodeBody::Leaf(_) => None,
        }
    }

    pub(crate) fn set_edge(&mut self, new_edge: Option<NodeId>) -> Result<()> {
        match &mut self.body {
            NodeBody::Interior { edge, .. } => {
                *edge = new_edge;
                Ok(())
            }
            NodeBody::Leaf(_) => Err(BtreeError::Corruption("edge set on a leaf")),
        }
    }

    /// Leaf entries; empty for interior nodes.
    pub fn leaf_entries(&self) -> &[(K, V)] {
        match &self.body {
            NodeBody::Leaf(entries) => entries,
            NodeBody::Interior { .. } => &[],
        }
    }

    /// Interior entries; empty for leaves.
    pub fn interior_entries(&self) -> &[(K, NodeId)] {
        match &self.body {
            NodeBody::Interior { entries, .. } => entries,
            NodeBody::Leaf(_) => &[],
        }
    }

    /// Key at `idx`.
    pub fn nth_key(&self, idx: usize) -> Option<&K> {
        match &self.body {
            NodeBody::Leaf(entries) => entries.get(idx).map(|(k, _)| k),
            NodeBody::Interior { entries, .. } => entries.get(idx).map(|(k, _)| k),
        }
    }

    /// Last keyed entry's key.
    pub fn last_key(&self) -> Option<&K> {
        self.total_entries()
            .checked_sub(1)
            .and_then(|idx| self.nth_key(idx))
    }

    /// Child at `idx`; `idx == total_entries()` addresses the edge.
    pub fn child_at(&self, idx: usize) -> Option<NodeId> {
        match &self.body {
            NodeBody::Interior { entries, edge } => {
                if idx == entries.len() {
                    *edge
                } else {
                    entries.get(idx).map(|(_, child)| *child)
                }
            }
            NodeBody::Leaf(_) => None,
        }
    }

    /// Index of the last addressable child.
    pub fn last_child_index(&self) -> Option<usize> {
        if self.has_valid_edge() {
            Some(self.total_entries())
        } else {
            self.total_entries().checked_sub(1)
        }
    }

    fn entry_size(&self, idx: usize) -> usize {
        match &self.body {
            NodeBody::Leaf(entries) => entries
                .get(idx)
                .map(|(k, v)| k.serialized_size() + v.serialized_size())
                .unwrap_or(0),
            NodeBody::Interior { entries, .. } => entries
                .get(idx)
                .map(|(k, _)| k.serialized_size() + CHILD_PTR_SIZE)
                .unwrap_or(0),
        }
    }

    /// Bytes consumed by entries.
    pub fn occupied_size(&self) -> usize {
        (0..self.total_entries()).map(|idx| self.entry_size(idx)).sum()
    }

    /// Bytes still free in the node area.
    pub fn available_size(&self, cfg: &BtreeConfig) -> usize {
        cfg.node_area_size.saturating_sub(self.occupied_size())
    }

    /// True when one more maximal entry might not fit.
    pub fn is_split_needed(&self, cfg: &BtreeConfig) -> bool {
        let room = if self.is_leaf() {
            cfg.max_leaf_entry_size()
        } else {
            cfg.max_interior_entry_size()
        };
        self.available_size(cfg) < room
    }

    /// True when occupancy fell under the merge threshold.
    pub fn is_merge_needed(&self, cfg: &BtreeConfig) -> bool {
        self.occupied_size() < cfg.merge_threshold()
    }

    /// `(found, index)` where index is the first entry whose key is `>= key`.
    pub fn find(&self, key: &K) -> (bool, usize) {
        let search = |candidate: &K| candidate.cmp(key);
        let result = match &self.body {
            NodeBody::Leaf(entries) => entries.binary_search_by(|(k, _)| search(k)),
            NodeBody::Interior { entries, .. } => entries.binary_search_by(|(k, _)| search(k)),
        };
        match result {
            Ok(idx) => (true, idx),
            Err(idx) => (false, idx),
        }
    }

    /// Child routing `key`: the first entry bounding it, else the edge.
    pub fn child_for(&self, key: &K) -> Result<(usize, NodeId)> {
        let (_, idx) = self.find(key);
        match self.child_at(idx) {
            Some(child) => Ok((idx, child)),
            None => Err(BtreeError::Corruption(
                "key routes past the last child of an interior node",
            )),
        }
    }

    /// Index of the first child that can hold keys at or after `start`.
    pub fn route_start(&self, start: &Bound<K>) -> usize {
        let entries = self.interior_entries();
        match start {
            Bound::Unbounded => 0,
            Bound::Included(s) => entries.partition_point(|(k, _)| k < s),
            Bound::Excluded(s) => entries.partition_point(|(k, _)| k <= s),
        }
    }

    /// Value stored under `key` in a leaf.
    pub fn leaf_get(&self, key: &K) -> Option<&V> {
        match &self.body {
            NodeBody::Leaf(entries) => entries
                .binary_search_by(|(k, _)| k.cmp(key))
                .ok()
                .map(|idx| &entries[idx].1),
            NodeBody::Interior { .. } => None,
        }
    }

    /// Inclusive index span of entries (leaf) or children (interior) touching `range`.
    pub fn get_all(&self, range: &KeyRange<K>) -> Option<(usize, usize)> {
        if range.is_empty() {
            return None;
        }
        match &self.body {
            NodeBody::Leaf(entries) => {
                let start = entries.partition_point(|(k, _)| range.is_before_start(k));
                let end = entries.partition_point(|(k, _)| !range.is_past_end(k));
                if start >= end {
                    None
                } else {
                    Some((start, end - 1))
                }
            }
            NodeBody::Interior { entries, edge } => {
                let start = entries.partition_point(|(k, _)| range.is_before_start(k));
                let end = entries.partition_point(|(k, _)| match &range.end {
                    std::ops::Bound::Unbounded => true,
                    std::ops::Bound::Included(e) | std::ops::Bound::Excluded(e) => k < e,
                });
                let last = if edge.is_some() {
                    entries.len()
                } else if entries.is_empty() {
                    return None;
                } else {
                    entries.len() - 1
                };
                if start > last {
                    return None;
                }
                Some((start, end.min(last)))
            }
        }
    }

    /// Applies a point put under `put_type`.
    pub fn leaf_put(&mut self, key: K, value: V, put_type: PutType) -> Result<LeafPut<V>> {
        let entries = match &mut self.body {
            NodeBody::Leaf(entries) => entries,
            NodeBody::Interior { .. } => return Err(BtreeError::Corruption("put on interior")),
        };
        let found = entries.binary_search_by(|(k, _)| k.cmp(&key));
        match (put_type, found) {
            (PutType::InsertOnlyIfNotExists, Ok(_))
            | (PutType::ReplaceOnlyIfExists, Err(_))
            | (PutType::AppendOnlyIfExists, Err(_)) => Err(BtreeError::PutFailed),
            (_, Err(idx)) => {
                entries.insert(idx, (key, value));
                Ok(LeafPut {
                    inserted: true,
                    existing: None,
                })
            }
            (PutType::ReplaceOnlyIfExists, Ok(idx))
            | (PutType::ReplaceIfExistsElseInsert, Ok(idx)) => {
                let old = std::mem::replace(&mut entries[idx].1, value);
                Ok(LeafPut {
                    inserted: false,
                    existing: Some(old),
                })
            }
            (PutType::AppendOnlyIfExists, Ok(idx))
            | (PutType::AppendIfExistsElseInsert, Ok(idx)) => {
                let old = entries[idx].1.clone();
                entries[idx].1.append(&value);
                Ok(LeafPut {
                    inserted: false,
                    existing: Some(old),
                })
            }
        }
    }

    /// Removes the exact match for `key`.
    pub fn leaf_remove(&mut self, key: &K) -> Option<V> {
        match &mut self.body {
            NodeBody::Leaf(entries) => entries
                .binary_search_by(|(k, _)| k.cmp(key))
                .ok()
                .map(|idx| entries.remove(idx).1),
            NodeBody::Interior { .. } => None,
        }
    }

    /// Drops the keyed entries `start..=end`.
    pub(crate) fn remove_range(&mut self, start: usize, end: usize) -> Result<()> {
        if start > end || end >= self.total_entries() {
            return Err(BtreeError::Corruption("remove range out of bounds"));
        }
        match &mut self.body {
            NodeBody::Leaf(entries) => {
                entries.drain(start..=end);
            }
            NodeBody::Interior { entries, .. } => {
                entries.drain(start..=end);
            }
        }
        Ok(())
    }

    /// Replaces the entries in `span` with `replacements`; returns the count delta.
    pub fn leaf_replace(
        &mut self,
        span: Option<(usize, usize)>,
        replacements: Vec<(K, V)>,
    ) -> Result<i64> {
        let entries = match &mut self.body {
            NodeBody::Leaf(entries) => entries,
            NodeBody::Interior { .. } => {
                return Err(BtreeError::Corruption("range update on interior"))
            }
        };
        let before = entries.len() as i64;
        if let Some((start, end)) = span {
            if end >= entries.len() || start > end {
                return Err(BtreeError::Corruption("range update span out of bounds"));
            }
            entries.drain(start..=end);
        }
        for (key, value) in replacements {
            match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(idx) => entries[idx].1 = value,
                Err(idx) => entries.insert(idx, (key, value)),
            }
        }
        Ok(entries.len() as i64 - before)
    }

    /// Inserts a routing entry at `idx`.
    pub(crate) fn insert(&mut self, idx: usize, key: K, child: NodeId) -> Result<()> {
        match &mut self.body {
            NodeBody::Interior { entries, .. } if idx <= entries.len() => {
                entries.insert(idx, (key, child));
                Ok(())
            }
            _ => Err(BtreeError::Corruption("bad interior insert")),
        }
    }

    /// Points the slot at `idx` (or the edge) at `child`, keeping its key.
    pub(crate) fn update_child(&mut self, idx: usize, child: NodeId) -> Result<()> {
        match &mut self.body {
            NodeBody::Interior { entries, edge } => {
                if idx == entries.len() {
                    *edge = Some(child);
                    Ok(())
                } else if let Some(slot) = entries.get_mut(idx) {
                    slot.1 = child;
                    Ok(())
                } else {
                    Err(BtreeError::Corruption("child index out of range"))
                }
            }
            NodeBody::Leaf(_) => Err(BtreeError::Corruption("child update on leaf")),
        }
    }

    /// Replaces the children `start..=end` with `survivors`.
    ///
    /// When `end` addresses the edge, the last survivor (key `None`) becomes the edge and
    /// every other survivor must carry a key.
    pub(crate) fn replace_children(
        &mut self,
        start: usize,
        end: usize,
        survivors: &[(Option<K>, NodeId)],
    ) -> Result<()> {
        let (entries, edge) = match &mut self.body {
            NodeBody::Interior { entries, edge } => (entries, edge),
            NodeBody::Leaf(_) => return Err(BtreeError::Corruption("child splice on leaf")),
        };
        let covers_edge = end == entries.len();
        if start > end || (!covers_edge && end >= entries.len()) || survivors.is_empty() {
            return Err(BtreeError::Corruption("bad child splice span"));
        }
        let (keyed, tail) = if covers_edge {
            let (last, keyed) = survivors
                .split_last()
                .ok_or(BtreeError::Corruption("bad child splice span"))?;
            (keyed, Some(last))
        } else {
            (survivors, None)
        };
        let mut replacement = Vec::with_capacity(keyed.len());
        for (key, child) in keyed {
            let key = key
                .clone()
                .ok_or(BtreeError::Corruption("keyless survivor outside the edge slot"))?;
            replacement.push((key, *child));
        }
        let drain_end = if covers_edge { entries.len() } else { end + 1 };
        entries.splice(start..drain_end, replacement);
        if let Some((_, child)) = tail {
            *edge = Some(*child);
        }
        Ok(())
    }

    fn remaining_prefix_by_size(sizes: impl Iterator<Item = usize>, size: usize) -> usize {
        let mut acc = 0;
        let mut count = 0;
        for sz in sizes {
            if acc + sz > size {
                break;
            }
            acc += sz;
            count += 1;
        }
        count
    }

    /// Moves up to `size` bytes of trailing entries into the empty node `other`.
    ///
    /// The edge of an interior node moves with them. Returns the number of entries moved.
    pub fn move_out_to_right_by_size(&mut self, other: &mut Self, size: usize) -> Result<usize> {
        let total = self.total_entries();
        let count = Self::remaining_prefix_by_size(
            (0..total).rev().map(|idx| self.entry_size(idx)),
            size,
        )
        .max(1)
        .min(total.saturating_sub(1));
        self.move_out_entries(other, total - count)?;
        Ok(count)
    }

    /// Moves every entry from `idx` on (and the edge) into the empty node `other`.
    pub(crate) fn move_out_entries(&mut self, other: &mut Self, idx: usize) -> Result<()> {
        match (&mut self.body, &mut other.body) {
            (NodeBody::Leaf(mine), NodeBody::Leaf(theirs)) if theirs.is_empty() => {
                let tail = mine.split_off(idx.min(mine.len()));
                *theirs = tail;
                Ok(())
            }
            (
                NodeBody::Interior { entries, edge },
                NodeBody::Interior {
                    entries: other_entries,
                    edge: other_edge,
                },
            ) if other_entries.is_empty() && other_edge.is_none() => {
                let tail = entries.split_off(idx.min(entries.len()));
                *other_entries = tail;
                *other_edge = edge.take();
                Ok(())
            }
            _ => Err(BtreeError::Corruption("move out between mismatched nodes")),
        }
    }

    /// Pulls up to `size` bytes of leading entries from `other`.
    ///
    /// An interior `other` left without entries hands over its edge. Returns the number of
    /// entries (plus one for a moved edge) that changed node.
    pub fn move_in_from_right_by_size(&mut self, other: &mut Self, size: usize) -> Result<usize> {
        let count =
            Self::remaining_prefix_by_size((0..other.total_entries()).map(|i| other.entry_size(i)), size);
        match (&mut self.body, &mut other.body) {
            (NodeBody::Leaf(mine), NodeBody::Leaf(theirs)) => {
                mine.extend(theirs.drain(..count));
                Ok(count)
            }
            (
                NodeBody::Interior { entries, edge },
                NodeBody::Interior {
                    entries: other_entries,
                    edge: other_edge,
                },
            ) => {
                entries.extend(other_entries.drain(..count));
                let mut moved = count;
                if other_entries.is_empty() {
                    if let Some(other_edge_id) = other_edge.take() {
                        if edge.is_some() {
                            return Err(BtreeError::Corruption(
                                "merge target already owns an edge",
                            ));
                        }
                        *edge = Some(other_edge_id);
                        moved += 1;
                    }
                }
                Ok(moved)
            }
            _ => Err(BtreeError::Corruption("move in between mismatched nodes")),
        }
    }

    /// True when the node holds neither entries nor an edge.
    pub fn is_empty(&self) -> bool {
        self.total_entries() == 0 && !self.has_valid_edge()
    }

    /// Exchanges the contents of two nodes; ids and generations stay where they were.
    pub fn swap_contents(a: &mut Self, b: &mut Self) {
        std::mem::swap(&mut a.body, &mut b.body);
        std::mem::swap(&mut a.next, &mut b.next);
    }

    /// Copies `other`'s contents (entries, edge, next) into `self`.
    pub(crate) fn copy_contents_from(&mut self, other: &Self) {
        self.body = other.body.clone();
        self.next = other.next;
    }

    /// Turns the node into an empty node of the requested kind.
    pub(crate) fn reset(&mut self, is_leaf: bool) {
        self.body = if is_leaf {
            NodeBody::Leaf(Vec::new())
        } else {
            NodeBody::Interior {
                entries: Vec::new(),
                edge: None,
            }
        };
        self.next = None;
    }

    /// Splits a straddling leaf entry at `idx` in two via `divide`.
    pub(crate) fn divide_leaf_entry<F>(&mut self, idx: usize, divide: F) -> Result<()>
    where
        F: FnOnce(&K, &V) -> Result<((K, V), (K, V))>,
    {
        let entries = match &mut self.body {
            NodeBody::Leaf(entries) => entries,
            NodeBody::Interior { .. } => return Err(BtreeError::Corruption("divide on interior")),
        };
        let (key, value) = entries
            .get(idx)
            .ok_or(BtreeError::Corruption("divide index out of range"))?;
        let (left, right) = divide(key, value)?;
        entries[idx] = left;
        entries.insert(idx + 1, right);
        Ok(())
    }

    /// Moves every entry above `split_key` (and the edge) into the empty node `other`.
    ///
    /// A leaf entry straddling `split_key` is cut in two with `divide` first.
    pub(crate) fn split_after_key(
        &mut self,
        other: &mut Self,
        split_key: &K,
        divide: Option<&SplitKeyFn<K, V>>,
    ) -> Result<()> {
        let at = match &self.body {
            NodeBody::Leaf(entries) => entries.partition_point(|(k, _)| k <= split_key),
            NodeBody::Interior { entries, .. } => entries.partition_point(|(k, _)| k <= split_key),
        };
        let straddling = at
            .checked_sub(1)
            .and_then(|idx| self.leaf_entries().get(idx))
            .is_some_and(|(key, _)| key.straddles(split_key));
        let at = if straddling {
            let divide =
                divide.ok_or(BtreeError::Corruption("straddling entry without a divider"))?;
            self.divide_leaf_entry(at - 1, |key, value| divide(key, value, split_key))?;
            at
        } else {
            at
        };
        self.move_out_entries(other, at)
    }

    /// True when keys are strictly increasing.
    pub fn is_sorted(&self) -> bool {
        let keys: Vec<&K> = (0..self.total_entries()).filter_map(|i| self.nth_key(i)).collect();
        keys.windows(2).all(|pair| pair[0] < pair[1])
    }

    /// Serializes the node into a checksummed image.
    pub fn encode_image(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NODE_IMAGE_HDR_LEN + self.occupied_size() * 2);
        buf.extend_from_slice(&NODE_IMAGE_MAGIC);
        buf.extend_from_slice(&self.id.0.to_be_bytes());
        buf.extend_from_slice(&self.gen.0.to_be_bytes());
        let mut flags = 0u8;
        if self.is_leaf() {
            flags |= FLAG_LEAF;
        }
        if self.valid {
            flags |= FLAG_VALID;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.next.map_or(0, |id| id.0).to_be_bytes());
        buf.extend_from_slice(&self.edge_id().map_or(0, |id| id.0).to_be_bytes());
        buf.extend_from_slice(&self.last_cp.0.to_be_bytes());
        buf.extend_from_slice(&(self.total_entries() as u32).to_be_bytes());
        let mut scratch = Vec::new();
        match &self.body {
            NodeBody::Leaf(entries) => {
                for (key, value) in entries {
                    put_blob(&mut buf, &mut scratch, |out| key.encode(out));
                    put_blob(&mut buf, &mut scratch, |out| value.encode(out));
                }
            }
            NodeBody::Interior { entries, .. } => {
                for (key, child) in entries {
                    put_blob(&mut buf, &mut scratch, |out| key.encode(out));
                    buf.extend_from_slice(&child.0.to_be_bytes());
                }
            }
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses an image written by [`BtreeNode::encode_image`].
    pub fn decode_image(src: &[u8]) -> Result<Self> {
        if src.len() < NODE_IMAGE_HDR_LEN + 4 {
            return Err(BtreeError::Corruption("node image truncated"));
        }
        let (body_bytes, crc_bytes) = src.split_at(src.len() - 4);
        let stored_crc = read_u32(crc_bytes, 0)?;
        if crc32fast::hash(body_bytes) != stored_crc {
            return Err(BtreeError::Corruption("node image crc mismatch"));
        }
        if body_bytes[0..4] != NODE_IMAGE_MAGIC {
            return Err(BtreeError::Corruption("node image magic mismatch"));
        }
        let id = NodeId(read_u64(body_bytes, 4)?);
        let gen = Gen(read_u64(body_bytes, 12)?);
        let flags = body_bytes[20];
        let next = read_u64(body_bytes, 21)?;
        let edge = read_u64(body_bytes, 29)?;
        let last_cp = CpId(read_u64(body_bytes, 37)?);
        let count = read_u32(body_bytes, 45)? as usize;
        let mut pos = NODE_IMAGE_HDR_LEN;
        let body = if flags & FLAG_LEAF != 0 {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = K::decode(take_blob(body_bytes, &mut pos)?)?;
                let value = V::decode(take_blob(body_bytes, &mut pos)?)?;
                entries.push((key, value));
            }
            NodeBody::Leaf(entries)
        } else {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = K::decode(take_blob(body_bytes, &mut pos)?)?;
                let child = NodeId(read_u64(body_bytes, pos)?);
                pos += 8;
                entries.push((key, child));
            }
            NodeBody::Interior {
                entries,
                edge: (edge != 0).then_some(NodeId(edge)),
            }
        };
        if pos != body_bytes.len() {
            return Err(BtreeError::Corruption("node image trailing bytes"));
        }
        Ok(Self {
            id,
            gen,
            valid: flags & FLAG_VALID != 0,
            next: (next != 0).then_some(NodeId(next)),
            last_cp,
            body,
        })
    }
}

fn put_blob(buf: &mut Vec<u8>, scratch: &mut Vec<u8>, encode: impl FnOnce(&mut Vec<u8>)) {
    scratch.clear();
    encode(scratch);
    buf.extend_from_slice(&(scratch.len() as u32).to_be_bytes());
    buf.extend_from_slice(scratch);
}

fn take_blob<'a>(src: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32(src, *pos)? as usize;
    let start = *pos + 4;
    let end = start + len;
    if end > src.len() {
        return Err(BtreeError::Corruption("node image blob truncated"));
    }
    *pos = end;
    Ok(&src[start..end])
}

pub(crate) fn read_u64(src: &[u8], at: usize) -> Result<u64> {
    src.get(at..at + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or(BtreeError::Corruption("truncated u64"))
}

pub(crate) fn read_u32(src: &[u8], at: usize) -> Result<u32> {
    src.get(at..at + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(BtreeError::Corruption("truncated u32"))
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Display for BtreeNode<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            NodeBody::Leaf(entries) => {
                write!(f, "id={} {} LEAF n={}", self.id, self.gen, entries.len())?;
                for (key, value) in entries {
                    write!(f, " [{key:?}={value:?}]")?;
                }
            }
            NodeBody::Interior { entries, edge } => {
                write!(f, "id={} {} INTERIOR n={}", self.id, self.gen, entries.len())?;
                for (key, child) in entries {
                    write!(f, " [{key:?}->{child}]")?;
                }
                if let Some(edge) = edge {
                    write!(f, " edge={edge}")?;
                }
            }
        }
        if let Some(next) = self.next {
            write!(f, " next={next}")?;
        }
        Ok(())
    }
}
