use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::cp::BtreeCp;
use super::key::{BtreeKey, BtreeValue};
use super::node::{read_u32, read_u64, BtreeNode};
use crate::primitives::concurrency::Latch;
use crate::primitives::journal::JournalEntry;
use crate::types::{BtreeError, CpId, NodeId, Result};

const IMAGE_MAGIC: [u8; 4] = *b"LTI1";
const IMAGE_FORMAT_VERSION: u16 = 1;
const IMAGE_HEADER_LEN: usize = 4 + 2 + 8 + 8 + 8;

/// Shared, latched handle to a node owned by a store.
pub type NodePtr<K, V> = Latch<BtreeNode<K, V>>;

/// When a freed node's storage is released.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FreeMode {
    /// On the next checkpoint flush; the durable copy stays readable until then.
    Deferred,
    /// Right away; for nodes that never became reachable.
    Immediate,
}

/// Allocation, durable writes and journal persistence for tree nodes.
pub trait NodeStore<K: BtreeKey, V: BtreeValue>: Send + Sync {
    /// Allocates a fresh, empty node at generation zero.
    fn alloc_node(&self, is_leaf: bool) -> Result<(NodeId, NodePtr<K, V>)>;

    /// Returns the node stored under `id`, creating an empty one when absent.
    ///
    /// Journal replay uses this to recreate nodes a crash lost.
    fn reserve_node(&self, id: NodeId, is_leaf: bool) -> Result<NodePtr<K, V>>;

    /// Returns the node stored under `id`.
    fn read_node(&self, id: NodeId) -> Result<NodePtr<K, V>>;

    /// Durably writes `node` and advances its generation.
    fn write_node(&self, node: &mut BtreeNode<K, V>, cp: &BtreeCp) -> Result<()>;

    /// Frees `id`.
    fn free_node(&self, id: NodeId, cp: &BtreeCp, mode: FreeMode) -> Result<()>;

    /// Durably appends a journal entry.
    fn write_journal_entry(&self, entry: &JournalEntry) -> Result<()>;

    /// Journal entries written since the last flush, oldest first.
    fn journal_entries(&self) -> Result<Vec<JournalEntry>>;

    /// Applies `cp`'s deferred frees and truncates the journal.
    fn cp_flush(&self, cp: &BtreeCp) -> Result<()>;

    /// Id of the newest flushed checkpoint.
    fn last_flushed_cp(&self) -> CpId;

    /// Root id, once one has been recorded.
    fn root_id(&self) -> Option<NodeId>;

    /// Records the root id.
    fn set_root_id(&self, id: NodeId) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
struct DurableImage {
    nodes: BTreeMap<NodeId, Vec<u8>>,
    journal: Vec<Vec<u8>>,
    root: Option<NodeId>,
    next_id: u64,
    flushed_cp: CpId,
}

impl DurableImage {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&IMAGE_MAGIC);
        buf.extend_from_slice(&IMAGE_FORMAT_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.root.map_or(0, |id| id.0).to_be_bytes());
        buf.extend_from_slice(&self.next_id.to_be_bytes());
        buf.extend_from_slice(&self.flushed_cp.0.to_be_bytes());
        buf.extend_from_slice(&(self.nodes.len() as u32).to_be_bytes());
        for (id, image) in &self.nodes {
            buf.extend_from_slice(&id.0.to_be_bytes());
            buf.extend_from_slice(&(image.len() as u32).to_be_bytes());
            buf.extend_from_slice(image);
        }
        buf.extend_from_slice(&(self.journal.len() as u32).to_be_bytes());
        for frame in &self.journal {
            buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            buf.extend_from_slice(frame);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < IMAGE_HEADER_LEN + 4 {
            return Err(BtreeError::Corruption("store image truncated"));
        }
        let (body, crc_bytes) = src.split_at(src.len() - 4);
        if crc32fast::hash(body) != read_u32(crc_bytes, 0)? {
            return Err(BtreeError::Corruption("store image crc mismatch"));
        }
        if body[0..4] != IMAGE_MAGIC {
            return Err(BtreeError::Corruption("store image magic mismatch"));
        }
        if u16::from_be_bytes([body[4], body[5]]) != IMAGE_FORMAT_VERSION {
            return Err(BtreeError::Corruption("store image version mismatch"));
        }
        let root = read_u64(body, 6)?;
        let next_id = read_u64(body, 14)?;
        let flushed_cp = CpId(read_u64(body, 22)?);
        let mut pos = IMAGE_HEADER_LEN;
        let take = |pos: &mut usize| -> Result<Vec<u8>> {
            let len = read_u32(body, *pos)? as usize;
            let start = *pos + 4;
            let bytes = body
                .get(start..start + len)
                .ok_or(BtreeError::Corruption("store image record truncated"))?;
            *pos = start + len;
            Ok(bytes.to_vec())
        };
        let node_count = read_u32(body, pos)?;
        pos += 4;
        let mut nodes = BTreeMap::new();
        for _ in 0..node_count {
            let id = NodeId(read_u64(body, pos)?);
            pos += 8;
            nodes.insert(id, take(&mut pos)?);
        }
        let journal_count = read_u32(body, pos)?;
        pos += 4;
        let mut journal = Vec::with_capacity(journal_count as usize);
        for _ in 0..journal_count {
            journal.push(take(&mut pos)?);
        }
        if pos != body.len() {
            return Err(BtreeError::Corruption("store image trailing bytes"));
        }
        Ok(Self {
            nodes,
            journal,
            root: (root != 0).then_some(NodeId(root)),
            next_id,
            flushed_cp,
        })
    }
}

struct StoreState<K, V> {
    live: HashMap<NodeId, NodePtr<K, V>>,
    image: DurableImage,
    next_id: u64,
    root: Option<NodeId>,
    write_budget: Option<u64>,
    frozen: bool,
    capacity: Option<usize>,
}

impl<K, V> StoreState<K, V> {
    fn from_image(image: DurableImage) -> Self {
        Self {
            live: HashMap::new(),
            next_id: image.next_id.max(1),
            root: image.root,
            image,
            write_budget: None,
            frozen: false,
            capacity: None,
        }
    }

    /// Consumes one unit of durable write budget.
    fn persist(&mut self) -> bool {
        match &mut self.write_budget {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }

    fn bump_next_id(&mut self, past: NodeId) {
        self.next_id = self.next_id.max(past.0 + 1);
        self.image.next_id = self.next_id;
    }
}

/// In-memory [`NodeStore`] that keeps a separate durable image.
///
/// The image only sees writes that were "persisted". A write budget cuts persistence
/// off mid-sequence and [`MemNodeStore::crash`] throws the live state away, which is
/// how recovery is exercised.
pub struct MemNodeStore<K, V> {
    state: Mutex<StoreState<K, V>>,
}

impl<K: BtreeKey, V: BtreeValue> Default for MemNodeStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: BtreeKey, V: BtreeValue> MemNodeStore<K, V> {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::from_image(DurableImage::default())),
        }
    }

    /// Allows only `budget` more durable writes; `None` removes the limit.
    ///
    /// Node writes, immediate frees and journal appends each consume one unit. Writes past
    /// the budget still update the live nodes.
    pub fn set_write_budget(&self, budget: Option<u64>) {
        self.state.lock().write_budget = budget;
    }

    /// Drops all live state and reloads it from the durable image.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        let image = std::mem::take(&mut state.image);
        *state = StoreState::from_image(image);
        debug!(
            target: "latchtree::btree::store",
            durable_nodes = state.image.nodes.len(),
            journal = state.image.journal.len(),
            "store crashed"
        );
    }

    /// Makes node and journal writes fail with [`BtreeError::FastPathNotPossible`].
    pub fn freeze(&self) {
        self.state.lock().frozen = true;
    }

    /// Undoes [`MemNodeStore::freeze`].
    pub fn thaw(&self) {
        self.state.lock().frozen = false;
    }

    /// Caps the number of live nodes; `None` removes the cap.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.state.lock().capacity = capacity;
    }

    /// Number of nodes the live state holds.
    pub fn live_node_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of node images in the durable image.
    pub fn durable_node_count(&self) -> usize {
        self.state.lock().image.nodes.len()
    }

    /// Whether the durable image holds `id`.
    pub fn is_durable(&self, id: NodeId) -> bool {
        self.state.lock().image.nodes.contains_key(&id)
    }

    /// Number of journal frames in the durable image.
    pub fn journal_len(&self) -> usize {
        self.state.lock().image.journal.len()
    }

    /// Writes the durable image to `path`.
    pub fn save_image(&self, path: &Path) -> Result<()> {
        let bytes = self.state.lock().image.encode();
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Opens a store whose durable and live state come from the image at `path`.
    pub fn load_image(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let image = DurableImage::decode(&bytes)?;
        Ok(Self {
            state: Mutex::new(StoreState::from_image(image)),
        })
    }

    fn load_durable(state: &mut StoreState<K, V>, id: NodeId) -> Result<Option<NodePtr<K, V>>> {
        let Some(bytes) = state.image.nodes.get(&id) else {
            return Ok(None);
        };
        let node = BtreeNode::decode_image(bytes)?;
        if node.id() != id {
            return Err(BtreeError::Corruption("node image stored under the wrong id"));
        }
        let ptr = Arc::new(RwLock::new(node));
        state.live.insert(id, Arc::clone(&ptr));
        Ok(Some(ptr))
    }

    fn fresh(is_leaf: bool, id: NodeId) -> BtreeNode<K, V> {
        if is_leaf {
            BtreeNode::new_leaf(id)
        } else {
            BtreeNode::new_interior(id)
        }
    }
}

impl<K: BtreeKey, V: BtreeValue> NodeStore<K, V> for MemNodeStore<K, V> {
    fn alloc_node(&self, is_leaf: bool) -> Result<(NodeId, NodePtr<K, V>)> {
        let mut state = self.state.lock();
        if let Some(cap) = state.capacity {
            if state.live.len() >= cap {
                return Err(BtreeError::SpaceNotAvail);
            }
        }
        let id = NodeId(state.next_id);
        state.bump_next_id(id);
        let ptr = Arc::new(RwLock::new(Self::fresh(is_leaf, id)));
        state.live.insert(id, Arc::clone(&ptr));
        Ok((id, ptr))
    }

    fn reserve_node(&self, id: NodeId, is_leaf: bool) -> Result<NodePtr<K, V>> {
        let mut state = self.state.lock();
        if let Some(ptr) = state.live.get(&id) {
            return Ok(Arc::clone(ptr));
        }
        state.bump_next_id(id);
        if let Some(ptr) = Self::load_durable(&mut state, id)? {
            return Ok(ptr);
        }
        let ptr = Arc::new(RwLock::new(Self::fresh(is_leaf, id)));
        state.live.insert(id, Arc::clone(&ptr));
        Ok(ptr)
    }

    fn read_node(&self, id: NodeId) -> Result<NodePtr<K, V>> {
        let mut state = self.state.lock();
        if let Some(ptr) = state.live.get(&id) {
            return Ok(Arc::clone(ptr));
        }
        Self::load_durable(&mut state, id)?.ok_or(BtreeError::Corruption("node not found"))
    }

    fn write_node(&self, node: &mut BtreeNode<K, V>, cp: &BtreeCp) -> Result<()> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(BtreeError::FastPathNotPossible);
        }
        if node.last_cp() > cp.id() {
            return Err(BtreeError::CpMismatch);
        }
        node.set_gen(node.gen().next());
        node.set_last_cp(cp.id());
        if state.persist() {
            state.image.nodes.insert(node.id(), node.encode_image());
        }
        Ok(())
    }

    fn free_node(&self, id: NodeId, cp: &BtreeCp, mode: FreeMode) -> Result<()> {
        match mode {
            FreeMode::Deferred => cp.defer_free(id),
            FreeMode::Immediate => {
                let mut state = self.state.lock();
                state.live.remove(&id);
                if state.persist() {
                    state.image.nodes.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn write_journal_entry(&self, entry: &JournalEntry) -> Result<()> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(BtreeError::FastPathNotPossible);
        }
        if state.persist() {
            state.image.journal.push(entry.encode());
        }
        Ok(())
    }

    fn journal_entries(&self) -> Result<Vec<JournalEntry>> {
        let state = self.state.lock();
        state
            .image
            .journal
            .iter()
            .map(|frame| JournalEntry::decode(frame))
            .collect()
    }

    fn cp_flush(&self, cp: &BtreeCp) -> Result<()> {
        let freed = cp.take_deferred();
        let mut state = self.state.lock();
        for id in &freed {
            state.live.remove(id);
            if state.persist() {
                state.image.nodes.remove(id);
            }
        }
        if state.persist() {
            state.image.journal.clear();
        }
        state.image.flushed_cp = state.image.flushed_cp.max(cp.id());
        debug!(
            target: "latchtree::btree::store",
            cp = cp.id().0,
            freed = freed.len(),
            "checkpoint flushed"
        );
        Ok(())
    }

    fn last_flushed_cp(&self) -> CpId {
        self.state.lock().image.flushed_cp
    }

    fn root_id(&self) -> Option<NodeId> {
        self.state.lock().root
    }

    fn set_root_id(&self, id: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.root = Some(id);
        state.image.root = Some(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::journal::{JournalOp, NodeOp};
    use crate::storage::btree::key::PutType;
    use crate::types::Gen;

    type Store = MemNodeStore<u64, u64>;

    fn write_leaf(store: &Store, cp: &BtreeCp, keys: &[u64]) -> Result<NodeId> {
        let (id, ptr) = store.alloc_node(true)?;
        let mut node = ptr.write();
        for &k in keys {
            node.leaf_put(k, k, PutType::InsertOnlyIfNotExists)?;
        }
        store.write_node(&mut node, cp)?;
        Ok(id)
    }

    #[test]
    fn writes_past_budget_are_lost_on_crash() -> Result<()> {
        let store = Store::new();
        let cp = BtreeCp::new(CpId(1));
        let id = write_leaf(&store, &cp, &[1])?;
        store.set_write_budget(Some(0));
        {
            let ptr = store.read_node(id)?;
            let mut node = ptr.write();
            node.leaf_put(2, 2, PutType::InsertOnlyIfNotExists)?;
            store.write_node(&mut node, &cp)?;
            assert_eq!(node.gen(), Gen(2));
        }
        store.crash();
        let ptr = store.read_node(id)?;
        let node = ptr.read();
        assert_eq!(node.gen(), Gen(1));
        assert_eq!(node.leaf_entries(), &[(1, 1)]);
        Ok(())
    }

    #[test]
    fn ids_stay_monotonic_across_crashes() -> Result<()> {
        let store = Store::new();
        let (a, _) = store.alloc_node(true)?;
        store.crash();
        let (b, _) = store.alloc_node(true)?;
        assert!(b > a);
        let reserved = store.reserve_node(NodeId(40), false)?;
        assert!(!reserved.read().is_leaf());
        let (c, _) = store.alloc_node(true)?;
        assert_eq!(c, NodeId(41));
        Ok(())
    }

    #[test]
    fn freeze_capacity_and_stale_checkpoints() -> Result<()> {
        let store = Store::new();
        let old = BtreeCp::new(CpId(1));
        let new = BtreeCp::new(CpId(2));
        let id = write_leaf(&store, &new, &[1])?;
        let ptr = store.read_node(id)?;
        assert!(matches!(
            store.write_node(&mut ptr.write(), &old),
            Err(BtreeError::CpMismatch)
        ));
        store.freeze();
        assert!(matches!(
            store.write_node(&mut ptr.write(), &new),
            Err(BtreeError::FastPathNotPossible)
        ));
        store.thaw();
        store.set_capacity(Some(1));
        assert!(matches!(store.alloc_node(true), Err(BtreeError::SpaceNotAvail)));
        Ok(())
    }

    #[test]
    fn deferred_frees_keep_durable_copy_until_flush() -> Result<()> {
        let store = Store::new();
        let cp = BtreeCp::new(CpId(1));
        let id = write_leaf(&store, &cp, &[3])?;
        let mut entry = JournalEntry::new(JournalOp::Merge, false, cp.id(), (id, Gen(1)));
        entry.append_node(NodeOp::Removal, id, Gen(1), None);
        store.write_journal_entry(&entry)?;
        store.free_node(id, &cp, FreeMode::Deferred)?;
        assert!(store.is_durable(id));
        assert_eq!(store.journal_entries()?, vec![entry]);
        store.cp_flush(&cp)?;
        assert!(!store.is_durable(id));
        assert_eq!(store.journal_len(), 0);
        assert_eq!(store.last_flushed_cp(), CpId(1));
        Ok(())
    }

    #[test]
    fn image_survives_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tree.img");
        let store = Store::new();
        let cp = BtreeCp::new(CpId(1));
        let id = write_leaf(&store, &cp, &[7, 8])?;
        store.set_root_id(id)?;
        store.save_image(&path)?;

        let loaded = Store::load_image(&path)?;
        assert_eq!(loaded.root_id(), Some(id));
        let ptr = loaded.read_node(id)?;
        assert_eq!(ptr.read().leaf_entries(), &[(7, 7), (8, 8)]);

        let mut bytes = fs::read(&path)?;
        bytes[10] ^= 0xaa;
        fs::write(&path, bytes)?;
        assert!(matches!(
            Store::load_image(&path),
            Err(BtreeError::Corruption(_))
        ));
        Ok(())
    }
}
