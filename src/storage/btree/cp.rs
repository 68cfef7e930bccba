use parking_lot::Mutex;

use crate::types::{CpId, NodeId};

/// Consistency-point token threaded through every mutation.
///
/// Nodes freed while the checkpoint is open stay durable until it is flushed, so journal
/// replay can still read them.
#[derive(Debug)]
pub struct BtreeCp {
    id: CpId,
    deferred: Mutex<Vec<NodeId>>,
}

impl BtreeCp {
    /// Opens checkpoint `id`.
    pub fn new(id: CpId) -> Self {
        Self {
            id,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Checkpoint id.
    pub fn id(&self) -> CpId {
        self.id
    }

    /// Queues `node` to be freed when the checkpoint is flushed.
    pub fn defer_free(&self, node: NodeId) {
        self.deferred.lock().push(node);
    }

    /// Number of queued frees.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Drains the queued frees.
    pub fn take_deferred(&self) -> Vec<NodeId> {
        std::mem::take(&mut *self.deferred.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_frees_drain_once() {
        let cp = BtreeCp::new(CpId(2));
        cp.defer_free(NodeId(5));
        cp.defer_free(NodeId(9));
        assert_eq!(cp.deferred_len(), 2);
        assert_eq!(cp.take_deferred(), vec![NodeId(5), NodeId(9)]);
        assert!(cp.take_deferred().is_empty());
        assert_eq!(cp.id(), CpId(2));
    }
}
