//! Per-node latches and the RAII guards the tree walks with.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};

use crate::types::{BtreeError, NodeId, Result};

/// Shared latch around a node body.
pub type Latch<T> = Arc<RwLock<T>>;

/// Lock state a caller holds on a node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockType {
    /// Not locked.
    None,
    /// Shared.
    Read,
    /// Exclusive.
    Write,
}

enum Guard<T> {
    Read(ArcRwLockReadGuard<RawRwLock, T>),
    Write(ArcRwLockWriteGuard<RawRwLock, T>),
}

/// A held node latch.
///
/// Dropping the value releases the latch.
pub struct LockedNode<T> {
    id: NodeId,
    guard: Guard<T>,
}

impl<T> LockedNode<T> {
    /// Blocks until `latch` is held shared.
    pub fn read(latch: &Latch<T>, id: NodeId) -> Self {
        let guard = Guard::Read(latch.read_arc());
        tracking::acquired(id, LockType::Read);
        Self { id, guard }
    }

    /// Blocks until `latch` is held exclusively.
    pub fn write(latch: &Latch<T>, id: NodeId) -> Self {
        let guard = Guard::Write(latch.write_arc());
        tracking::acquired(id, LockType::Write);
        Self { id, guard }
    }

    /// Locks `latch` in the requested mode; `LockType::None` is treated as read.
    pub fn lock(latch: &Latch<T>, id: NodeId, lock_type: LockType) -> Self {
        match lock_type {
            LockType::Write => Self::write(latch, id),
            LockType::Read | LockType::None => Self::read(latch, id),
        }
    }

    /// Node this guard latches.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Mode the latch is held in.
    pub fn lock_type(&self) -> LockType {
        match self.guard {
            Guard::Read(_) => LockType::Read,
            Guard::Write(_) => LockType::Write,
        }
    }

    /// True when held exclusively.
    pub fn is_write(&self) -> bool {
        matches!(self.guard, Guard::Write(_))
    }

    /// Shared handle to the underlying latch.
    pub fn latch(&self) -> Latch<T> {
        match &self.guard {
            Guard::Read(g) => Arc::clone(ArcRwLockReadGuard::rwlock(g)),
            Guard::Write(g) => Arc::clone(ArcRwLockWriteGuard::rwlock(g)),
        }
    }

    /// Mutable access; only available under a write latch.
    pub fn body_mut(&mut self) -> Result<&mut T> {
        match &mut self.guard {
            Guard::Write(g) => Ok(&mut **g),
            Guard::Read(_) => Err(BtreeError::Corruption("mutation under a read latch")),
        }
    }

    /// Releases a shared latch and waits for the exclusive one.
    ///
    /// The node is unlatched in between; callers must revalidate what they saw.
    pub fn relock_write(self) -> Self {
        if self.is_write() {
            return self;
        }
        let latch = self.latch();
        let id = self.id;
        drop(self);
        Self::write(&latch, id)
    }
}

impl<T> Deref for LockedNode<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Guard::Read(g) => g,
            Guard::Write(g) => g,
        }
    }
}

impl<T> Drop for LockedNode<T> {
    fn drop(&mut self) {
        tracking::released(self.id, self.lock_type());
    }
}

/// Panics when the calling thread still holds any node latch.
///
/// A no-op unless the `lock-tracking` feature is enabled.
pub fn assert_no_locks_held() {
    tracking::assert_empty();
}

/// Latches currently held by the calling thread.
///
/// Always empty unless the `lock-tracking` feature is enabled.
pub fn held_locks() -> Vec<(NodeId, LockType)> {
    tracking::held()
}

#[cfg(feature = "lock-tracking")]
mod tracking {
    use std::cell::RefCell;

    use super::LockType;
    use crate::types::NodeId;

    thread_local! {
        static HELD: RefCell<Vec<(NodeId, LockType)>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquired(id: NodeId, lock_type: LockType) {
        HELD.with(|held| held.borrow_mut().push((id, lock_type)));
    }

    pub(super) fn released(id: NodeId, lock_type: LockType) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|entry| *entry == (id, lock_type)) {
                held.remove(pos);
            }
        });
    }

    pub(super) fn held() -> Vec<(NodeId, LockType)> {
        HELD.with(|held| held.borrow().clone())
    }

    pub(super) fn assert_empty() {
        let held = held();
        assert!(held.is_empty(), "node latches still held: {held:?}");
    }
}

#[cfg(not(feature = "lock-tracking"))]
mod tracking {
    use super::LockType;
    use crate::types::NodeId;

    #[inline]
    pub(super) fn acquired(_id: NodeId, _lock_type: LockType) {}

    #[inline]
    pub(super) fn released(_id: NodeId, _lock_type: LockType) {}

    #[inline]
    pub(super) fn held() -> Vec<(NodeId, LockType)> {
        Vec::new()
    }

    #[inline]
    pub(super) fn assert_empty() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_writers_exclude() -> Result<()> {
        let latch: Latch<u32> = Arc::new(RwLock::new(7));
        let a = LockedNode::read(&latch, NodeId(1));
        let b = LockedNode::read(&latch, NodeId(1));
        assert_eq!(*a + *b, 14);
        assert!(latch.try_write().is_none());
        drop((a, b));

        let mut w = LockedNode::write(&latch, NodeId(1));
        *w.body_mut()? += 1;
        assert!(latch.try_read().is_none());
        drop(w);
        assert_eq!(*latch.read(), 8);
        Ok(())
    }

    #[test]
    fn mutation_through_read_latch_is_rejected() {
        let latch: Latch<u32> = Arc::new(RwLock::new(0));
        let mut r = LockedNode::read(&latch, NodeId(2));
        assert!(matches!(r.body_mut(), Err(BtreeError::Corruption(_))));
    }

    #[test]
    fn relock_write_waits_for_other_readers() {
        let latch: Latch<u32> = Arc::new(RwLock::new(0));
        let theirs = LockedNode::read(&latch, NodeId(3));
        let upgraded = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&upgraded);
        let shared = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            let ours = LockedNode::read(&shared, NodeId(3));
            let w = ours.relock_write();
            flag.store(true, Ordering::SeqCst);
            w.lock_type()
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!upgraded.load(Ordering::SeqCst));
        drop(theirs);
        assert_eq!(handle.join().unwrap(), LockType::Write);
        assert!(upgraded.load(Ordering::SeqCst));
    }

    #[cfg(feature = "lock-tracking")]
    #[test]
    fn registry_tracks_held_latches() {
        let latch: Latch<u32> = Arc::new(RwLock::new(0));
        let a = LockedNode::read(&latch, NodeId(4));
        assert_eq!(held_locks(), vec![(NodeId(4), LockType::Read)]);
        let a = a.relock_write();
        assert_eq!(held_locks(), vec![(NodeId(4), LockType::Write)]);
        drop(a);
        assert_no_locks_held();
    }
}
