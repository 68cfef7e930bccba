use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::types::{BtreeError, Result};

/// Trait implemented by key types stored in the tree.
pub trait BtreeKey: Ord + Clone + fmt::Debug + Send + Sync + 'static {
    /// Number of bytes the key occupies inside a node.
    fn serialized_size(&self) -> usize;

    /// Append the encoded key to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode a key previously written by [`BtreeKey::encode`].
    fn decode(src: &[u8]) -> Result<Self>;

    /// Key stored in the parent for a node whose last entry is `self`.
    ///
    /// Extent-style keys return the key of their final unit so the parent routing key
    /// stays below the next sibling's first key.
    fn end_key(&self) -> Self {
        self.clone()
    }

    /// Whether this key's logical range covers `split_key` and continues past it.
    fn straddles(&self, _split_key: &Self) -> bool {
        false
    }
}

/// Trait implemented by value types stored in leaves.
pub trait BtreeValue: Clone + fmt::Debug + Send + Sync + 'static {
    /// Number of bytes the value occupies inside a node.
    fn serialized_size(&self) -> usize;

    /// Append the encoded value to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode a value previously written by [`BtreeValue::encode`].
    fn decode(src: &[u8]) -> Result<Self>;

    /// Merge `other` into an existing value for the append put policies.
    fn append(&mut self, other: &Self) {
        *self = other.clone();
    }
}

/// Divides an entry whose key straddles a split key into its left and right parts.
pub type SplitKeyFn<K, V> = Arc<dyn Fn(&K, &V, &K) -> Result<((K, V), (K, V))> + Send + Sync>;

/// Policy applied by a point put when the key is or is not already present.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PutType {
    /// Insert; fail if the key exists.
    InsertOnlyIfNotExists,
    /// Replace; fail if the key is missing.
    ReplaceOnlyIfExists,
    /// Upsert.
    ReplaceIfExistsElseInsert,
    /// Append to the existing value; fail if the key is missing.
    AppendOnlyIfExists,
    /// Append to the existing value or insert.
    AppendIfExistsElseInsert,
}

/// A contiguous range of keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange<K> {
    /// Lower bound.
    pub start: Bound<K>,
    /// Upper bound.
    pub end: Bound<K>,
}

impl<K: Ord + Clone> KeyRange<K> {
    /// Range from explicit keys and inclusivity flags.
    pub fn new(start: K, start_inclusive: bool, end: K, end_inclusive: bool) -> Self {
        Self {
            start: if start_inclusive {
                Bound::Included(start)
            } else {
                Bound::Excluded(start)
            },
            end: if end_inclusive {
                Bound::Included(end)
            } else {
                Bound::Excluded(end)
            },
        }
    }

    /// The whole key space.
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Single key.
    pub fn point(key: K) -> Self {
        Self {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key),
        }
    }

    /// Build from any standard range expression.
    pub fn from_bounds<R: RangeBounds<K>>(range: R) -> Self {
        Self {
            start: range.start_bound().cloned(),
            end: range.end_bound().cloned(),
        }
    }

    /// True when `key` lies below the start bound.
    pub fn is_before_start(&self, key: &K) -> bool {
        match &self.start {
            Bound::Included(s) => key < s,
            Bound::Excluded(s) => key <= s,
            Bound::Unbounded => false,
        }
    }

    /// True when `key` lies above the end bound.
    pub fn is_past_end(&self, key: &K) -> bool {
        match &self.end {
            Bound::Included(e) => key > e,
            Bound::Excluded(e) => key >= e,
            Bound::Unbounded => false,
        }
    }

    /// True when `key` lies inside the range.
    pub fn contains(&self, key: &K) -> bool {
        !self.is_before_start(key) && !self.is_past_end(key)
    }

    /// True when no key can satisfy both bounds.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }

    /// Same range with the start moved just past `key`.
    pub fn resume_after(&self, key: &K) -> Self {
        Self {
            start: Bound::Excluded(key.clone()),
            end: self.end.clone(),
        }
    }

    /// Same range with the end clipped to `bound` (inclusive) when it is tighter.
    pub fn clip_end(&self, bound: &K) -> Self {
        let end = match &self.end {
            Bound::Included(e) | Bound::Excluded(e) if e <= bound => self.end.clone(),
            _ => Bound::Included(bound.clone()),
        };
        Self {
            start: self.start.clone(),
            end,
        }
    }

    /// True if `bound` (an inclusive upper key) reaches or passes the end of the range.
    pub fn ends_at_or_before(&self, bound: &K) -> bool {
        match &self.end {
            Bound::Included(e) | Bound::Excluded(e) => e <= bound,
            Bound::Unbounded => false,
        }
    }
}

impl BtreeKey for u64 {
    fn serialized_size(&self) -> usize {
        8
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = src
            .try_into()
            .map_err(|_| BtreeError::Corruption("u64 key length mismatch"))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl BtreeKey for u32 {
    fn serialized_size(&self) -> usize {
        4
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] = src
            .try_into()
            .map_err(|_| BtreeError::Corruption("u32 key length mismatch"))?;
        Ok(u32::from_be_bytes(bytes))
    }
}

impl BtreeKey for Vec<u8> {
    fn serialized_size(&self) -> usize {
        self.len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

impl BtreeValue for u64 {
    fn serialized_size(&self) -> usize {
        8
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = src
            .try_into()
            .map_err(|_| BtreeError::Corruption("u64 value length mismatch"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn append(&mut self, other: &Self) {
        *self = self.wrapping_add(*other);
    }
}

impl BtreeValue for Vec<u8> {
    fn serialized_size(&self) -> usize {
        self.len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }

    fn append(&mut self, other: &Self) {
        self.extend_from_slice(other);
    }
}

/// A run of `len` consecutive units starting at `start`.
///
/// Extents order by their first unit; stored extents never overlap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExtentKey {
    /// First unit covered.
    pub start: u64,
    /// Number of units covered, at least one.
    pub len: u32,
}

impl ExtentKey {
    /// New extent.
    pub fn new(start: u64, len: u32) -> Self {
        Self { start, len }
    }

    /// Last unit covered.
    pub fn last(&self) -> u64 {
        self.start + u64::from(self.len.max(1)) - 1
    }
}

impl BtreeKey for ExtentKey {
    fn serialized_size(&self) -> usize {
        12
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != 12 {
            return Err(BtreeError::Corruption("extent key length mismatch"));
        }
        let mut start = [0u8; 8];
        start.copy_from_slice(&src[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&src[8..]);
        Ok(Self {
            start: u64::from_be_bytes(start),
            len: u32::from_be_bytes(len),
        })
    }

    fn end_key(&self) -> Self {
        ExtentKey::new(self.last(), 1)
    }

    fn straddles(&self, split_key: &Self) -> bool {
        let at = split_key.last();
        self.start <= at && self.last() > at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_clipping_and_resume() {
        let r = KeyRange::new(10u64, true, 50, true);
        assert!(r.contains(&10));
        assert!(!r.contains(&51));
        let clipped = r.clip_end(&30);
        assert_eq!(clipped.end, Bound::Included(30));
        assert_eq!(r.clip_end(&80).end, Bound::Included(50));
        let resumed = clipped.resume_after(&30);
        assert!(resumed.is_empty() || !resumed.contains(&30));
        assert!(KeyRange::new(5u64, false, 5, true).is_empty());
    }

    #[test]
    fn extent_straddles_split_point() {
        let e = ExtentKey::new(100, 10);
        assert_eq!(e.end_key(), ExtentKey::new(109, 1));
        assert!(e.straddles(&ExtentKey::new(104, 1)));
        assert!(!e.straddles(&ExtentKey::new(109, 1)));
        assert!(!e.straddles(&ExtentKey::new(99, 1)));
        assert!(!7u64.straddles(&3));
    }

    #[test]
    fn scalar_codecs_reject_bad_lengths() {
        let mut buf = Vec::new();
        BtreeKey::encode(&42u64, &mut buf);
        assert_eq!(<u64 as BtreeKey>::decode(&buf).ok(), Some(42));
        assert!(<u64 as BtreeKey>::decode(&buf[..3]).is_err());
        let mut ext = Vec::new();
        ExtentKey::new(7, 3).encode(&mut ext);
        assert_eq!(ExtentKey::decode(&ext).ok(), Some(ExtentKey::new(7, 3)));
    }
}
