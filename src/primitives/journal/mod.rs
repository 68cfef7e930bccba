#![forbid(unsafe_code)]

//! Structural-change journal records and their on-disk frame.

use std::fmt;

use crate::types::{BtreeError, CpId, Gen, NodeId, Result};

const JOURNAL_MAGIC: [u8; 4] = *b"LTJ1";
const JOURNAL_FORMAT_VERSION: u16 = 1;
const ENTRY_HEADER_LEN: usize = 36;
const NODE_RECORD_LEN: usize = 21;
const NO_KEY: u32 = u32::MAX;

/// Structural change an entry describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JournalOp {
    /// A node was split in two.
    Split,
    /// Siblings were merged, or the root collapsed (`is_root`).
    Merge,
    /// The root was emptied into a leaf and every node below it freed.
    Reset,
}

impl JournalOp {
    fn to_byte(self) -> u8 {
        match self {
            JournalOp::Split => 1,
            JournalOp::Merge => 2,
            JournalOp::Reset => 3,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(JournalOp::Split),
            2 => Ok(JournalOp::Merge),
            3 => Ok(JournalOp::Reset),
            _ => Err(BtreeError::Corruption("unknown journal op")),
        }
    }
}

/// What happened to one node taking part in a change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeOp {
    /// The node was allocated by the change.
    Creation,
    /// The node was rewritten under its existing id.
    InplaceWrite,
    /// The node was freed by the change.
    Removal,
}

impl NodeOp {
    fn to_byte(self) -> u8 {
        match self {
            NodeOp::Creation => 1,
            NodeOp::InplaceWrite => 2,
            NodeOp::Removal => 3,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(NodeOp::Creation),
            2 => Ok(NodeOp::InplaceWrite),
            3 => Ok(NodeOp::Removal),
            _ => Err(BtreeError::Corruption("unknown journal node op")),
        }
    }
}

/// One node record inside a [`JournalEntry`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalNode {
    /// Role of the node in the change.
    pub op: NodeOp,
    /// Node id.
    pub id: NodeId,
    /// Generation before the change was written.
    pub gen: Gen,
    /// Encoded parent routing key, absent for edge children and removals.
    pub key: Option<Vec<u8>>,
}

/// A journaled split or merge.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalEntry {
    /// Kind of change.
    pub op: JournalOp,
    /// True for root splits and root collapses.
    pub is_root: bool,
    /// Checkpoint the change belongs to.
    pub cp: CpId,
    /// Parent id.
    pub parent: NodeId,
    /// Parent generation before the change.
    pub parent_gen: Gen,
    /// Participating nodes in journal order.
    pub nodes: Vec<JournalNode>,
}

impl JournalEntry {
    /// Starts an entry for a change under `parent`.
    pub fn new(op: JournalOp, is_root: bool, cp: CpId, parent: (NodeId, Gen)) -> Self {
        Self {
            op,
            is_root,
            cp,
            parent: parent.0,
            parent_gen: parent.1,
            nodes: Vec::new(),
        }
    }

    /// Records one participating node.
    pub fn append_node(&mut self, op: NodeOp, id: NodeId, gen: Gen, key: Option<Vec<u8>>) {
        self.nodes.push(JournalNode { op, id, gen, key });
    }

    /// Node records with the given role, in journal order.
    pub fn nodes_with(&self, op: NodeOp) -> impl Iterator<Item = &JournalNode> {
        self.nodes.iter().filter(move |node| node.op == op)
    }

    /// Serializes the entry into a checksummed frame.
    pub fn encode(&self) -> Vec<u8> {
        let keys: usize = self
            .nodes
            .iter()
            .map(|n| n.key.as_ref().map_or(0, Vec::len))
            .sum();
        let mut buf =
            Vec::with_capacity(ENTRY_HEADER_LEN + self.nodes.len() * NODE_RECORD_LEN + keys + 4);
        buf.extend_from_slice(&JOURNAL_MAGIC);
        buf.extend_from_slice(&JOURNAL_FORMAT_VERSION.to_be_bytes());
        buf.push(self.op.to_byte());
        buf.push(u8::from(self.is_root));
        buf.extend_from_slice(&self.cp.0.to_be_bytes());
        buf.extend_from_slice(&self.parent.0.to_be_bytes());
        buf.extend_from_slice(&self.parent_gen.0.to_be_bytes());
        buf.extend_from_slice(&(self.nodes.len() as u32).to_be_bytes());
        for node in &self.nodes {
            buf.push(node.op.to_byte());
            buf.extend_from_slice(&node.id.0.to_be_bytes());
            buf.extend_from_slice(&node.gen.0.to_be_bytes());
            match &node.key {
                Some(key) => {
                    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
                    buf.extend_from_slice(key);
                }
                None => buf.extend_from_slice(&NO_KEY.to_be_bytes()),
            }
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses a frame produced by [`JournalEntry::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < ENTRY_HEADER_LEN + 4 {
            return Err(BtreeError::Corruption("journal entry truncated"));
        }
        let (body, crc_bytes) = src.split_at(src.len() - 4);
        let stored_crc = be_u32(crc_bytes, 0)?;
        if crc32fast::hash(body) != stored_crc {
            return Err(BtreeError::Corruption("journal entry crc mismatch"));
        }
        if body[0..4] != JOURNAL_MAGIC {
            return Err(BtreeError::Corruption("journal magic mismatch"));
        }
        let version = u16::from_be_bytes([body[4], body[5]]);
        if version != JOURNAL_FORMAT_VERSION {
            return Err(BtreeError::Corruption("journal format version mismatch"));
        }
        let op = JournalOp::from_byte(body[6])?;
        let is_root = match body[7] {
            0 => false,
            1 => true,
            _ => return Err(BtreeError::Corruption("journal root flag invalid")),
        };
        let cp = CpId(be_u64(body, 8)?);
        let parent = NodeId(be_u64(body, 16)?);
        let parent_gen = Gen(be_u64(body, 24)?);
        let count = be_u32(body, 32)? as usize;
        let mut pos = ENTRY_HEADER_LEN;
        let mut nodes = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let rec = body
                .get(pos..pos + NODE_RECORD_LEN)
                .ok_or(BtreeError::Corruption("journal node record truncated"))?;
            let node_op = NodeOp::from_byte(rec[0])?;
            let id = NodeId(be_u64(rec, 1)?);
            let gen = Gen(be_u64(rec, 9)?);
            let key_len = be_u32(rec, 17)?;
            pos += NODE_RECORD_LEN;
            let key = if key_len == NO_KEY {
                None
            } else {
                let end = pos + key_len as usize;
                let key = body
                    .get(pos..end)
                    .ok_or(BtreeError::Corruption("journal key truncated"))?
                    .to_vec();
                pos = end;
                Some(key)
            };
            nodes.push(JournalNode {
                op: node_op,
                id,
                gen,
                key,
            });
        }
        if pos != body.len() {
            return Err(BtreeError::Corruption("journal entry trailing bytes"));
        }
        Ok(Self {
            op,
            is_root,
            cp,
            parent,
            parent_gen,
            nodes,
        })
    }
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} root={} {} parent={}@{}",
            self.op, self.is_root, self.cp, self.parent, self.parent_gen
        )?;
        for node in &self.nodes {
            write!(f, " {:?}({}@{})", node.op, node.id, node.gen)?;
        }
        Ok(())
    }
}

fn be_u64(src: &[u8], at: usize) -> Result<u64> {
    src.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or(BtreeError::Corruption("journal field truncated"))
}

fn be_u32(src: &[u8], at: usize) -> Result<u32> {
    src.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(BtreeError::Corruption("journal field truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JournalEntry {
        let mut entry = JournalEntry::new(JournalOp::Split, true, CpId(3), (NodeId(1), Gen(7)));
        entry.append_node(NodeOp::Creation, NodeId(4), Gen(0), Some(vec![0, 0, 0, 10]));
        entry.append_node(NodeOp::Creation, NodeId(5), Gen(0), None);
        entry
    }

    #[test]
    fn frame_decodes_to_same_entry() -> Result<()> {
        let entry = sample();
        let decoded = JournalEntry::decode(&entry.encode())?;
        assert_eq!(decoded, entry);
        assert_eq!(decoded.nodes_with(NodeOp::Creation).count(), 2);
        Ok(())
    }

    #[test]
    fn reset_entry_keeps_its_removal_records() -> Result<()> {
        let mut entry = JournalEntry::new(JournalOp::Reset, true, CpId(9), (NodeId(1), Gen(4)));
        for id in 2..6 {
            entry.append_node(NodeOp::Removal, NodeId(id), Gen(id), None);
        }
        let decoded = JournalEntry::decode(&entry.encode())?;
        assert_eq!(decoded.op, JournalOp::Reset);
        assert_eq!(decoded.nodes_with(NodeOp::Removal).count(), 4);
        assert_eq!(decoded, entry);
        Ok(())
    }

    #[test]
    fn corrupt_frames_are_rejected() {
        let frame = sample().encode();

        let mut flipped = frame.clone();
        flipped[20] ^= 0x01;
        assert!(matches!(
            JournalEntry::decode(&flipped),
            Err(BtreeError::Corruption("journal entry crc mismatch"))
        ));

        assert!(JournalEntry::decode(&frame[..frame.len() - 6]).is_err());

        let mut bad_magic = frame[..frame.len() - 4].to_vec();
        bad_magic[0] = b'X';
        let crc = crc32fast::hash(&bad_magic);
        bad_magic.extend_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            JournalEntry::decode(&bad_magic),
            Err(BtreeError::Corruption("journal magic mismatch"))
        ));
    }
}
