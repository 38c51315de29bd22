//! Core data model: tree identifiers, revisions, metadata and block input.

use crate::constant::*;
use crate::field::Fr;
use crate::tree::leaf::{IndexedLeaf, NullifierLeafValue, PublicDataLeafValue};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Identifier of one of the engine's trees.
///
/// The discriminants are part of the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TreeId {
    Nullifier = 0,
    NoteHash = 1,
    PublicData = 2,
    L1ToL2Message = 3,
    Archive = 4,
}

impl TreeId {
    /// Every tree, in id order. `commit`, `rollback` and `sync_block` lock
    /// trees in exactly this order.
    pub const ALL: [TreeId; 5] = [
        TreeId::Nullifier,
        TreeId::NoteHash,
        TreeId::PublicData,
        TreeId::L1ToL2Message,
        TreeId::Archive,
    ];

    /// Name of the tree's database inside the environment.
    pub fn db_name(self) -> &'static str {
        match self {
            TreeId::Nullifier => "nullifier_tree",
            TreeId::NoteHash => "note_hash_tree",
            TreeId::PublicData => "public_data_tree",
            TreeId::L1ToL2Message => "message_tree",
            TreeId::Archive => "archive_tree",
        }
    }

    pub fn depth(self) -> u32 {
        match self {
            TreeId::Nullifier => NULLIFIER_TREE_DEPTH,
            TreeId::NoteHash => NOTE_HASH_TREE_DEPTH,
            TreeId::PublicData => PUBLIC_DATA_TREE_DEPTH,
            TreeId::L1ToL2Message => L1_TO_L2_MSG_TREE_DEPTH,
            TreeId::Archive => ARCHIVE_TREE_DEPTH,
        }
    }
}

/// Snapshot selector for reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Revision {
    /// The state as of the most recent successful commit.
    Committed,
    /// The working state, including the uncommitted overlay.
    Uncommitted,
    /// A specific historical block. Accepted structurally; resolving it
    /// requires a persisted block index, which this engine does not keep.
    HistoricalBlock(u32),
}

impl Revision {
    /// Wire encoding: `-1` uncommitted, `0` committed, `n > 0` historical.
    pub fn to_wire(self) -> i64 {
        match self {
            Revision::Uncommitted => -1,
            Revision::Committed => 0,
            Revision::HistoricalBlock(block) => i64::from(block),
        }
    }

    pub fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            -1 => Some(Revision::Uncommitted),
            0 => Some(Revision::Committed),
            block if block > 0 && block <= i64::from(u32::MAX) => {
                Some(Revision::HistoricalBlock(block as u32))
            }
            _ => None,
        }
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Revision::from_wire(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid revision selector {raw}")))
    }
}

/// Positional address of a tree node: level 0 is the root, level `depth` the
/// leaf layer, `index` counts left to right within the level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub level: u32,
    pub index: u64,
}

impl NodeRef {
    pub fn new(level: u32, index: u64) -> Self {
        NodeRef { level, index }
    }
}

/// Mutable per-tree metadata: the current root and the number of leaves ever
/// appended (prefill included).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    pub root: Fr,
    pub size: u64,
}

/// Full tree description returned by `get_tree_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeInfo {
    pub tree_id: TreeId,
    pub root: Fr,
    pub size: u64,
    pub depth: u32,
}

/// `(root, size)` pairs for every tree at one revision.
pub type StateReference = BTreeMap<TreeId, TreeMeta>;

/// A leaf as it travels over the wire; the variant is dictated by the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Leaf {
    Value(Fr),
    Nullifier(NullifierLeafValue),
    PublicData(PublicDataLeafValue),
}

/// A stored indexed leaf (value plus linked-list threading), tree-kind
/// tagged for the engine's uniform query surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafPreimage {
    Nullifier(IndexedLeaf<NullifierLeafValue>),
    PublicData(IndexedLeaf<PublicDataLeafValue>),
}

/// Everything a block contributes to the world state, plus the state
/// reference the trees are expected to arrive at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub expected_state_refs: StateReference,
    pub block_hash: Fr,
    pub new_note_hashes: Vec<Fr>,
    pub new_l1_to_l2_msgs: Vec<Fr>,
    pub new_nullifiers: Vec<NullifierLeafValue>,
    /// Public writes arrive as per-transaction batches so that writes to the
    /// same slot across transactions keep their order.
    pub new_public_writes: Vec<Vec<PublicDataLeafValue>>,
}
