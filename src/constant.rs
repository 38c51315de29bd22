//! Constants that fix the shape of the world state.

/// Depth of the nullifier tree.
pub const NULLIFIER_TREE_DEPTH: u32 = 20;
/// Depth of the note-hash tree.
pub const NOTE_HASH_TREE_DEPTH: u32 = 32;
/// Depth of the public-data tree.
pub const PUBLIC_DATA_TREE_DEPTH: u32 = 40;
/// Depth of the L1-to-L2 message tree.
pub const L1_TO_L2_MSG_TREE_DEPTH: u32 = 16;
/// Depth of the archive tree.
pub const ARCHIVE_TREE_DEPTH: u32 = 16;

/// Number of synthetic sentinel leaves every indexed tree starts with.
/// Keys 0 and 1 are reserved so that every real insertion has both a
/// predecessor and a successor.
pub const INDEXED_TREE_PREFILL: u64 = 2;

/// File name of the engine's database inside the data directory.
pub const WORLD_STATE_DB_FILE: &str = "world_state.redb";

/// Minimum number of hash jobs per rayon task when recomputing a tree level.
pub const MIN_PAR_HASH_BATCH: usize = 64;
