//! Merkle trees: the append-only flavor and the indexed (sorted linked
//! list) flavor, plus the level-by-level hashing shared between them.

pub mod append;
pub mod indexed;
pub mod leaf;

pub use append::AppendOnlyTree;
pub use indexed::{BatchInsertResult, IndexedTree, LowLeafWitness};
pub use leaf::{IndexedLeaf, IndexedLeafValue, NullifierLeafValue, PublicDataLeafValue};

use crate::constant::MIN_PAR_HASH_BATCH;
use crate::error::StoreError;
use crate::field::{empty_subtree_root, hash_pair, Fr};
use crate::store::{CachedTreeStore, TreeLeaf};
use crate::types::NodeRef;
use rayon::prelude::*;

/// Reads a node, substituting the empty-subtree root when the node has
/// never been written.
pub(crate) fn node_or_zero<L: TreeLeaf>(
    store: &CachedTreeStore<L>,
    depth: u32,
    node: NodeRef,
    include_uncommitted: bool,
) -> Result<Fr, StoreError> {
    Ok(store
        .get_node(node, include_uncommitted)?
        .unwrap_or_else(|| empty_subtree_root(depth - node.level)))
}

/// Recomputes every ancestor of the given leaf-level indices and returns the
/// new root.
///
/// `dirty` must be sorted and deduplicated. Each level's parents are hashed
/// as one rayon batch; the level-to-level dependency stays sequential.
pub(crate) fn propagate_dirty<L: TreeLeaf>(
    store: &mut CachedTreeStore<L>,
    depth: u32,
    mut dirty: Vec<u64>,
) -> Result<Fr, StoreError> {
    debug_assert!(dirty.windows(2).all(|w| w[0] < w[1]));

    for level in (1..=depth).rev() {
        let mut parents: Vec<u64> = dirty.iter().map(|index| index >> 1).collect();
        parents.dedup();

        let inputs = parents
            .iter()
            .map(|&parent| {
                let left = node_or_zero(store, depth, NodeRef::new(level, parent << 1), true)?;
                let right =
                    node_or_zero(store, depth, NodeRef::new(level, (parent << 1) | 1), true)?;
                Ok((parent, left, right))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let hashed: Vec<(u64, Fr)> = inputs
            .par_iter()
            .with_min_len(MIN_PAR_HASH_BATCH)
            .map(|&(parent, left, right)| (parent, hash_pair(left, right)))
            .collect();

        for (parent, value) in hashed {
            store.put_node(NodeRef::new(level - 1, parent), value);
        }
        dirty = parents;
    }

    node_or_zero(store, depth, NodeRef::new(0, 0), true)
}

/// Sibling path for a leaf, from the leaf level up to (but not including)
/// the root.
pub(crate) fn sibling_path<L: TreeLeaf>(
    store: &CachedTreeStore<L>,
    depth: u32,
    leaf_index: u64,
    include_uncommitted: bool,
) -> Result<Vec<Fr>, StoreError> {
    let mut path = Vec::with_capacity(depth as usize);
    let mut index = leaf_index;
    for level in (1..=depth).rev() {
        path.push(node_or_zero(
            store,
            depth,
            NodeRef::new(level, index ^ 1),
            include_uncommitted,
        )?);
        index >>= 1;
    }
    Ok(path)
}
