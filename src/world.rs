//! The world state engine: one instance of every configured tree plus the
//! worker pool and the shared persistent environment.
//!
//! Each tree sits behind its own `RwLock`; readers of either revision take
//! the read side, mutations take the write side. `commit`, `rollback` and
//! `sync_block` lock every tree in `TreeId` order, which linearizes them
//! against all per-tree operations without a deadlock window.

use crate::error::{StoreError, WorldStateError};
use crate::field::Fr;
use crate::pool::WorkerPool;
use crate::store::{CachedTreeStore, OverlayCheckpoint, TreeDb, TreeEnvironment};
use crate::tree::{
    AppendOnlyTree, BatchInsertResult, IndexedLeaf, IndexedTree, NullifierLeafValue,
    PublicDataLeafValue,
};
use crate::types::{
    BlockData, Leaf, LeafPreimage, Revision, StateReference, TreeId, TreeInfo, TreeMeta,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Constructor options for [`WorldState`].
#[derive(Clone, Debug)]
pub struct WorldStateConfig {
    /// Directory holding the persistent environment.
    pub data_directory: PathBuf,
    /// Page-cache budget for the environment, in KiB.
    pub map_size_kb: u32,
    /// Worker threads for request execution.
    pub worker_threads: u32,
}

/// Leaves for a batch insertion, typed by the target tree's flavor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexedLeaves {
    Nullifiers(Vec<NullifierLeafValue>),
    PublicData(Vec<PublicDataLeafValue>),
}

/// A batch-insertion result, tagged with the tree flavor it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchResult {
    Nullifier(BatchInsertResult<NullifierLeafValue>),
    PublicData(BatchInsertResult<PublicDataLeafValue>),
}

enum TreeHandle {
    Append(AppendOnlyTree),
    Nullifier(IndexedTree<NullifierLeafValue>),
    PublicData(IndexedTree<PublicDataLeafValue>),
}

enum HandleCheckpoint {
    Append(OverlayCheckpoint<Fr>),
    Nullifier(OverlayCheckpoint<IndexedLeaf<NullifierLeafValue>>),
    PublicData(OverlayCheckpoint<IndexedLeaf<PublicDataLeafValue>>),
}

impl TreeHandle {
    fn depth(&self) -> u32 {
        match self {
            TreeHandle::Append(tree) => tree.depth(),
            TreeHandle::Nullifier(tree) => tree.depth(),
            TreeHandle::PublicData(tree) => tree.depth(),
        }
    }

    fn meta(&self, include_uncommitted: bool) -> Result<TreeMeta, StoreError> {
        match self {
            TreeHandle::Append(tree) => tree.meta(include_uncommitted),
            TreeHandle::Nullifier(tree) => tree.meta(include_uncommitted),
            TreeHandle::PublicData(tree) => tree.meta(include_uncommitted),
        }
    }

    fn sibling_path(
        &self,
        index: u64,
        include_uncommitted: bool,
    ) -> Result<Vec<Fr>, StoreError> {
        match self {
            TreeHandle::Append(tree) => tree.sibling_path(index, include_uncommitted),
            TreeHandle::Nullifier(tree) => tree.sibling_path(index, include_uncommitted),
            TreeHandle::PublicData(tree) => tree.sibling_path(index, include_uncommitted),
        }
    }

    fn checkpoint(&self) -> HandleCheckpoint {
        match self {
            TreeHandle::Append(tree) => HandleCheckpoint::Append(tree.store().checkpoint()),
            TreeHandle::Nullifier(tree) => HandleCheckpoint::Nullifier(tree.store().checkpoint()),
            TreeHandle::PublicData(tree) => {
                HandleCheckpoint::PublicData(tree.store().checkpoint())
            }
        }
    }

    fn restore(&mut self, checkpoint: HandleCheckpoint) {
        match (self, checkpoint) {
            (TreeHandle::Append(tree), HandleCheckpoint::Append(checkpoint)) => {
                tree.store_mut().restore(checkpoint)
            }
            (TreeHandle::Nullifier(tree), HandleCheckpoint::Nullifier(checkpoint)) => {
                tree.store_mut().restore(checkpoint)
            }
            (TreeHandle::PublicData(tree), HandleCheckpoint::PublicData(checkpoint)) => {
                tree.store_mut().restore(checkpoint)
            }
            _ => unreachable!("checkpoint flavor always matches its tree"),
        }
    }

    fn write_pending(&self, txn: &redb::WriteTransaction) -> Result<(), StoreError> {
        match self {
            TreeHandle::Append(tree) => tree.store().write_pending(txn),
            TreeHandle::Nullifier(tree) => tree.store().write_pending(txn),
            TreeHandle::PublicData(tree) => tree.store().write_pending(txn),
        }
    }

    fn clear_pending(&mut self) {
        match self {
            TreeHandle::Append(tree) => tree.store_mut().clear_pending(),
            TreeHandle::Nullifier(tree) => tree.store_mut().clear_pending(),
            TreeHandle::PublicData(tree) => tree.store_mut().clear_pending(),
        }
    }

    fn rollback(&mut self) {
        match self {
            TreeHandle::Append(tree) => tree.store_mut().rollback(),
            TreeHandle::Nullifier(tree) => tree.store_mut().rollback(),
            TreeHandle::PublicData(tree) => tree.store_mut().rollback(),
        }
    }
}

pub struct WorldState {
    env: Arc<TreeEnvironment>,
    trees: BTreeMap<TreeId, RwLock<TreeHandle>>,
    pool: Arc<WorkerPool>,
}

impl WorldState {
    /// Opens (or creates) the world state under the configured directory.
    /// Indexed trees are prefilled with their sentinel leaves on first open.
    pub fn open(config: &WorldStateConfig) -> Result<Self, WorldStateError> {
        let env = Arc::new(TreeEnvironment::open(
            &config.data_directory,
            config.map_size_kb,
        )?);

        let mut trees = BTreeMap::new();
        for id in TreeId::ALL {
            let db = TreeDb::new(Arc::clone(&env), id.db_name())?;
            let handle = match id {
                TreeId::Nullifier => {
                    TreeHandle::Nullifier(IndexedTree::new(CachedTreeStore::new(db), id.depth())?)
                }
                TreeId::PublicData => {
                    TreeHandle::PublicData(IndexedTree::new(CachedTreeStore::new(db), id.depth())?)
                }
                TreeId::NoteHash | TreeId::L1ToL2Message | TreeId::Archive => {
                    TreeHandle::Append(AppendOnlyTree::new(CachedTreeStore::new(db), id.depth()))
                }
            };
            trees.insert(id, RwLock::new(handle));
        }

        let pool = Arc::new(WorkerPool::new(config.worker_threads as usize));
        tracing::info!(
            dir = %config.data_directory.display(),
            workers = config.worker_threads,
            "opened world state"
        );
        Ok(WorldState { env, trees, pool })
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn read_tree(&self, id: TreeId) -> RwLockReadGuard<'_, TreeHandle> {
        self.trees[&id].read().expect("tree lock poisoned")
    }

    fn write_tree(&self, id: TreeId) -> RwLockWriteGuard<'_, TreeHandle> {
        self.trees[&id].write().expect("tree lock poisoned")
    }

    /// Write-locks every tree in id order.
    fn write_all_trees(&self) -> Vec<RwLockWriteGuard<'_, TreeHandle>> {
        TreeId::ALL.iter().map(|id| self.write_tree(*id)).collect()
    }

    fn include_uncommitted(revision: Revision) -> Result<bool, WorldStateError> {
        match revision {
            Revision::Committed => Ok(false),
            Revision::Uncommitted => Ok(true),
            Revision::HistoricalBlock(block) => Err(WorldStateError::InvalidRevision(block)),
        }
    }

    pub fn get_tree_info(
        &self,
        id: TreeId,
        revision: Revision,
    ) -> Result<TreeInfo, WorldStateError> {
        let include_uncommitted = Self::include_uncommitted(revision)?;
        let tree = self.read_tree(id);
        let meta = tree.meta(include_uncommitted)?;
        Ok(TreeInfo {
            tree_id: id,
            root: meta.root,
            size: meta.size,
            depth: tree.depth(),
        })
    }

    pub fn get_state_reference(
        &self,
        revision: Revision,
    ) -> Result<StateReference, WorldStateError> {
        let include_uncommitted = Self::include_uncommitted(revision)?;
        let mut reference = StateReference::new();
        for id in TreeId::ALL {
            let meta = self.read_tree(id).meta(include_uncommitted)?;
            reference.insert(id, meta);
        }
        Ok(reference)
    }

    pub fn sibling_path(
        &self,
        id: TreeId,
        index: u64,
        revision: Revision,
    ) -> Result<Vec<Fr>, WorldStateError> {
        let include_uncommitted = Self::include_uncommitted(revision)?;
        Ok(self.read_tree(id).sibling_path(index, include_uncommitted)?)
    }

    /// The leaf value at `index`: the raw field element for append-only
    /// trees, the stored value (without linked-list threading) for indexed
    /// trees.
    pub fn get_leaf(
        &self,
        id: TreeId,
        index: u64,
        revision: Revision,
    ) -> Result<Option<Leaf>, WorldStateError> {
        let include_uncommitted = Self::include_uncommitted(revision)?;
        let tree = self.read_tree(id);
        Ok(match &*tree {
            TreeHandle::Append(tree) => tree
                .get_leaf(index, include_uncommitted)?
                .map(Leaf::Value),
            TreeHandle::Nullifier(tree) => tree
                .get_leaf(index, include_uncommitted)?
                .map(|leaf| Leaf::Nullifier(leaf.value)),
            TreeHandle::PublicData(tree) => tree
                .get_leaf(index, include_uncommitted)?
                .map(|leaf| Leaf::PublicData(leaf.value)),
        })
    }

    /// The full stored leaf (preimage) of an indexed tree.
    pub fn get_indexed_leaf(
        &self,
        id: TreeId,
        index: u64,
        revision: Revision,
    ) -> Result<Option<LeafPreimage>, WorldStateError> {
        let include_uncommitted = Self::include_uncommitted(revision)?;
        let tree = self.read_tree(id);
        match &*tree {
            TreeHandle::Append(_) => Err(WorldStateError::InvalidTreeOperation(id)),
            TreeHandle::Nullifier(tree) => Ok(tree
                .get_leaf(index, include_uncommitted)?
                .map(LeafPreimage::Nullifier)),
            TreeHandle::PublicData(tree) => Ok(tree
                .get_leaf(index, include_uncommitted)?
                .map(LeafPreimage::PublicData)),
        }
    }

    pub fn find_leaf_index(
        &self,
        id: TreeId,
        leaf: &Leaf,
        from_index: u64,
        revision: Revision,
    ) -> Result<Option<u64>, WorldStateError> {
        let include_uncommitted = Self::include_uncommitted(revision)?;
        let tree = self.read_tree(id);
        match (&*tree, leaf) {
            (TreeHandle::Append(tree), Leaf::Value(value)) => {
                Ok(tree.find_leaf(*value, from_index, include_uncommitted)?)
            }
            (TreeHandle::Nullifier(tree), Leaf::Nullifier(value)) => {
                Ok(tree.find_leaf_index(value, from_index, include_uncommitted)?)
            }
            (TreeHandle::PublicData(tree), Leaf::PublicData(value)) => {
                Ok(tree.find_leaf_index(value, from_index, include_uncommitted)?)
            }
            _ => Err(WorldStateError::InvalidTreeOperation(id)),
        }
    }

    /// The predecessor leaf of `key` in an indexed tree's sorted list.
    pub fn find_low_leaf(
        &self,
        id: TreeId,
        key: Fr,
        revision: Revision,
    ) -> Result<LeafPreimage, WorldStateError> {
        let include_uncommitted = Self::include_uncommitted(revision)?;
        let tree = self.read_tree(id);
        match &*tree {
            TreeHandle::Append(_) => Err(WorldStateError::InvalidTreeOperation(id)),
            TreeHandle::Nullifier(tree) => {
                let (_, leaf) = tree.find_low_leaf(key, include_uncommitted)?;
                Ok(LeafPreimage::Nullifier(leaf))
            }
            TreeHandle::PublicData(tree) => {
                let (_, leaf) = tree.find_low_leaf(key, include_uncommitted)?;
                Ok(LeafPreimage::PublicData(leaf))
            }
        }
    }

    /// Appends raw leaves to an append-only tree.
    pub fn append_leaves(&self, id: TreeId, leaves: &[Fr]) -> Result<(), WorldStateError> {
        let mut tree = self.write_tree(id);
        match &mut *tree {
            TreeHandle::Append(tree) => {
                tree.append(leaves)?;
                Ok(())
            }
            _ => Err(WorldStateError::InvalidTreeOperation(id)),
        }
    }

    /// Batch-inserts values into an indexed tree, returning the low-leaf
    /// witnesses in insertion (descending-key) order.
    pub fn append_indexed_leaves(
        &self,
        id: TreeId,
        leaves: IndexedLeaves,
    ) -> Result<BatchResult, WorldStateError> {
        let mut tree = self.write_tree(id);
        match (&mut *tree, leaves) {
            (TreeHandle::Nullifier(tree), IndexedLeaves::Nullifiers(leaves)) => {
                Ok(BatchResult::Nullifier(tree.batch_insert(&leaves)?))
            }
            (TreeHandle::PublicData(tree), IndexedLeaves::PublicData(leaves)) => {
                Ok(BatchResult::PublicData(tree.batch_insert(&leaves)?))
            }
            _ => Err(WorldStateError::InvalidTreeOperation(id)),
        }
    }

    /// Writes one public-data value; an existing slot is updated in place.
    pub fn update_public_data(&self, value: PublicDataLeafValue) -> Result<(), WorldStateError> {
        let mut tree = self.write_tree(TreeId::PublicData);
        match &mut *tree {
            TreeHandle::PublicData(tree) => {
                tree.insert(&value)?;
                Ok(())
            }
            _ => unreachable!("public data tree has a fixed flavor"),
        }
    }

    /// Appends a block hash to the archive tree.
    pub fn update_archive(&self, block_hash: Fr) -> Result<(), WorldStateError> {
        self.append_leaves(TreeId::Archive, &[block_hash])
    }

    /// Flushes every tree's overlay in one atomic batch. On failure all
    /// overlays stay intact and the call can be retried.
    pub fn commit(&self) -> Result<(), WorldStateError> {
        let mut guards = self.write_all_trees();
        let txn = self.env.begin_write()?;
        for guard in &guards {
            guard.write_pending(&txn)?;
        }
        txn.commit().map_err(StoreError::backend)?;
        for guard in &mut guards {
            guard.clear_pending();
        }
        tracing::debug!("committed world state");
        Ok(())
    }

    /// Drops every tree's overlay.
    pub fn rollback(&self) -> Result<(), WorldStateError> {
        let mut guards = self.write_all_trees();
        for guard in &mut guards {
            guard.rollback();
        }
        tracing::debug!("rolled back world state");
        Ok(())
    }

    /// Applies a block's contents to all trees, verifies the resulting
    /// state reference, and commits. Any failure, including a state
    /// mismatch, restores every tree to its exact pre-call overlay.
    pub fn sync_block(&self, block: &BlockData) -> Result<(), WorldStateError> {
        let mut guards = self.write_all_trees();
        let before: Vec<HandleCheckpoint> = guards.iter().map(|g| g.checkpoint()).collect();

        let applied = Self::apply_block(&mut guards, block).and_then(|()| {
            for (position, id) in TreeId::ALL.iter().enumerate() {
                let meta = guards[position].meta(true)?;
                match block.expected_state_refs.get(id) {
                    Some(expected) if *expected == meta => {}
                    _ => return Err(WorldStateError::BlockStateMismatch(*id)),
                }
            }
            Ok(())
        });

        match applied {
            Ok(()) => {
                let txn = self.env.begin_write()?;
                for guard in &guards {
                    guard.write_pending(&txn)?;
                }
                txn.commit().map_err(StoreError::backend)?;
                for guard in &mut guards {
                    guard.clear_pending();
                }
                tracing::info!(block_hash = %block.block_hash, "synchronized block");
                Ok(())
            }
            Err(err) => {
                for (guard, checkpoint) in guards.iter_mut().zip(before) {
                    guard.restore(checkpoint);
                }
                tracing::warn!(error = %err, "block sync failed, state restored");
                Err(err)
            }
        }
    }

    /// Applies block contents in the fixed order: note hashes, L1-to-L2
    /// messages, nullifiers (one batch), public writes (batch per
    /// transaction), archive entry.
    fn apply_block(
        guards: &mut [RwLockWriteGuard<'_, TreeHandle>],
        block: &BlockData,
    ) -> Result<(), WorldStateError> {
        match &mut *guards[TreeId::NoteHash as usize] {
            TreeHandle::Append(tree) => {
                tree.append(&block.new_note_hashes)?;
            }
            _ => unreachable!("note hash tree has a fixed flavor"),
        }
        match &mut *guards[TreeId::L1ToL2Message as usize] {
            TreeHandle::Append(tree) => {
                tree.append(&block.new_l1_to_l2_msgs)?;
            }
            _ => unreachable!("message tree has a fixed flavor"),
        }
        match &mut *guards[TreeId::Nullifier as usize] {
            TreeHandle::Nullifier(tree) => {
                tree.batch_insert(&block.new_nullifiers)?;
            }
            _ => unreachable!("nullifier tree has a fixed flavor"),
        }
        match &mut *guards[TreeId::PublicData as usize] {
            TreeHandle::PublicData(tree) => {
                for batch in &block.new_public_writes {
                    tree.batch_insert(batch)?;
                }
            }
            _ => unreachable!("public data tree has a fixed flavor"),
        }
        match &mut *guards[TreeId::Archive as usize] {
            TreeHandle::Append(tree) => {
                tree.append(&[block.block_hash])?;
            }
            _ => unreachable!("archive tree has a fixed flavor"),
        }
        Ok(())
    }
}
