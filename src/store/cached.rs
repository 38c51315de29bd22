//! Cached tree store: an uncommitted overlay on top of one tree's
//! persistent databases.
//!
//! All mutations land in the overlay first. Reads that include uncommitted
//! state consult the overlay before the persistent layer; committed reads
//! skip it entirely, so they always observe the most recent successful
//! commit. `commit` flushes every overlay entry through a write transaction
//! and clears the overlay only once the batch is durable, which means a
//! failed commit preserves the working state for a retry.

use crate::error::StoreError;
use crate::field::Fr;
use crate::store::env::TreeDb;
use crate::types::{NodeRef, TreeMeta};
use redb::WriteTransaction;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// A leaf that can live in a cached store.
pub trait TreeLeaf: Clone + Send + Sync + 'static {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError>;
}

impl TreeLeaf for Fr {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            StoreError::corrupt("leaves", format!("leaf record has {} bytes", bytes.len()))
        })?;
        Ok(Fr::from_le_bytes(array))
    }
}

/// The uncommitted overlay of one tree.
struct PendingState<L> {
    nodes: FxHashMap<NodeRef, Fr>,
    leaves: BTreeMap<u64, L>,
    meta: Option<TreeMeta>,
    /// key -> leaf index, so in-batch predecessor lookups resolve without
    /// touching the persistent layer.
    key_index: BTreeMap<Fr, u64>,
}

// Derived Default would demand L: Default.
impl<L> Default for PendingState<L> {
    fn default() -> Self {
        PendingState {
            nodes: FxHashMap::default(),
            leaves: BTreeMap::new(),
            meta: None,
            key_index: BTreeMap::new(),
        }
    }
}

impl<L: Clone> Clone for PendingState<L> {
    fn clone(&self) -> Self {
        PendingState {
            nodes: self.nodes.clone(),
            leaves: self.leaves.clone(),
            meta: self.meta,
            key_index: self.key_index.clone(),
        }
    }
}

/// A snapshot of the overlay, restorable with [`CachedTreeStore::restore`].
pub struct OverlayCheckpoint<L>(PendingState<L>);

/// Per-tree overlay over the persistent store.
pub struct CachedTreeStore<L: TreeLeaf> {
    db: TreeDb,
    pending: PendingState<L>,
}

impl<L: TreeLeaf> CachedTreeStore<L> {
    pub fn new(db: TreeDb) -> Self {
        CachedTreeStore {
            db,
            pending: PendingState::default(),
        }
    }

    /// Whether a commit has ever persisted metadata for this tree.
    pub fn is_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.db.get_meta()?.is_some())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.meta.is_some()
            || !self.pending.nodes.is_empty()
            || !self.pending.leaves.is_empty()
            || !self.pending.key_index.is_empty()
    }

    pub fn get_node(
        &self,
        node: NodeRef,
        include_uncommitted: bool,
    ) -> Result<Option<Fr>, StoreError> {
        if include_uncommitted {
            if let Some(value) = self.pending.nodes.get(&node) {
                return Ok(Some(*value));
            }
        }
        self.db.get_node(node)
    }

    pub fn put_node(&mut self, node: NodeRef, value: Fr) {
        self.pending.nodes.insert(node, value);
    }

    pub fn get_leaf(&self, index: u64, include_uncommitted: bool) -> Result<Option<L>, StoreError> {
        if include_uncommitted {
            if let Some(leaf) = self.pending.leaves.get(&index) {
                return Ok(Some(leaf.clone()));
            }
        }
        self.db.get_leaf_bytes(index)?.map(|b| L::from_bytes(&b)).transpose()
    }

    pub fn put_leaf(&mut self, index: u64, leaf: L) {
        self.pending.leaves.insert(index, leaf);
    }

    pub fn get_meta(&self, include_uncommitted: bool) -> Result<Option<TreeMeta>, StoreError> {
        if include_uncommitted {
            if let Some(meta) = self.pending.meta {
                return Ok(Some(meta));
            }
        }
        self.db.get_meta()
    }

    pub fn set_meta(&mut self, meta: TreeMeta) {
        self.pending.meta = Some(meta);
    }

    /// Exact secondary-index lookup, overlay first.
    pub fn find_key(&self, key: Fr, include_uncommitted: bool) -> Result<Option<u64>, StoreError> {
        if include_uncommitted {
            if let Some(index) = self.pending.key_index.get(&key) {
                return Ok(Some(*index));
            }
        }
        self.db.find_key(key)
    }

    pub fn put_key(&mut self, key: Fr, index: u64) {
        self.pending.key_index.insert(key, index);
    }

    /// Greatest key `<= key` across the overlay and the persistent index.
    /// Keys are never removed, so the larger of the two candidates wins.
    pub fn lower_bound_key(
        &self,
        key: Fr,
        include_uncommitted: bool,
    ) -> Result<Option<(Fr, u64)>, StoreError> {
        let persisted = self.db.lower_bound_key(key)?;
        if !include_uncommitted {
            return Ok(persisted);
        }
        let pending = self
            .pending
            .key_index
            .range(..=key)
            .next_back()
            .map(|(k, v)| (*k, *v));
        Ok(match (pending, persisted) {
            (Some(a), Some(b)) => Some(if a.0 >= b.0 { a } else { b }),
            (Some(a), None) => Some(a),
            (None, b) => b,
        })
    }

    /// Snapshot of the overlay for later restoration.
    pub fn checkpoint(&self) -> OverlayCheckpoint<L> {
        OverlayCheckpoint(self.pending.clone())
    }

    /// Reinstates a previously captured overlay snapshot.
    pub fn restore(&mut self, checkpoint: OverlayCheckpoint<L>) {
        self.pending = checkpoint.0;
    }

    /// Writes every overlay entry into `txn`. The overlay itself is left
    /// untouched; call [`clear_pending`](Self::clear_pending) once the
    /// transaction has committed.
    pub fn write_pending(&self, txn: &WriteTransaction) -> Result<(), StoreError> {
        for (node, value) in &self.pending.nodes {
            self.db.put_node(txn, *node, *value)?;
        }
        for (index, leaf) in &self.pending.leaves {
            self.db.put_leaf_bytes(txn, *index, &leaf.to_bytes())?;
        }
        for (key, index) in &self.pending.key_index {
            self.db.put_key(txn, *key, *index)?;
        }
        if let Some(meta) = &self.pending.meta {
            self.db.put_meta(txn, meta)?;
        }
        Ok(())
    }

    pub fn clear_pending(&mut self) {
        self.pending = PendingState::default();
    }

    /// Flushes the overlay as a single atomic batch. On failure the overlay
    /// is preserved and the error surfaces to the caller.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        let txn = self.db.env().begin_write()?;
        self.write_pending(&txn)?;
        txn.commit().map_err(StoreError::backend)?;
        self.clear_pending();
        Ok(())
    }

    /// Drops the overlay. Committed data is untouched.
    pub fn rollback(&mut self) {
        self.clear_pending();
    }
}
