//! Append-only Merkle tree of fixed depth.
//!
//! Leaves are written in strictly increasing index order and never change
//! afterwards; positions past the current size read as zero subtrees.

use crate::error::{StoreError, WorldStateError};
use crate::field::{empty_subtree_root, Fr};
use crate::store::CachedTreeStore;
use crate::tree::{propagate_dirty, sibling_path};
use crate::types::{NodeRef, TreeMeta};

pub struct AppendOnlyTree {
    store: CachedTreeStore<Fr>,
    depth: u32,
}

impl AppendOnlyTree {
    pub fn new(store: CachedTreeStore<Fr>, depth: u32) -> Self {
        AppendOnlyTree { store, depth }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Current metadata. A tree that has never committed and has no overlay
    /// reports the empty root and size zero.
    pub fn meta(&self, include_uncommitted: bool) -> Result<TreeMeta, StoreError> {
        Ok(self
            .store
            .get_meta(include_uncommitted)?
            .unwrap_or(TreeMeta {
                root: empty_subtree_root(self.depth),
                size: 0,
            }))
    }

    /// Appends `leaves` at positions `[size, size + leaves.len())` and
    /// returns the new `(root, size)`.
    pub fn append(&mut self, leaves: &[Fr]) -> Result<(Fr, u64), WorldStateError> {
        let meta = self.meta(true)?;
        if leaves.is_empty() {
            return Ok((meta.root, meta.size));
        }

        let appended = leaves.len() as u64;
        let capacity = 1u64 << self.depth;
        if meta.size + appended > capacity {
            return Err(WorldStateError::TreeFull {
                size: meta.size,
                appended,
                depth: self.depth,
            });
        }

        let mut dirty = Vec::with_capacity(leaves.len());
        for (offset, leaf) in leaves.iter().enumerate() {
            let index = meta.size + offset as u64;
            self.store.put_leaf(index, *leaf);
            self.store.put_node(NodeRef::new(self.depth, index), *leaf);
            dirty.push(index);
        }

        let root = propagate_dirty(&mut self.store, self.depth, dirty)?;
        let size = meta.size + appended;
        self.store.set_meta(TreeMeta { root, size });
        Ok((root, size))
    }

    pub fn get_leaf(
        &self,
        index: u64,
        include_uncommitted: bool,
    ) -> Result<Option<Fr>, StoreError> {
        self.store.get_leaf(index, include_uncommitted)
    }

    /// Index of the first leaf equal to `value` at or after `from_index`.
    /// Append-only leaves carry no ordering, so this is a linear scan.
    pub fn find_leaf(
        &self,
        value: Fr,
        from_index: u64,
        include_uncommitted: bool,
    ) -> Result<Option<u64>, StoreError> {
        let size = self.meta(include_uncommitted)?.size;
        for index in from_index..size {
            if self.store.get_leaf(index, include_uncommitted)? == Some(value) {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    pub fn sibling_path(
        &self,
        index: u64,
        include_uncommitted: bool,
    ) -> Result<Vec<Fr>, StoreError> {
        sibling_path(&self.store, self.depth, index, include_uncommitted)
    }

    pub(crate) fn store(&self) -> &CachedTreeStore<Fr> {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut CachedTreeStore<Fr> {
        &mut self.store
    }
}
