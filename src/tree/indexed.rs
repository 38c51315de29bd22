//! Indexed Merkle tree: a fixed-depth tree whose live leaves form a sorted
//! singly-linked list over their keys.
//!
//! The list is bootstrapped with sentinel leaves for keys 0 and 1, so every
//! real insertion has a well-defined predecessor (its "low leaf"). Insertion
//! re-threads the list: the new leaf inherits the predecessor's `next_*`
//! fields and the predecessor is pointed at the new leaf. Batch insertion
//! applies the same rule in descending key order while resolving
//! predecessors through the uncommitted overlay, so earlier insertions of
//! the same batch are visible to later ones.

use crate::error::{StoreError, WorldStateError};
use crate::field::{empty_subtree_root, Fr};
use crate::store::CachedTreeStore;
use crate::tree::leaf::{IndexedLeaf, IndexedLeafValue};
use crate::tree::{propagate_dirty, sibling_path};
use crate::types::{NodeRef, TreeMeta};
use serde::{Deserialize, Serialize};

/// The state of a predecessor leaf at the moment one insertion was applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowLeafWitness<V> {
    pub index: u64,
    /// The low leaf as it was *before* this insertion modified it.
    pub leaf: IndexedLeaf<V>,
}

/// Outcome of a batch insertion.
///
/// `witnesses[i]` belongs to the `i`-th insertion performed, i.e. the order
/// of `sorted_leaves` (descending by key). `sorted_leaves[i].1` is the
/// position of that value in the caller's input, which also fixes its tree
/// position: `pre_batch_size + original_index`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInsertResult<V> {
    pub witnesses: Vec<LowLeafWitness<V>>,
    pub sorted_leaves: Vec<(V, u64)>,
}

pub struct IndexedTree<V: IndexedLeafValue> {
    store: CachedTreeStore<IndexedLeaf<V>>,
    depth: u32,
}

impl<V: IndexedLeafValue> IndexedTree<V> {
    /// Opens the tree, prefilling and committing the two sentinel leaves if
    /// the underlying store has never been initialized.
    pub fn new(store: CachedTreeStore<IndexedLeaf<V>>, depth: u32) -> Result<Self, WorldStateError> {
        let mut tree = IndexedTree { store, depth };
        if !tree.store.is_initialized()? {
            tree.prefill()?;
        }
        Ok(tree)
    }

    fn prefill(&mut self) -> Result<(), WorldStateError> {
        let one = Fr::from_u64(1);
        let head = IndexedLeaf::new(V::sentinel(Fr::ZERO), 1, one);
        let tail = IndexedLeaf::new(V::sentinel(one), 0, Fr::ZERO);

        self.write_leaf(0, head);
        self.write_leaf(1, tail);
        self.store.put_key(Fr::ZERO, 0);
        self.store.put_key(one, 1);

        let root = propagate_dirty(&mut self.store, self.depth, vec![0, 1])?;
        self.store.set_meta(TreeMeta { root, size: 2 });
        self.store.commit()?;
        Ok(())
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn meta(&self, include_uncommitted: bool) -> Result<TreeMeta, StoreError> {
        Ok(self
            .store
            .get_meta(include_uncommitted)?
            .unwrap_or(TreeMeta {
                root: empty_subtree_root(self.depth),
                size: 0,
            }))
    }

    /// Buffers a leaf and its leaf-level node hash.
    fn write_leaf(&mut self, index: u64, leaf: IndexedLeaf<V>) {
        self.store.put_node(NodeRef::new(self.depth, index), leaf.hash());
        self.store.put_leaf(index, leaf);
    }

    /// The live leaf with the greatest key `<= key`.
    pub fn find_low_leaf(
        &self,
        key: Fr,
        include_uncommitted: bool,
    ) -> Result<(u64, IndexedLeaf<V>), WorldStateError> {
        let (_, index) = self
            .store
            .lower_bound_key(key, include_uncommitted)?
            .ok_or_else(|| StoreError::corrupt("keys", "indexed tree is missing its sentinels"))?;
        let leaf = self
            .store
            .get_leaf(index, include_uncommitted)?
            .ok_or_else(|| {
                StoreError::corrupt("leaves", format!("key index points at empty leaf {index}"))
            })?;
        Ok((index, leaf))
    }

    /// Inserts one value, returning the predecessor witness.
    ///
    /// An existing key updates the leaf in place when the value type allows
    /// it (public data) and is rejected otherwise (nullifiers). Updates do
    /// not change the tree size.
    pub fn insert(&mut self, value: &V) -> Result<LowLeafWitness<V>, WorldStateError> {
        let meta = self.meta(true)?;
        let key = value.key();
        let (low_index, low_leaf) = self.find_low_leaf(key, true)?;

        if low_leaf.key() == key {
            if !V::UPDATABLE {
                return Err(WorldStateError::DuplicateKey(key));
            }
            let witness = LowLeafWitness {
                index: low_index,
                leaf: low_leaf.clone(),
            };
            let mut updated = low_leaf;
            updated.value.update_payload(value);
            self.write_leaf(low_index, updated);
            // The key is unchanged, so the secondary index needs no rewrite.
            debug_assert_eq!(self.store.find_key(key, true)?, Some(low_index));

            let root = propagate_dirty(&mut self.store, self.depth, vec![low_index])?;
            self.store.set_meta(TreeMeta {
                root,
                size: meta.size,
            });
            return Ok(witness);
        }

        if meta.size + 1 > 1u64 << self.depth {
            return Err(WorldStateError::TreeFull {
                size: meta.size,
                appended: 1,
                depth: self.depth,
            });
        }

        let new_index = meta.size;
        let witness = LowLeafWitness {
            index: low_index,
            leaf: low_leaf.clone(),
        };

        let new_leaf = IndexedLeaf::new(value.clone(), low_leaf.next_index, low_leaf.next_value);
        let mut updated_low = low_leaf;
        updated_low.next_index = new_index;
        updated_low.next_value = key;

        self.write_leaf(low_index, updated_low);
        self.write_leaf(new_index, new_leaf);
        self.store.put_key(key, new_index);

        let root = propagate_dirty(&mut self.store, self.depth, vec![low_index, new_index])?;
        self.store.set_meta(TreeMeta {
            root,
            size: meta.size + 1,
        });
        Ok(witness)
    }

    /// Inserts a batch of values in descending key order.
    ///
    /// Tree positions are fixed up front (`size + original_index`) and the
    /// size always advances by the batch length; a same-key public-data
    /// entry rewrites the existing leaf and leaves its pre-assigned position
    /// empty. Nullifier batches are validated before any mutation, so a
    /// duplicate rejects the whole batch with the overlay untouched.
    pub fn batch_insert(&mut self, values: &[V]) -> Result<BatchInsertResult<V>, WorldStateError> {
        if values.is_empty() {
            return Ok(BatchInsertResult {
                witnesses: Vec::new(),
                sorted_leaves: Vec::new(),
            });
        }

        let meta = self.meta(true)?;
        let appended = values.len() as u64;
        if meta.size + appended > 1u64 << self.depth {
            return Err(WorldStateError::TreeFull {
                size: meta.size,
                appended,
                depth: self.depth,
            });
        }

        // Stable descending sort: equal keys keep their input order.
        let mut order: Vec<(V, u64)> = values.iter().cloned().zip(0u64..).collect();
        order.sort_by(|a, b| b.0.key().cmp(&a.0.key()));

        if !V::UPDATABLE {
            for pair in order.windows(2) {
                if pair[0].0.key() == pair[1].0.key() {
                    return Err(WorldStateError::DuplicateKey(pair[0].0.key()));
                }
            }
            for (value, _) in &order {
                if self.store.find_key(value.key(), true)?.is_some() {
                    return Err(WorldStateError::DuplicateKey(value.key()));
                }
            }
        }

        let mut witnesses = Vec::with_capacity(values.len());
        let mut dirty = Vec::with_capacity(values.len() * 2);

        for (value, original_index) in &order {
            let key = value.key();
            let new_index = meta.size + original_index;
            let (low_index, low_leaf) = self.find_low_leaf(key, true)?;
            witnesses.push(LowLeafWitness {
                index: low_index,
                leaf: low_leaf.clone(),
            });

            if low_leaf.key() == key {
                let mut updated = low_leaf;
                updated.value.update_payload(value);
                self.write_leaf(low_index, updated);
                dirty.push(low_index);
            } else {
                let new_leaf =
                    IndexedLeaf::new(value.clone(), low_leaf.next_index, low_leaf.next_value);
                let mut updated_low = low_leaf;
                updated_low.next_index = new_index;
                updated_low.next_value = key;

                self.write_leaf(low_index, updated_low);
                self.write_leaf(new_index, new_leaf);
                self.store.put_key(key, new_index);
                dirty.push(low_index);
                dirty.push(new_index);
            }
        }

        dirty.sort_unstable();
        dirty.dedup();
        let root = propagate_dirty(&mut self.store, self.depth, dirty)?;
        self.store.set_meta(TreeMeta {
            root,
            size: meta.size + appended,
        });

        Ok(BatchInsertResult {
            witnesses,
            sorted_leaves: order,
        })
    }

    pub fn get_leaf(
        &self,
        index: u64,
        include_uncommitted: bool,
    ) -> Result<Option<IndexedLeaf<V>>, StoreError> {
        self.store.get_leaf(index, include_uncommitted)
    }

    /// Index of a leaf holding exactly `value`, if one exists at or after
    /// `from_index`. Resolved through the secondary index, not a scan.
    pub fn find_leaf_index(
        &self,
        value: &V,
        from_index: u64,
        include_uncommitted: bool,
    ) -> Result<Option<u64>, StoreError> {
        let Some(index) = self.store.find_key(value.key(), include_uncommitted)? else {
            return Ok(None);
        };
        if index < from_index {
            return Ok(None);
        }
        match self.store.get_leaf(index, include_uncommitted)? {
            Some(leaf) if leaf.value == *value => Ok(Some(index)),
            _ => Ok(None),
        }
    }

    pub fn sibling_path(
        &self,
        index: u64,
        include_uncommitted: bool,
    ) -> Result<Vec<Fr>, StoreError> {
        sibling_path(&self.store, self.depth, index, include_uncommitted)
    }

    pub(crate) fn store(&self) -> &CachedTreeStore<IndexedLeaf<V>> {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut CachedTreeStore<IndexedLeaf<V>> {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TreeDb, TreeEnvironment};
    use crate::tree::leaf::{NullifierLeafValue, PublicDataLeafValue};
    use crate::tree::testing::rehash_path;
    use rand::prelude::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn nullifier_tree(depth: u32) -> (TempDir, IndexedTree<NullifierLeafValue>) {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(TreeEnvironment::open(dir.path(), 1024).unwrap());
        let db = TreeDb::new(env, "nullifier_test").unwrap();
        let tree = IndexedTree::new(CachedTreeStore::new(db), depth).unwrap();
        (dir, tree)
    }

    fn public_data_tree(depth: u32) -> (TempDir, IndexedTree<PublicDataLeafValue>) {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(TreeEnvironment::open(dir.path(), 1024).unwrap());
        let db = TreeDb::new(env, "public_data_test").unwrap();
        let tree = IndexedTree::new(CachedTreeStore::new(db), depth).unwrap();
        (dir, tree)
    }

    fn nf(value: u64) -> NullifierLeafValue {
        NullifierLeafValue::new(Fr::from_u64(value))
    }

    /// Walks the linked list from the sentinel head and checks it visits
    /// every live leaf exactly once in strictly ascending key order.
    fn assert_list_well_formed<V: IndexedLeafValue>(tree: &IndexedTree<V>, live_leaves: u64) {
        let mut visited = 0u64;
        let mut index = 0u64;
        let mut previous_key = None;
        loop {
            let leaf = tree.get_leaf(index, true).unwrap().expect("list hit an empty leaf");
            if let Some(previous) = previous_key {
                assert!(leaf.key() > previous, "keys must strictly ascend");
            }
            previous_key = Some(leaf.key());
            visited += 1;
            if leaf.next_index == 0 {
                break;
            }
            index = leaf.next_index;
        }
        assert_eq!(visited, live_leaves);
    }

    /// A fresh tree holds exactly the two committed sentinels.
    #[test]
    fn test_prefill() {
        let (_dir, tree) = nullifier_tree(8);
        let meta = tree.meta(false).unwrap();
        assert_eq!(meta.size, 2);

        let head = tree.get_leaf(0, false).unwrap().unwrap();
        assert_eq!(head, IndexedLeaf::new(nf(0), 1, Fr::from_u64(1)));
        let tail = tree.get_leaf(1, false).unwrap().unwrap();
        assert_eq!(tail, IndexedLeaf::new(nf(1), 0, Fr::ZERO));
        assert_eq!(tree.get_leaf(2, false).unwrap(), None);

        // Reopening must not prefill again.
        assert!(tree.store().is_initialized().unwrap());
    }

    /// Predecessor search and insertion re-thread the list as expected.
    #[test]
    fn test_insert_rethreads_list() {
        let (_dir, mut tree) = nullifier_tree(8);

        let (index, low) = tree.find_low_leaf(Fr::from_u64(42), true).unwrap();
        assert_eq!(index, 1);
        assert_eq!(low, IndexedLeaf::new(nf(1), 0, Fr::ZERO));

        let witness = tree.insert(&nf(42)).unwrap();
        assert_eq!(witness.index, 1);
        assert_eq!(witness.leaf, IndexedLeaf::new(nf(1), 0, Fr::ZERO));

        assert_eq!(
            tree.get_leaf(2, true).unwrap().unwrap(),
            IndexedLeaf::new(nf(42), 0, Fr::ZERO)
        );
        assert_eq!(
            tree.get_leaf(1, true).unwrap().unwrap(),
            IndexedLeaf::new(nf(1), 2, Fr::from_u64(42))
        );

        let (_, low_of_43) = tree.find_low_leaf(Fr::from_u64(43), true).unwrap();
        assert_eq!(low_of_43, IndexedLeaf::new(nf(42), 0, Fr::ZERO));

        assert_eq!(tree.meta(true).unwrap().size, 3);
        assert_list_well_formed(&tree, 3);
    }

    /// Duplicate nullifiers are rejected without disturbing the tree.
    #[test]
    fn test_duplicate_rejection() {
        let (_dir, mut tree) = nullifier_tree(8);
        tree.insert(&nf(42)).unwrap();
        let before = tree.meta(true).unwrap();

        let err = tree.insert(&nf(42)).unwrap_err();
        assert!(matches!(err, WorldStateError::DuplicateKey(k) if k == Fr::from_u64(42)));

        assert_eq!(tree.meta(true).unwrap(), before);
        assert_list_well_formed(&tree, 3);
    }

    /// Batch insertion performs insertions in descending key order and
    /// reports witnesses in that order.
    #[test]
    fn test_batch_witness_order() {
        let (_dir, mut tree) = nullifier_tree(8);
        let result = tree.batch_insert(&[nf(50), nf(42), nf(80)]).unwrap();

        assert_eq!(
            result.sorted_leaves,
            vec![(nf(80), 2), (nf(50), 0), (nf(42), 1)]
        );

        // 80 lands at index 4 (2 + 2); its predecessor is sentinel 1,
        // still pointing at the list head.
        assert_eq!(result.witnesses[0].index, 1);
        assert_eq!(result.witnesses[0].leaf, IndexedLeaf::new(nf(1), 0, Fr::ZERO));

        // 50 lands at index 2 (2 + 0); sentinel 1 now points at 80.
        assert_eq!(result.witnesses[1].index, 1);
        assert_eq!(
            result.witnesses[1].leaf,
            IndexedLeaf::new(nf(1), 4, Fr::from_u64(80))
        );

        // 42 lands at index 3 (2 + 1); sentinel 1 now points at 50.
        assert_eq!(result.witnesses[2].index, 1);
        assert_eq!(
            result.witnesses[2].leaf,
            IndexedLeaf::new(nf(1), 2, Fr::from_u64(50))
        );

        assert_eq!(tree.meta(true).unwrap().size, 5);
        assert_list_well_formed(&tree, 5);
    }

    /// A batch with an in-batch or already-present duplicate leaves the
    /// overlay untouched.
    #[test]
    fn test_batch_duplicate_is_atomic() {
        let (_dir, mut tree) = nullifier_tree(8);
        tree.insert(&nf(7)).unwrap();
        let before = tree.meta(true).unwrap();

        assert!(tree.batch_insert(&[nf(10), nf(10)]).is_err());
        assert!(tree.batch_insert(&[nf(11), nf(7)]).is_err());

        assert_eq!(tree.meta(true).unwrap(), before);
        assert_eq!(tree.get_leaf(3, true).unwrap(), None);
        assert!(tree.store().find_key(Fr::from_u64(10), true).unwrap().is_none());
    }

    /// Batch insertion and one-at-a-time insertion agree on the final root.
    #[test]
    fn test_batch_matches_sequential() {
        let mut rng = StdRng::seed_from_u64(7);
        let values: Vec<NullifierLeafValue> = (0..24)
            .map(|_| nf(rng.gen_range(2u64..1_000_000)))
            .collect();

        let (_dir_a, mut batched) = nullifier_tree(12);
        batched.batch_insert(&values).unwrap();

        let (_dir_b, mut sequential) = nullifier_tree(12);
        for value in &values {
            sequential.insert(value).unwrap();
        }

        assert_eq!(
            batched.meta(true).unwrap().root,
            sequential.meta(true).unwrap().root
        );
        assert_eq!(
            batched.meta(true).unwrap().size,
            sequential.meta(true).unwrap().size
        );
        assert_list_well_formed(&batched, 2 + values.len() as u64);
    }

    /// Writing an existing slot mutates the leaf in place: same position,
    /// same size, new payload, new root.
    #[test]
    fn test_public_data_update_in_place() {
        let (_dir, mut tree) = public_data_tree(8);
        let slot = Fr::from_u64(42);

        tree.insert(&PublicDataLeafValue::new(slot, Fr::ZERO)).unwrap();
        let before = tree.meta(true).unwrap();
        assert_eq!(before.size, 3);

        let witness = tree
            .insert(&PublicDataLeafValue::new(slot, Fr::from_u64(1)))
            .unwrap();
        assert_eq!(witness.index, 2);
        assert_eq!(witness.leaf.value, PublicDataLeafValue::new(slot, Fr::ZERO));

        let after = tree.meta(true).unwrap();
        assert_eq!(after.size, 3);
        assert_ne!(after.root, before.root);
        assert_eq!(
            tree.get_leaf(2, true).unwrap().unwrap().value,
            PublicDataLeafValue::new(slot, Fr::from_u64(1))
        );
        assert_list_well_formed(&tree, 3);
    }

    /// An in-batch update consumes no live position: the size still
    /// advances, but the reserved index stays empty.
    #[test]
    fn test_batch_update_leaves_position_empty() {
        let (_dir, mut tree) = public_data_tree(8);
        tree.insert(&PublicDataLeafValue::new(Fr::from_u64(5), Fr::ZERO))
            .unwrap();

        let result = tree
            .batch_insert(&[
                PublicDataLeafValue::new(Fr::from_u64(9), Fr::from_u64(1)),
                PublicDataLeafValue::new(Fr::from_u64(5), Fr::from_u64(2)),
            ])
            .unwrap();
        assert_eq!(result.witnesses.len(), 2);

        let meta = tree.meta(true).unwrap();
        assert_eq!(meta.size, 5);
        // Position 4 was reserved for the slot-5 update and stays empty.
        assert_eq!(tree.get_leaf(4, true).unwrap(), None);
        assert_eq!(
            tree.get_leaf(2, true).unwrap().unwrap().value,
            PublicDataLeafValue::new(Fr::from_u64(5), Fr::from_u64(2))
        );
        assert_list_well_formed(&tree, 4);
    }

    /// Sibling paths of indexed leaves rehash to the root.
    #[test]
    fn test_sibling_path_rehashes() {
        let (_dir, mut tree) = nullifier_tree(8);
        tree.batch_insert(&[nf(50), nf(42), nf(80)]).unwrap();
        let root = tree.meta(true).unwrap().root;

        for index in 0..5 {
            let leaf = tree.get_leaf(index, true).unwrap().unwrap();
            let path = tree.sibling_path(index, true).unwrap();
            assert_eq!(path.len(), 8);
            assert_eq!(rehash_path(leaf.hash(), index, &path), root);
        }
    }

    /// `find_leaf_index` honors exact matches and the start bound.
    #[test]
    fn test_find_leaf_index() {
        let (_dir, mut tree) = public_data_tree(8);
        let leaf = PublicDataLeafValue::new(Fr::from_u64(42), Fr::from_u64(7));
        tree.insert(&leaf).unwrap();

        assert_eq!(tree.find_leaf_index(&leaf, 0, true).unwrap(), Some(2));
        assert_eq!(tree.find_leaf_index(&leaf, 3, true).unwrap(), None);
        // Same slot, different payload: no exact match.
        let other = PublicDataLeafValue::new(Fr::from_u64(42), Fr::from_u64(8));
        assert_eq!(tree.find_leaf_index(&other, 0, true).unwrap(), None);
        // Committed view does not see the uncommitted insert.
        assert_eq!(tree.find_leaf_index(&leaf, 0, false).unwrap(), None);
    }
}
