//! Persistent key-value environment.
//!
//! One [`TreeEnvironment`] wraps a single redb database file. Each tree owns
//! a [`TreeDb`]: a family of four named tables inside that environment
//! (`<name>_meta`, `<name>_nodes`, `<name>_leaves`, `<name>_keys`). Reads go
//! through short-lived read transactions (consistent snapshots); writes go
//! through caller-managed write transactions so that several trees can share
//! one atomic batch.

use crate::constant::WORLD_STATE_DB_FILE;
use crate::error::StoreError;
use crate::field::Fr;
use crate::types::{NodeRef, TreeMeta};
use redb::{Builder, Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;

/// Key of the single metadata record inside a `_meta` table.
const META_KEY: &[u8] = b"meta";

/// Shared handle to the on-disk environment.
pub struct TreeEnvironment {
    db: Database,
}

impl TreeEnvironment {
    /// Opens (or creates) the environment inside `dir`. `map_size_kb` bounds
    /// the page cache.
    pub fn open(dir: &Path, map_size_kb: u32) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let db = Builder::new()
            .set_cache_size(map_size_kb as usize * 1024)
            .create(dir.join(WORLD_STATE_DB_FILE))
            .map_err(StoreError::backend)?;
        tracing::debug!(dir = %dir.display(), map_size_kb, "opened world state environment");
        Ok(TreeEnvironment { db })
    }

    pub fn begin_read(&self) -> Result<ReadTransaction<'_>, StoreError> {
        self.db.begin_read().map_err(StoreError::backend)
    }

    pub fn begin_write(&self) -> Result<WriteTransaction<'_>, StoreError> {
        self.db.begin_write().map_err(StoreError::backend)
    }
}

/// The named databases belonging to one tree.
pub struct TreeDb {
    env: Arc<TreeEnvironment>,
    meta_table: String,
    nodes_table: String,
    leaves_table: String,
    keys_table: String,
}

fn node_key(node: NodeRef) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&node.level.to_be_bytes());
    key[4..].copy_from_slice(&node.index.to_be_bytes());
    key
}

fn leaf_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn encode_meta(meta: &TreeMeta) -> [u8; 40] {
    let mut value = [0u8; 40];
    value[..32].copy_from_slice(&meta.root.to_le_bytes());
    value[32..].copy_from_slice(&meta.size.to_le_bytes());
    value
}

fn decode_meta(table: &str, bytes: &[u8]) -> Result<TreeMeta, StoreError> {
    if bytes.len() != 40 {
        return Err(StoreError::corrupt(
            table,
            format!("meta record has {} bytes, expected 40", bytes.len()),
        ));
    }
    let mut root = [0u8; 32];
    root.copy_from_slice(&bytes[..32]);
    let mut size = [0u8; 8];
    size.copy_from_slice(&bytes[32..]);
    Ok(TreeMeta {
        root: Fr::from_le_bytes(root),
        size: u64::from_le_bytes(size),
    })
}

fn decode_fr(table: &str, bytes: &[u8]) -> Result<Fr, StoreError> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        StoreError::corrupt(table, format!("field record has {} bytes", bytes.len()))
    })?;
    Ok(Fr::from_le_bytes(array))
}

fn decode_u64(table: &str, bytes: &[u8]) -> Result<u64, StoreError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        StoreError::corrupt(table, format!("index record has {} bytes", bytes.len()))
    })?;
    Ok(u64::from_le_bytes(array))
}

impl TreeDb {
    /// Binds the four tables for `name`, creating them if this is a fresh
    /// environment.
    pub fn new(env: Arc<TreeEnvironment>, name: &str) -> Result<Self, StoreError> {
        let db = TreeDb {
            env,
            meta_table: format!("{name}_meta"),
            nodes_table: format!("{name}_nodes"),
            leaves_table: format!("{name}_leaves"),
            keys_table: format!("{name}_keys"),
        };
        db.ensure_tables()?;
        Ok(db)
    }

    pub fn env(&self) -> &TreeEnvironment {
        &self.env
    }

    fn ensure_tables(&self) -> Result<(), StoreError> {
        let txn = self.env.begin_write()?;
        {
            for name in [
                &self.meta_table,
                &self.nodes_table,
                &self.leaves_table,
                &self.keys_table,
            ] {
                let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(name.as_str());
                txn.open_table(def).map_err(StoreError::backend)?;
            }
        }
        txn.commit().map_err(StoreError::backend)
    }

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.env.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table);
        let table = txn.open_table(def).map_err(StoreError::backend)?;
        let value = table
            .get(key)
            .map_err(StoreError::backend)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn put(
        &self,
        txn: &WriteTransaction,
        table: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table);
        let mut table = txn.open_table(def).map_err(StoreError::backend)?;
        table.insert(key, value).map_err(StoreError::backend)?;
        Ok(())
    }

    pub fn get_meta(&self) -> Result<Option<TreeMeta>, StoreError> {
        self.get(&self.meta_table, META_KEY)?
            .map(|bytes| decode_meta(&self.meta_table, &bytes))
            .transpose()
    }

    pub fn put_meta(&self, txn: &WriteTransaction, meta: &TreeMeta) -> Result<(), StoreError> {
        self.put(txn, &self.meta_table, META_KEY, &encode_meta(meta))
    }

    pub fn get_node(&self, node: NodeRef) -> Result<Option<Fr>, StoreError> {
        self.get(&self.nodes_table, &node_key(node))?
            .map(|bytes| decode_fr(&self.nodes_table, &bytes))
            .transpose()
    }

    pub fn put_node(
        &self,
        txn: &WriteTransaction,
        node: NodeRef,
        value: Fr,
    ) -> Result<(), StoreError> {
        self.put(txn, &self.nodes_table, &node_key(node), &value.to_le_bytes())
    }

    pub fn get_leaf_bytes(&self, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(&self.leaves_table, &leaf_key(index))
    }

    pub fn put_leaf_bytes(
        &self,
        txn: &WriteTransaction,
        index: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.put(txn, &self.leaves_table, &leaf_key(index), bytes)
    }

    /// Exact lookup in the sorted secondary index.
    pub fn find_key(&self, key: Fr) -> Result<Option<u64>, StoreError> {
        self.get(&self.keys_table, &key.to_be_bytes())?
            .map(|bytes| decode_u64(&self.keys_table, &bytes))
            .transpose()
    }

    /// Greatest indexed key `<= key`, with its leaf index. Keys are stored
    /// big-endian, so the table's order is numeric order and this is a
    /// single backwards step from the bound.
    pub fn lower_bound_key(&self, key: Fr) -> Result<Option<(Fr, u64)>, StoreError> {
        let txn = self.env.begin_read()?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(self.keys_table.as_str());
        let table = txn.open_table(def).map_err(StoreError::backend)?;
        let upper = key.to_be_bytes();
        let result = match table
            .range(..=upper.as_slice())
            .map_err(StoreError::backend)?
            .next_back()
        {
            Some(entry) => {
                let (found_key, found_index) = entry.map_err(StoreError::backend)?;
                let key_array: [u8; 32] = found_key.value().try_into().map_err(|_| {
                    StoreError::corrupt(&self.keys_table, "key record is not 32 bytes")
                })?;
                let index = decode_u64(&self.keys_table, found_index.value())?;
                Ok(Some((Fr::from_be_bytes(key_array), index)))
            }
            None => Ok(None),
        };
        result
    }

    pub fn put_key(&self, txn: &WriteTransaction, key: Fr, index: u64) -> Result<(), StoreError> {
        self.put(txn, &self.keys_table, &key.to_be_bytes(), &index.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, TreeDb) {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(TreeEnvironment::open(dir.path(), 1024).unwrap());
        let db = TreeDb::new(env, "test_tree").unwrap();
        (dir, db)
    }

    /// Meta, node and leaf records round-trip through a committed batch.
    #[test]
    fn test_record_round_trips() {
        let (_dir, db) = test_db();
        assert_eq!(db.get_meta().unwrap(), None);

        let meta = TreeMeta {
            root: Fr::from_u64(99),
            size: 7,
        };
        let node = NodeRef::new(3, 12);

        let txn = db.env().begin_write().unwrap();
        db.put_meta(&txn, &meta).unwrap();
        db.put_node(&txn, node, Fr::from_u64(1234)).unwrap();
        db.put_leaf_bytes(&txn, 5, &Fr::from_u64(42).to_le_bytes())
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(db.get_meta().unwrap(), Some(meta));
        assert_eq!(db.get_node(node).unwrap(), Some(Fr::from_u64(1234)));
        assert_eq!(db.get_node(NodeRef::new(3, 13)).unwrap(), None);
        assert_eq!(
            db.get_leaf_bytes(5).unwrap(),
            Some(Fr::from_u64(42).to_le_bytes().to_vec())
        );
    }

    /// A discarded write transaction leaves no trace.
    #[test]
    fn test_discarded_batch_is_invisible() {
        let (_dir, db) = test_db();
        {
            let txn = db.env().begin_write().unwrap();
            db.put_leaf_bytes(&txn, 0, b"pending").unwrap();
            // txn dropped without commit
        }
        assert_eq!(db.get_leaf_bytes(0).unwrap(), None);
    }

    /// The secondary index resolves reverse lower bounds in numeric order.
    #[test]
    fn test_lower_bound_key() {
        let (_dir, db) = test_db();
        let txn = db.env().begin_write().unwrap();
        for (key, index) in [(0u64, 0u64), (1, 1), (50, 2), (80, 3)] {
            db.put_key(&txn, Fr::from_u64(key), index).unwrap();
        }
        txn.commit().unwrap();

        assert_eq!(
            db.lower_bound_key(Fr::from_u64(42)).unwrap(),
            Some((Fr::from_u64(1), 1))
        );
        assert_eq!(
            db.lower_bound_key(Fr::from_u64(50)).unwrap(),
            Some((Fr::from_u64(50), 2))
        );
        assert_eq!(
            db.lower_bound_key(Fr::from_u64(1_000_000)).unwrap(),
            Some((Fr::from_u64(80), 3))
        );
        assert_eq!(db.find_key(Fr::from_u64(50)).unwrap(), Some(2));
        assert_eq!(db.find_key(Fr::from_u64(51)).unwrap(), None);
    }
}
