//! Leaf values stored in indexed trees.

use crate::error::StoreError;
use crate::field::{hash_pair, Fr};
use crate::store::TreeLeaf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A value an indexed tree can hold.
///
/// The key orders the tree's linked list; the payload is the rest of the
/// record. The same-key policy distinguishes the two tree flavors: public
/// data updates the existing leaf in place, nullifiers reject duplicates.
pub trait IndexedLeafValue:
    Clone + std::fmt::Debug + PartialEq + Eq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Whether inserting an existing key rewrites that leaf's payload
    /// instead of failing.
    const UPDATABLE: bool;

    /// Length of the fixed on-disk encoding.
    const ENCODED_LEN: usize;

    fn key(&self) -> Fr;

    fn payload(&self) -> Fr;

    /// Builds the synthetic leaf used to prefill index 0 and 1.
    fn sentinel(key: Fr) -> Self;

    /// Replaces this value's payload with `other`'s (same key).
    fn update_payload(&mut self, other: &Self);

    fn write_bytes(&self, out: &mut Vec<u8>);

    fn read_bytes(bytes: &[u8]) -> Result<Self, StoreError>;
}

fn read_fr(table: &str, bytes: &[u8], at: usize) -> Result<Fr, StoreError> {
    let array: [u8; 32] = bytes
        .get(at..at + 32)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StoreError::corrupt(table, "truncated leaf record"))?;
    Ok(Fr::from_le_bytes(array))
}

/// A nullifier. The key is the value itself; live nullifiers are unique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullifierLeafValue {
    pub value: Fr,
}

impl NullifierLeafValue {
    pub fn new(value: Fr) -> Self {
        NullifierLeafValue { value }
    }
}

impl IndexedLeafValue for NullifierLeafValue {
    const UPDATABLE: bool = false;
    const ENCODED_LEN: usize = 32;

    fn key(&self) -> Fr {
        self.value
    }

    fn payload(&self) -> Fr {
        Fr::ZERO
    }

    fn sentinel(key: Fr) -> Self {
        NullifierLeafValue { value: key }
    }

    fn update_payload(&mut self, _other: &Self) {
        unreachable!("nullifier leaves are never updated in place");
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
    }

    fn read_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(NullifierLeafValue {
            value: read_fr("nullifier_leaves", bytes, 0)?,
        })
    }
}

/// A public-data slot/value pair. The key is the slot; writing an existing
/// slot mutates its leaf in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicDataLeafValue {
    pub slot: Fr,
    pub value: Fr,
}

impl PublicDataLeafValue {
    pub fn new(slot: Fr, value: Fr) -> Self {
        PublicDataLeafValue { slot, value }
    }
}

impl IndexedLeafValue for PublicDataLeafValue {
    const UPDATABLE: bool = true;
    const ENCODED_LEN: usize = 64;

    fn key(&self) -> Fr {
        self.slot
    }

    fn payload(&self) -> Fr {
        self.value
    }

    fn sentinel(key: Fr) -> Self {
        PublicDataLeafValue {
            slot: key,
            value: Fr::ZERO,
        }
    }

    fn update_payload(&mut self, other: &Self) {
        self.value = other.value;
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.slot.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
    }

    fn read_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(PublicDataLeafValue {
            slot: read_fr("public_data_leaves", bytes, 0)?,
            value: read_fr("public_data_leaves", bytes, 32)?,
        })
    }
}

/// A stored indexed leaf: the value plus its position in the sorted linked
/// list. `next_index = 0` and `next_value = 0` mark the tail, wrapping back
/// to the sentinel head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedLeaf<V> {
    pub value: V,
    pub next_index: u64,
    pub next_value: Fr,
}

impl<V: IndexedLeafValue> IndexedLeaf<V> {
    pub fn new(value: V, next_index: u64, next_value: Fr) -> Self {
        IndexedLeaf {
            value,
            next_index,
            next_value,
        }
    }

    pub fn key(&self) -> Fr {
        self.value.key()
    }

    /// Leaf hash: a two-level fold of the four fields. Writer and
    /// sibling-path consumer must agree on this shape.
    pub fn hash(&self) -> Fr {
        hash_pair(
            hash_pair(self.value.key(), self.value.payload()),
            hash_pair(Fr::from(self.next_index), self.next_value),
        )
    }
}

impl<V: IndexedLeafValue> TreeLeaf for IndexedLeaf<V> {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(V::ENCODED_LEN + 40);
        self.value.write_bytes(&mut out);
        out.extend_from_slice(&self.next_index.to_le_bytes());
        out.extend_from_slice(&self.next_value.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != V::ENCODED_LEN + 40 {
            return Err(StoreError::corrupt(
                "leaves",
                format!(
                    "indexed leaf record has {} bytes, expected {}",
                    bytes.len(),
                    V::ENCODED_LEN + 40
                ),
            ));
        }
        let value = V::read_bytes(&bytes[..V::ENCODED_LEN])?;
        let next_index = u64::from_le_bytes(
            bytes[V::ENCODED_LEN..V::ENCODED_LEN + 8]
                .try_into()
                .expect("slice length checked above"),
        );
        let next_value = read_fr("leaves", bytes, V::ENCODED_LEN + 8)?;
        Ok(IndexedLeaf {
            value,
            next_index,
            next_value,
        })
    }
}
