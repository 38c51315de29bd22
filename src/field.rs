//! Field elements and the tree hash policy.
//!
//! The engine treats its hash as a pure two-to-one function over 254-bit
//! field elements. Elements are stored canonically reduced, compare with
//! plain big-integer ordering, and serialize as 32 little-endian bytes.

use alloy_primitives::U256;
use derive_more::Deref;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Order of the BN254 scalar field. Every [`Fr`] is reduced modulo this.
pub const FIELD_MODULUS: U256 = U256::from_limbs([
    0x43e1f593f0000001,
    0x2833e84879b97091,
    0xb85045b68181585d,
    0x30644e72e131a029,
]);

/// Deepest tree the zero-subtree table covers.
pub const MAX_TREE_DEPTH: u32 = 64;

/// A canonical-form 254-bit field element.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deref)]
pub struct Fr(U256);

impl Fr {
    pub const ZERO: Fr = Fr(U256::ZERO);

    /// Reduces an arbitrary 256-bit value into the field.
    pub fn new(value: U256) -> Self {
        Fr(value % FIELD_MODULUS)
    }

    pub fn from_u64(value: u64) -> Self {
        Fr(U256::from(value))
    }

    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self::new(U256::from_le_bytes(bytes))
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self::new(U256::from_be_bytes(bytes))
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    /// Big-endian form; lexicographic byte order equals numeric order, which
    /// is what the sorted secondary index relies on.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == U256::ZERO
    }
}

impl From<u64> for Fr {
    fn from(value: u64) -> Self {
        Fr::from_u64(value)
    }
}

impl std::fmt::Debug for Fr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}

impl std::fmt::Display for Fr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}

impl Serialize for Fr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_le_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Ok(Fr::from_le_bytes(bytes))
    }
}

/// Two-to-one compression of a pair of field elements.
pub fn hash_pair(left: Fr, right: Fr) -> Fr {
    let mut hasher = Sha256::new();
    hasher.update(left.to_le_bytes());
    hasher.update(right.to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    Fr::from_le_bytes(digest)
}

/// Roots of fully-empty subtrees, indexed by subtree height.
///
/// `table[0]` is the empty leaf, `table[h + 1] = H(table[h], table[h])`.
static EMPTY_SUBTREE_ROOTS: Lazy<Vec<Fr>> = Lazy::new(|| {
    let mut table = Vec::with_capacity(MAX_TREE_DEPTH as usize + 1);
    table.push(Fr::ZERO);
    for height in 0..MAX_TREE_DEPTH as usize {
        let child = table[height];
        table.push(hash_pair(child, child));
    }
    table
});

/// Root of an empty subtree of the given height (0 = a single empty leaf).
pub fn empty_subtree_root(height: u32) -> Fr {
    EMPTY_SUBTREE_ROOTS[height as usize]
}
