#![doc = include_str!("../README.md")]

pub mod constant;
pub mod dispatch;
pub mod error;
pub mod field;
pub mod message;
pub mod pool;
pub mod store;
pub mod tree;
pub mod types;
pub mod world;

pub use dispatch::{MessageDispatcher, OpFuture};
pub use error::{StoreError, WorldStateError};
pub use field::{empty_subtree_root, hash_pair, Fr};
pub use pool::WorkerPool;
pub use tree::{
    AppendOnlyTree, BatchInsertResult, IndexedLeaf, IndexedLeafValue, IndexedTree, LowLeafWitness,
    NullifierLeafValue, PublicDataLeafValue,
};
pub use types::{
    BlockData, Leaf, LeafPreimage, NodeRef, Revision, StateReference, TreeId, TreeInfo, TreeMeta,
};
pub use world::{BatchResult, IndexedLeaves, WorldState, WorldStateConfig};
