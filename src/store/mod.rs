//! Storage: the persistent key-value environment and the per-tree cached
//! store that layers uncommitted state on top of it.

pub mod cached;
pub mod env;

pub use cached::{CachedTreeStore, OverlayCheckpoint, TreeLeaf};
pub use env::{TreeDb, TreeEnvironment};
