//! B-tree index over pluggable node storage.
//!
//! The tree algorithms never hold node references across calls; they work on
//! node ids and resolve them through a [`NodeManager`]. Two managers exist:
//!
//! - [`MemoryNodeManager`]: nodes in a map, nothing persisted
//! - [`DiskNodeManager`]: one record per node in a [`RecordStorage`], with an
//!   LRU of clean nodes and a pinned set of dirty ones
//!
//! # Usage
//!
//! ```
//! use engine::storage::btree::{MemoryNodeManager, Tree};
//!
//! let mut tree = Tree::new(MemoryNodeManager::new(2), false);
//! for key in [5, 1, 9, 3] {
//!     tree.insert(key, key * 10).unwrap();
//! }
//!
//! assert_eq!(tree.get(&3).unwrap(), Some((3, 30)));
//! let above: Vec<i32> = tree
//!     .larger_than(&3)
//!     .unwrap()
//!     .map(|entry| entry.unwrap().0)
//!     .collect();
//! assert_eq!(above, vec![5, 9]);
//! ```
//!
//! [`RecordStorage`]: crate::storage::RecordStorage

mod codec;
mod disk;
mod error;
mod iter;
mod manager;
mod memory;
mod node;
mod serializer;
mod tree;

pub use codec::{Codec, I32Codec, I64Codec, StringCodec, U32Codec};
pub use disk::{
    DEFAULT_MIN_ENTRIES_PER_NODE, DEFAULT_NODE_CACHE_CAPACITY, DiskNodeManager,
    ROOT_POINTER_RECORD,
};
pub use error::{CodecError, TreeError};
pub use iter::{Direction, TreeIterator};
pub use manager::{KeyComparer, NodeManager, default_comparer};
pub use memory::MemoryNodeManager;
pub use node::{NodeId, Occurrence, SearchResult, TreeNode};
pub use serializer::{MAX_SERIALIZED_NODE_SIZE, NodeSerializer};
pub use tree::Tree;
