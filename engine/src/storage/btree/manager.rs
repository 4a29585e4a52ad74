//! The node storage seam the tree algorithms are written against.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::storage::btree::error::TreeError;
use crate::storage::btree::node::{NodeId, TreeNode};

/// Total order over keys, shared between a manager and its callers.
pub type KeyComparer<K> = Rc<dyn Fn(&K, &K) -> Ordering>;

/// A comparer using the key type's own ordering.
#[must_use]
pub fn default_comparer<K: Ord + 'static>() -> KeyComparer<K> {
    Rc::new(|a: &K, b: &K| a.cmp(b))
}

/// Owns tree nodes: creates, resolves, persists and discards them.
///
/// Structural algorithms only ever hold node ids and re-resolve them through
/// the manager, so an implementation is free to evict or reload nodes
/// between calls. Changes made through [`NodeManager::find_mut`] are only
/// guaranteed durable after [`NodeManager::save_changes`].
pub trait NodeManager<K, V> {
    /// Non-root nodes hold at least this many entries; nodes split above twice it.
    fn min_entries_per_node(&self) -> usize;

    fn key_comparer(&self) -> &KeyComparer<K>;

    fn compare_keys(&self, a: &K, b: &K) -> Ordering {
        (self.key_comparer())(a, b)
    }

    /// Compare two full entries by key only.
    fn compare_entries(&self, a: &(K, V), b: &(K, V)) -> Ordering {
        self.compare_keys(&a.0, &b.0)
    }

    fn root_id(&self) -> NodeId;

    /// Create a node with no parent and return its id.
    fn create(&mut self, entries: Vec<(K, V)>, children: Vec<NodeId>) -> Result<NodeId, TreeError>;

    /// Resolve a node for reading.
    ///
    /// # Errors
    ///
    /// [`TreeError::NodeNotFound`] if no node has this id.
    fn find(&mut self, id: NodeId) -> Result<&TreeNode<K, V>, TreeError>;

    /// Resolve a node for writing and mark it changed.
    fn find_mut(&mut self, id: NodeId) -> Result<&mut TreeNode<K, V>, TreeError>;

    /// Create a root with a single entry over two children and make it the root.
    fn create_new_root(
        &mut self,
        key: K,
        value: V,
        left: NodeId,
        right: NodeId,
    ) -> Result<NodeId, TreeError> {
        let id = self.create(vec![(key, value)], vec![left, right])?;
        self.make_root(id)?;
        Ok(id)
    }

    fn make_root(&mut self, id: NodeId) -> Result<(), TreeError>;

    fn mark_as_changed(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.find_mut(id).map(|_| ())
    }

    fn delete(&mut self, id: NodeId) -> Result<(), TreeError>;

    /// Persist every node changed since the last call.
    fn save_changes(&mut self) -> Result<(), TreeError>;

    fn root(&mut self) -> Result<&TreeNode<K, V>, TreeError> {
        let id = self.root_id();
        self.find(id)
    }
}
