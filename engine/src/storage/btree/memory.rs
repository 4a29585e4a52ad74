use std::collections::HashMap;

use crate::storage::btree::error::TreeError;
use crate::storage::btree::manager::{KeyComparer, NodeManager, default_comparer};
use crate::storage::btree::node::{NodeId, TreeNode};

/// Keeps every node in a map. Nothing is persisted; `save_changes` is a no-op.
pub struct MemoryNodeManager<K, V> {
    nodes: HashMap<NodeId, TreeNode<K, V>>,
    next_id: NodeId,
    root_id: NodeId,
    min_entries: usize,
    comparer: KeyComparer<K>,
}

impl<K: Ord + 'static, V> MemoryNodeManager<K, V> {
    /// A manager ordering keys by `Ord`. `min_entries` is clamped to at least 1.
    #[must_use]
    pub fn new(min_entries: usize) -> Self {
        Self::with_comparer(min_entries, default_comparer())
    }
}

impl<K, V> MemoryNodeManager<K, V> {
    /// A manager ordering keys with `comparer`. The empty root gets id 1.
    #[must_use]
    pub fn with_comparer(min_entries: usize, comparer: KeyComparer<K>) -> Self {
        let root = TreeNode::new(1, 0, Vec::new(), Vec::new());
        let mut nodes = HashMap::new();
        nodes.insert(1, root);
        Self {
            nodes,
            next_id: 2,
            root_id: 1,
            min_entries: min_entries.max(1),
            comparer,
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<K, V> NodeManager<K, V> for MemoryNodeManager<K, V> {
    fn min_entries_per_node(&self) -> usize {
        self.min_entries
    }

    fn key_comparer(&self) -> &KeyComparer<K> {
        &self.comparer
    }

    fn root_id(&self) -> NodeId {
        self.root_id
    }

    fn create(&mut self, entries: Vec<(K, V)>, children: Vec<NodeId>) -> Result<NodeId, TreeError> {
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| TreeError::InvalidOperation("node ids exhausted".to_string()))?;
        self.nodes.insert(id, TreeNode::new(id, 0, entries, children));
        Ok(id)
    }

    fn find(&mut self, id: NodeId) -> Result<&TreeNode<K, V>, TreeError> {
        self.nodes.get(&id).ok_or(TreeError::NodeNotFound(id))
    }

    fn find_mut(&mut self, id: NodeId) -> Result<&mut TreeNode<K, V>, TreeError> {
        self.nodes.get_mut(&id).ok_or(TreeError::NodeNotFound(id))
    }

    fn make_root(&mut self, id: NodeId) -> Result<(), TreeError> {
        if !self.nodes.contains_key(&id) {
            return Err(TreeError::NodeNotFound(id));
        }
        self.root_id = id;
        Ok(())
    }

    fn delete(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.nodes
            .remove(&id)
            .map(|_| ())
            .ok_or(TreeError::NodeNotFound(id))
    }

    fn save_changes(&mut self) -> Result<(), TreeError> {
        Ok(())
    }
}
