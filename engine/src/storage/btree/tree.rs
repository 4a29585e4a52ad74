//! The ordered index: point lookups, inserts, deletes and range cursors.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::storage::btree::error::TreeError;
use crate::storage::btree::iter::{Direction, TreeIterator};
use crate::storage::btree::manager::NodeManager;
use crate::storage::btree::node::{self, NodeId, Occurrence, SearchResult};

/// A B-tree over a [`NodeManager`].
///
/// With `allow_duplicate_keys` several entries may share a key; they keep
/// insertion order among themselves. Every successful mutation ends with
/// `save_changes` on the manager.
pub struct Tree<K, V, M> {
    manager: M,
    allow_duplicate_keys: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, M> Tree<K, V, M>
where
    K: Clone,
    V: Clone,
    M: NodeManager<K, V>,
{
    pub const fn new(manager: M, allow_duplicate_keys: bool) -> Self {
        Self {
            manager,
            allow_duplicate_keys,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn allows_duplicate_keys(&self) -> bool {
        self.allow_duplicate_keys
    }

    pub const fn manager(&self) -> &M {
        &self.manager
    }

    /// Direct access to the nodes. Changes made here bypass the tree's
    /// balancing and can break it.
    pub const fn manager_mut(&mut self) -> &mut M {
        &mut self.manager
    }

    pub fn into_manager(self) -> M {
        self.manager
    }

    /// Insert an entry.
    ///
    /// # Errors
    ///
    /// [`TreeError::DuplicateKey`] if the tree is unique and `key` is
    /// present; the tree is left unchanged.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), TreeError> {
        let comparer = self.manager.key_comparer().clone();
        let mut id = self.manager.root_id();

        let (leaf, position) = loop {
            let node = self.manager.find(id)?;
            let result = if self.allow_duplicate_keys {
                node.binary_search_occurrence(&key, Occurrence::Last, |a, b| comparer(a, b))
            } else {
                node.binary_search(&key, |a, b| comparer(a, b))
            };
            let position = match result {
                SearchResult::Found(_) if !self.allow_duplicate_keys => {
                    return Err(TreeError::DuplicateKey);
                }
                SearchResult::Found(index) => index + 1,
                SearchResult::InsertAt(index) => index,
            };
            if node.is_leaf() {
                break (id, position);
            }
            id = node.child(position)?;
        };

        let min = self.manager.min_entries_per_node();
        let leaf_node = self.manager.find_mut(leaf)?;
        leaf_node.insert_as_leaf(key, value, position);
        if leaf_node.is_overflow(min) {
            node::split(&mut self.manager, leaf)?;
        }

        self.manager.save_changes()
    }

    /// The first entry with `key`, if any.
    pub fn get(&mut self, key: &K) -> Result<Option<(K, V)>, TreeError> {
        let comparer = self.manager.key_comparer().clone();
        let first = self.larger_than_or_equal_to(key)?.next_entry()?;
        Ok(first.filter(|(found, _)| comparer(found, key) == Ordering::Equal))
    }

    /// Entries held by the root node.
    pub fn get_all(&mut self) -> Result<Vec<(K, V)>, TreeError> {
        Ok(self.manager.root()?.entries().to_vec())
    }

    /// Delete the entry with `key` from a unique tree. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidOperation`] on a tree allowing duplicate keys;
    /// use [`Tree::delete_entry`] there.
    pub fn delete(&mut self, key: &K) -> Result<bool, TreeError> {
        if self.allow_duplicate_keys {
            return Err(TreeError::InvalidOperation(
                "delete by key requires a unique tree; use delete_entry".to_string(),
            ));
        }

        let comparer = self.manager.key_comparer().clone();
        let target = {
            let mut cursor = self.larger_than_or_equal_to(key)?;
            match cursor.next_entry()? {
                Some((found, _)) if comparer(&found, key) == Ordering::Equal => cursor.position(),
                _ => None,
            }
        };

        let Some((id, index)) = target else {
            return Ok(false);
        };
        node::remove(&mut self.manager, id, index)?;
        self.manager.save_changes()?;
        Ok(true)
    }

    /// Delete every entry matching both `key` and `value` from a tree
    /// allowing duplicate keys. Returns whether anything was deleted.
    pub fn delete_entry(&mut self, key: &K, value: &V) -> Result<bool, TreeError>
    where
        V: Ord,
    {
        self.delete_entry_by(key, value, V::cmp)
    }

    /// Like [`Tree::delete_entry`], matching values with `value_comparer`.
    ///
    /// # Errors
    ///
    /// [`TreeError::InvalidOperation`] on a unique tree.
    pub fn delete_entry_by<F>(&mut self, key: &K, value: &V, value_comparer: F) -> Result<bool, TreeError>
    where
        F: Fn(&V, &V) -> Ordering,
    {
        if !self.allow_duplicate_keys {
            return Err(TreeError::InvalidOperation(
                "delete_entry requires a tree allowing duplicate keys; use delete".to_string(),
            ));
        }

        let comparer = self.manager.key_comparer().clone();
        let mut deleted = 0usize;
        loop {
            // Removal reshapes the tree, so each match starts a fresh cursor.
            let target = {
                let mut cursor = self.larger_than_or_equal_to(key)?;
                let mut target = None;
                while let Some((found_key, found_value)) = cursor.next_entry()? {
                    if comparer(&found_key, key) == Ordering::Greater {
                        break;
                    }
                    if value_comparer(&found_value, value) == Ordering::Equal {
                        target = cursor.position();
                        break;
                    }
                }
                target
            };
            let Some((id, index)) = target else {
                break;
            };
            node::remove(&mut self.manager, id, index)?;
            deleted += 1;
        }

        if deleted > 0 {
            tracing::trace!("deleted {deleted} matching entries");
        }
        self.manager.save_changes()?;
        Ok(deleted > 0)
    }

    /// Entries with keys `>= key`, ascending.
    pub fn larger_than_or_equal_to(&mut self, key: &K) -> Result<TreeIterator<'_, K, V, M>, TreeError> {
        let (leaf, result) = self.find_leaf(key, Occurrence::First)?;
        Ok(TreeIterator::new(&mut self.manager, Direction::Ascending, leaf, result.index()))
    }

    /// Entries with keys `> key`, ascending.
    pub fn larger_than(&mut self, key: &K) -> Result<TreeIterator<'_, K, V, M>, TreeError> {
        let (leaf, result) = self.find_leaf(key, Occurrence::Last)?;
        let start = match result {
            SearchResult::Found(index) => index + 1,
            SearchResult::InsertAt(index) => index,
        };
        Ok(TreeIterator::new(&mut self.manager, Direction::Ascending, leaf, start))
    }

    /// Entries with keys `<= key`, descending.
    pub fn less_than_or_equal_to(&mut self, key: &K) -> Result<TreeIterator<'_, K, V, M>, TreeError> {
        let (leaf, result) = self.find_leaf(key, Occurrence::Last)?;
        let end = match result {
            SearchResult::Found(index) => index + 1,
            SearchResult::InsertAt(index) => index,
        };
        Ok(TreeIterator::new(&mut self.manager, Direction::Descending, leaf, end))
    }

    /// Entries with keys `< key`, descending.
    pub fn less_than(&mut self, key: &K) -> Result<TreeIterator<'_, K, V, M>, TreeError> {
        let (leaf, result) = self.find_leaf(key, Occurrence::First)?;
        Ok(TreeIterator::new(&mut self.manager, Direction::Descending, leaf, result.index()))
    }

    /// Every entry, ascending.
    pub fn iter(&mut self) -> Result<TreeIterator<'_, K, V, M>, TreeError> {
        let mut id = self.manager.root_id();
        loop {
            let node = self.manager.find(id)?;
            if node.is_leaf() {
                break;
            }
            id = node.child(0)?;
        }
        Ok(TreeIterator::new(&mut self.manager, Direction::Ascending, id, 0))
    }

    /// Descend to the leaf where the first or last occurrence of `key` is
    /// (or would be). Keys found in internal nodes steer the descent left of
    /// the match for `First` and right of it for `Last`.
    fn find_leaf(&mut self, key: &K, occurrence: Occurrence) -> Result<(NodeId, SearchResult), TreeError> {
        let comparer = self.manager.key_comparer().clone();
        let mut id = self.manager.root_id();
        loop {
            let node = self.manager.find(id)?;
            let result = node.binary_search_occurrence(key, occurrence, |a, b| comparer(a, b));
            if node.is_leaf() {
                return Ok((id, result));
            }
            id = match (result, occurrence) {
                (SearchResult::Found(index), Occurrence::Last) => node.child(index + 1)?,
                (SearchResult::Found(index), Occurrence::First)
                | (SearchResult::InsertAt(index), _) => node.child(index)?,
            };
        }
    }
}

impl<K, V, M: std::fmt::Debug> std::fmt::Debug for Tree<K, V, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("manager", &self.manager)
            .field("allow_duplicate_keys", &self.allow_duplicate_keys)
            .finish()
    }
}
