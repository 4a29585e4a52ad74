//! Tree nodes and the structural algorithms that reshape them.
//!
//! Nodes refer to their parent and children by id. Every algorithm here goes
//! through a [`NodeManager`] to resolve ids, so the same code runs against
//! the in-memory and disk-backed managers.
//!
//! # Invariants
//!
//! - A node is a leaf iff it has no children
//! - Internal nodes have `children.len() == entries.len() + 1`
//! - Non-root nodes hold between `min` and `2 * min` entries outside of an
//!   insert that is about to split
//! - An in-order walk (child 0, entry 0, child 1, ...) yields keys in
//!   non-decreasing order
//! - `parent_id == 0` marks the root

use std::cmp::Ordering;

use crate::storage::btree::error::TreeError;
use crate::storage::btree::manager::NodeManager;

/// A node identifier. 0 is never a valid node and means "no parent".
pub type NodeId = u32;

/// Outcome of a binary search over a node's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The key is at this index.
    Found(usize),
    /// The key is absent and would be inserted at this index.
    InsertAt(usize),
}

impl SearchResult {
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Found(index) | Self::InsertAt(index) => index,
        }
    }

    #[must_use]
    pub const fn is_found(self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Which of several equal keys a search should settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    First,
    Last,
}

/// A tree node: sorted entries plus child ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode<K, V> {
    id: NodeId,
    parent_id: NodeId,
    entries: Vec<(K, V)>,
    children: Vec<NodeId>,
}

impl<K, V> TreeNode<K, V> {
    #[must_use]
    pub const fn new(
        id: NodeId,
        parent_id: NodeId,
        entries: Vec<(K, V)>,
        children: Vec<NodeId>,
    ) -> Self {
        Self {
            id,
            parent_id,
            entries,
            children,
        }
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub const fn parent_id(&self) -> NodeId {
        self.parent_id
    }

    pub const fn set_parent_id(&mut self, parent_id: NodeId) {
        self.parent_id = parent_id;
    }

    #[must_use]
    pub fn entries(&self) -> &[(K, V)] {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, index: usize) -> Option<&(K, V)> {
        self.entries.get(index)
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Child id at `index`, failing on a broken node.
    pub fn child(&self, index: usize) -> Result<NodeId, TreeError> {
        self.children.get(index).copied().ok_or_else(|| {
            TreeError::Corruption(format!(
                "node {} has no child {index} ({} children)",
                self.id,
                self.children.len()
            ))
        })
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn entries_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn children_count(&self) -> usize {
        self.children.len()
    }

    /// Whether the node holds more than `2 * min_entries` entries and must split.
    #[must_use]
    pub const fn is_overflow(&self, min_entries: usize) -> bool {
        self.entries.len() > min_entries * 2
    }

    #[must_use]
    pub fn max_key(&self) -> Option<&K> {
        self.entries.last().map(|(key, _)| key)
    }

    #[must_use]
    pub fn min_key(&self) -> Option<&K> {
        self.entries.first().map(|(key, _)| key)
    }

    /// Binary search for `key`. With equal keys, any matching index may be returned.
    pub fn binary_search<F>(&self, key: &K, compare: F) -> SearchResult
    where
        F: Fn(&K, &K) -> Ordering,
    {
        match self.entries.binary_search_by(|(probe, _)| compare(probe, key)) {
            Ok(index) => SearchResult::Found(index),
            Err(index) => SearchResult::InsertAt(index),
        }
    }

    /// Binary search settling on the first or last of several equal keys.
    pub fn binary_search_occurrence<F>(&self, key: &K, occurrence: Occurrence, compare: F) -> SearchResult
    where
        F: Fn(&K, &K) -> Ordering,
    {
        match occurrence {
            Occurrence::First => {
                let index = self
                    .entries
                    .partition_point(|(probe, _)| compare(probe, key) == Ordering::Less);
                match self.entries.get(index) {
                    Some((probe, _)) if compare(probe, key) == Ordering::Equal => {
                        SearchResult::Found(index)
                    }
                    _ => SearchResult::InsertAt(index),
                }
            }
            Occurrence::Last => {
                let end = self
                    .entries
                    .partition_point(|(probe, _)| compare(probe, key) != Ordering::Greater);
                match end.checked_sub(1).and_then(|last| self.entries.get(last)) {
                    Some((probe, _)) if compare(probe, key) == Ordering::Equal => {
                        SearchResult::Found(end - 1)
                    }
                    _ => SearchResult::InsertAt(end),
                }
            }
        }
    }

    /// Insert an entry at `position` without checking for overflow.
    pub fn insert_as_leaf(&mut self, key: K, value: V, position: usize) {
        let position = position.min(self.entries.len());
        self.entries.insert(position, (key, value));
    }
}

impl<K: std::fmt::Debug, V> std::fmt::Display for TreeNode<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.entries.iter().map(|(key, _)| format!("{key:?}")).collect();
        write!(
            f,
            "[Node: id={}, parent={}, entries={}",
            self.id,
            self.parent_id,
            keys.join(",")
        )?;
        if !self.is_leaf() {
            let ids: Vec<String> = self.children.iter().map(ToString::to_string).collect();
            write!(f, ", children={}", ids.join(","))?;
        }
        write!(f, "]")
    }
}

fn corruption(message: String) -> TreeError {
    TreeError::Corruption(message)
}

/// Position of `id` among its parent's children.
pub fn index_in_parent<K, V, M>(manager: &mut M, id: NodeId) -> Result<usize, TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let parent_id = manager.find(id)?.parent_id();
    if parent_id == 0 {
        return Err(corruption(format!("node {id} is the root and has no parent")));
    }
    manager
        .find(parent_id)?
        .children()
        .iter()
        .position(|&child| child == id)
        .ok_or_else(|| corruption(format!("node {id} is missing from parent {parent_id}")))
}

/// The rightmost entry in the subtree rooted at `id`, if the subtree is not empty.
pub fn find_largest<K, V, M>(manager: &mut M, id: NodeId) -> Result<Option<(NodeId, usize)>, TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let mut current = id;
    loop {
        let node = manager.find(current)?;
        if node.is_leaf() {
            return Ok(node.entries_count().checked_sub(1).map(|index| (current, index)));
        }
        current = node.child(node.children_count() - 1)?;
    }
}

/// The leftmost entry in the subtree rooted at `id`, if the subtree is not empty.
pub fn find_smallest<K, V, M>(manager: &mut M, id: NodeId) -> Result<Option<(NodeId, usize)>, TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let mut current = id;
    loop {
        let node = manager.find(current)?;
        if node.is_leaf() {
            return Ok((!node.is_empty()).then_some((current, 0)));
        }
        current = node.child(0)?;
    }
}

/// Insert a promoted entry into `parent_id` right after its child `left_id`,
/// with `right_id` as the new child following it.
fn insert_as_parent<K, V, M>(
    manager: &mut M,
    parent_id: NodeId,
    left_id: NodeId,
    entry: (K, V),
    right_id: NodeId,
) -> Result<(), TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let parent = manager.find_mut(parent_id)?;
    let position = parent
        .children
        .iter()
        .position(|&child| child == left_id)
        .ok_or_else(|| corruption(format!("node {left_id} is missing from parent {parent_id}")))?;
    if position > parent.entries.len() {
        return Err(corruption(format!(
            "parent {parent_id} has {} entries for {} children",
            parent.entries.len(),
            parent.children.len()
        )));
    }
    parent.entries.insert(position, entry);
    parent.children.insert(position + 1, right_id);
    Ok(())
}

/// Split an overflowing node around its entry at index `min`.
///
/// Entries (and children) after the middle move to a new right sibling; the
/// middle entry moves up into the parent, which is created if `id` was the
/// root and split in turn if it overflows. Returns `(left, right)`.
pub fn split<K, V, M>(manager: &mut M, id: NodeId) -> Result<(NodeId, NodeId), TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let min = manager.min_entries_per_node();

    let (middle, right_entries, right_children, parent_id) = {
        let node = manager.find_mut(id)?;
        if node.entries.len() <= min {
            return Err(corruption(format!(
                "node {id} has {} entries and cannot be split",
                node.entries.len()
            )));
        }
        let right_entries = node.entries.split_off(min + 1);
        let Some(middle) = node.entries.pop() else {
            return Err(corruption(format!("node {id} lost its middle entry")));
        };
        let right_children = if node.is_leaf() {
            Vec::new()
        } else {
            node.children.split_off((min + 1).min(node.children.len()))
        };
        (middle, right_entries, right_children, node.parent_id)
    };

    let moved_children = right_children.clone();
    let right_id = manager.create(right_entries, right_children)?;
    for child in moved_children {
        manager.find_mut(child)?.parent_id = right_id;
    }

    if parent_id == 0 {
        let (key, value) = middle;
        let root_id = manager.create_new_root(key, value, id, right_id)?;
        manager.find_mut(id)?.parent_id = root_id;
        manager.find_mut(right_id)?.parent_id = root_id;
    } else {
        insert_as_parent(manager, parent_id, id, middle, right_id)?;
        manager.find_mut(right_id)?.parent_id = parent_id;

        if manager.find(parent_id)?.is_overflow(min) {
            split(manager, parent_id)?;
        }
    }

    Ok((id, right_id))
}

/// Remove the entry at `index` from node `id`, keeping the tree balanced.
///
/// Removing from an internal node replaces the entry with its in-order
/// predecessor and removes that from its leaf instead.
pub fn remove<K, V, M>(manager: &mut M, id: NodeId, index: usize) -> Result<(), TreeError>
where
    K: Clone,
    V: Clone,
    M: NodeManager<K, V> + ?Sized,
{
    let min = manager.min_entries_per_node();

    if manager.find(id)?.is_leaf() {
        let node = manager.find_mut(id)?;
        if index >= node.entries.len() {
            return Err(TreeError::InvalidOperation(format!(
                "entry {index} out of range for node {id} ({} entries)",
                node.entries.len()
            )));
        }
        node.entries.remove(index);
        if node.entries.len() >= min || node.parent_id == 0 {
            return Ok(());
        }
        return rebalance(manager, id);
    }

    let left_subtree = manager.find(id)?.child(index)?;
    let (leaf_id, leaf_index) = find_largest(manager, left_subtree)?
        .ok_or_else(|| corruption(format!("subtree {left_subtree} is empty")))?;
    let replacement = manager
        .find(leaf_id)?
        .entry(leaf_index)
        .cloned()
        .ok_or_else(|| corruption(format!("node {leaf_id} has no entry {leaf_index}")))?;

    let node = manager.find_mut(id)?;
    let slot = node
        .entries
        .get_mut(index)
        .ok_or_else(|| corruption(format!("node {id} has no entry {index}")))?;
    *slot = replacement;

    remove(manager, leaf_id, leaf_index)
}

/// Restore the minimum fill of node `id` after a removal.
///
/// Tries to borrow from the right sibling, then from the left sibling, and
/// otherwise merges with a sibling, pulling the separator down from the
/// parent. A root left without entries is replaced by the merged node.
fn rebalance<K, V, M>(manager: &mut M, id: NodeId) -> Result<(), TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let min = manager.min_entries_per_node();
    let index = index_in_parent(manager, id)?;
    let parent_id = manager.find(id)?.parent_id();

    let (right_sibling, left_sibling) = {
        let parent = manager.find(parent_id)?;
        let right = parent.children().get(index + 1).copied();
        let left = index
            .checked_sub(1)
            .and_then(|left| parent.children().get(left).copied());
        (right, left)
    };

    if let Some(right_id) = right_sibling
        && manager.find(right_id)?.entries_count() > min
    {
        rotate_left(manager, id, parent_id, index, right_id)?;
        return Ok(());
    }

    if let Some(left_id) = left_sibling
        && manager.find(left_id)?.entries_count() > min
    {
        rotate_right(manager, id, parent_id, index, left_id)?;
        return Ok(());
    }

    let (left_id, right_id, separator_index) = match (right_sibling, left_sibling) {
        (Some(right_id), _) => (id, right_id, index),
        (None, Some(left_id)) => (left_id, id, index - 1),
        (None, None) => {
            return Err(corruption(format!("node {id} has no siblings to rebalance with")));
        }
    };

    merge(manager, parent_id, left_id, right_id, separator_index)?;

    let (grandparent_id, parent_entries) = {
        let parent = manager.find(parent_id)?;
        (parent.parent_id(), parent.entries_count())
    };

    if grandparent_id == 0 && parent_entries == 0 {
        manager.find_mut(left_id)?.parent_id = 0;
        manager.make_root(left_id)?;
        manager.delete(parent_id)?;
        tracing::debug!("tree root collapsed into node {left_id}");
    } else if grandparent_id != 0 && parent_entries < min {
        rebalance(manager, parent_id)?;
    }

    Ok(())
}

/// Move the parent separator down into `id` and the right sibling's first
/// entry up into the parent.
fn rotate_left<K, V, M>(
    manager: &mut M,
    id: NodeId,
    parent_id: NodeId,
    index: usize,
    right_id: NodeId,
) -> Result<(), TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let (entry, moved_child) = {
        let right = manager.find_mut(right_id)?;
        let entry = right.entries.remove(0);
        let child = if right.is_leaf() {
            None
        } else {
            Some(right.children.remove(0))
        };
        (entry, child)
    };

    let separator = {
        let parent = manager.find_mut(parent_id)?;
        let slot = parent
            .entries
            .get_mut(index)
            .ok_or_else(|| corruption(format!("parent {parent_id} has no separator {index}")))?;
        std::mem::replace(slot, entry)
    };

    let node = manager.find_mut(id)?;
    node.entries.push(separator);
    if let Some(child) = moved_child {
        node.children.push(child);
        manager.find_mut(child)?.parent_id = id;
    }
    Ok(())
}

/// Move the parent separator down into `id` and the left sibling's last
/// entry up into the parent.
fn rotate_right<K, V, M>(
    manager: &mut M,
    id: NodeId,
    parent_id: NodeId,
    index: usize,
    left_id: NodeId,
) -> Result<(), TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let (entry, moved_child) = {
        let left = manager.find_mut(left_id)?;
        let Some(entry) = left.entries.pop() else {
            return Err(corruption(format!("left sibling {left_id} is empty")));
        };
        let child = if left.is_leaf() {
            None
        } else {
            left.children.pop()
        };
        (entry, child)
    };

    let separator = {
        let parent = manager.find_mut(parent_id)?;
        let slot = parent
            .entries
            .get_mut(index - 1)
            .ok_or_else(|| corruption(format!("parent {parent_id} has no separator {}", index - 1)))?;
        std::mem::replace(slot, entry)
    };

    let node = manager.find_mut(id)?;
    node.entries.insert(0, separator);
    if let Some(child) = moved_child {
        node.children.insert(0, child);
        manager.find_mut(child)?.parent_id = id;
    }
    Ok(())
}

/// Fold `right_id` and the separator between the two into `left_id`, then
/// delete `right_id`.
fn merge<K, V, M>(
    manager: &mut M,
    parent_id: NodeId,
    left_id: NodeId,
    right_id: NodeId,
    separator_index: usize,
) -> Result<(), TreeError>
where
    M: NodeManager<K, V> + ?Sized,
{
    let separator = {
        let parent = manager.find_mut(parent_id)?;
        if separator_index >= parent.entries.len()
            || separator_index + 1 >= parent.children.len()
        {
            return Err(corruption(format!(
                "parent {parent_id} has no separator {separator_index}"
            )));
        }
        parent.children.remove(separator_index + 1);
        parent.entries.remove(separator_index)
    };

    let (entries, children) = {
        let right = manager.find_mut(right_id)?;
        (
            std::mem::take(&mut right.entries),
            std::mem::take(&mut right.children),
        )
    };

    {
        let left = manager.find_mut(left_id)?;
        left.entries.push(separator);
        left.entries.extend(entries);
        left.children.extend_from_slice(&children);
    }
    for child in children {
        manager.find_mut(child)?.parent_id = left_id;
    }

    manager.delete(right_id)?;
    tracing::trace!("merged node {right_id} into {left_id}");
    Ok(())
}
