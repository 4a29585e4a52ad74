//! Lazy in-order cursors over a tree.

use std::marker::PhantomData;

use crate::storage::btree::error::TreeError;
use crate::storage::btree::manager::NodeManager;
use crate::storage::btree::node::{self, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// Not started. Ascending yields from `index` on; descending yields
    /// the entries before `index`.
    Start { node: NodeId, index: usize },
    /// Last yielded position.
    At { node: NodeId, index: usize },
    Done,
}

/// Single-pass cursor yielding cloned entries.
///
/// Holds the manager mutably for its whole lifetime, so the tree cannot
/// change underneath it. A load failure is yielded once and ends the walk.
pub struct TreeIterator<'a, K, V, M: NodeManager<K, V>> {
    manager: &'a mut M,
    direction: Direction,
    state: CursorState,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V, M> TreeIterator<'a, K, V, M>
where
    K: Clone,
    V: Clone,
    M: NodeManager<K, V>,
{
    /// Start in leaf `node` at boundary `index`.
    pub(crate) fn new(manager: &'a mut M, direction: Direction, node: NodeId, index: usize) -> Self {
        Self {
            manager,
            direction,
            state: CursorState::Start { node, index },
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Node and entry index of the most recently yielded entry.
    #[must_use]
    pub const fn position(&self) -> Option<(NodeId, usize)> {
        match self.state {
            CursorState::At { node, index } => Some((node, index)),
            CursorState::Start { .. } | CursorState::Done => None,
        }
    }

    /// Advance and return the next entry, or `None` once exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>, TreeError> {
        match self.advance() {
            Ok(Some((node, index))) => {
                let entry = self
                    .manager
                    .find(node)
                    .and_then(|n| {
                        n.entry(index).cloned().ok_or_else(|| {
                            TreeError::Corruption(format!("node {node} has no entry {index}"))
                        })
                    });
                match entry {
                    Ok(entry) => {
                        self.state = CursorState::At { node, index };
                        Ok(Some(entry))
                    }
                    Err(e) => {
                        self.state = CursorState::Done;
                        Err(e)
                    }
                }
            }
            Ok(None) => {
                self.state = CursorState::Done;
                Ok(None)
            }
            Err(e) => {
                self.state = CursorState::Done;
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<(NodeId, usize)>, TreeError> {
        match (self.state, self.direction) {
            (CursorState::Done, _) => Ok(None),
            (CursorState::Start { node, index }, Direction::Ascending) => {
                if index < self.manager.find(node)?.entries_count() {
                    Ok(Some((node, index)))
                } else {
                    self.climb_after(node)
                }
            }
            (CursorState::Start { node, index }, Direction::Descending) => match index.checked_sub(1) {
                Some(previous) => Ok(Some((node, previous))),
                None => self.climb_before(node),
            },
            (CursorState::At { node, index }, Direction::Ascending) => {
                let current = self.manager.find(node)?;
                if current.is_leaf() {
                    if index + 1 < current.entries_count() {
                        Ok(Some((node, index + 1)))
                    } else {
                        self.climb_after(node)
                    }
                } else {
                    let subtree = current.child(index + 1)?;
                    node::find_smallest(&mut *self.manager, subtree)
                }
            }
            (CursorState::At { node, index }, Direction::Descending) => {
                let current = self.manager.find(node)?;
                if current.is_leaf() {
                    match index.checked_sub(1) {
                        Some(previous) => Ok(Some((node, previous))),
                        None => self.climb_before(node),
                    }
                } else {
                    let subtree = current.child(index)?;
                    node::find_largest(&mut *self.manager, subtree)
                }
            }
        }
    }

    /// First ancestor entry to the right of the subtree rooted at `node`.
    fn climb_after(&mut self, mut node: NodeId) -> Result<Option<(NodeId, usize)>, TreeError> {
        loop {
            let parent = self.manager.find(node)?.parent_id();
            if parent == 0 {
                return Ok(None);
            }
            let index = node::index_in_parent(&mut *self.manager, node)?;
            if index < self.manager.find(parent)?.entries_count() {
                return Ok(Some((parent, index)));
            }
            node = parent;
        }
    }

    /// First ancestor entry to the left of the subtree rooted at `node`.
    fn climb_before(&mut self, mut node: NodeId) -> Result<Option<(NodeId, usize)>, TreeError> {
        loop {
            let parent = self.manager.find(node)?.parent_id();
            if parent == 0 {
                return Ok(None);
            }
            let index = node::index_in_parent(&mut *self.manager, node)?;
            if let Some(previous) = index.checked_sub(1) {
                return Ok(Some((parent, previous)));
            }
            node = parent;
        }
    }
}

impl<K, V, M> Iterator for TreeIterator<'_, K, V, M>
where
    K: Clone,
    V: Clone,
    M: NodeManager<K, V>,
{
    type Item = Result<(K, V), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl<K, V, M: NodeManager<K, V>> std::fmt::Debug for TreeIterator<'_, K, V, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIterator")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
