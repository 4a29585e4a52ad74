//! Structural invariant checking for trees under simulation.

use std::cmp::Ordering;

use crate::storage::btree::{NodeId, NodeManager, TreeError};

/// An invariant violation detected during simulation.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub description: String,
    /// Operation index where it was detected.
    pub operation_index: usize,
    pub context: String,
}

/// Walks a whole tree and records every broken structural rule.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    violations: Vec<InvariantViolation>,
}

/// Key bounds inherited from the separators above a subtree.
struct Bounds<K> {
    lower: Option<K>,
    upper: Option<K>,
}

impl InvariantChecker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    #[must_use]
    pub const fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn add_violation(&mut self, description: impl Into<String>, operation_index: usize, context: impl Into<String>) {
        self.violations.push(InvariantViolation {
            description: description.into(),
            operation_index,
            context: context.into(),
        });
    }

    /// Check the tree reachable from the manager's root. Returns the number
    /// of entries found, or an error if a node could not be loaded.
    pub fn check_tree<K, V, M>(&mut self, manager: &mut M, operation_index: usize) -> Result<usize, TreeError>
    where
        K: Clone + std::fmt::Debug,
        M: NodeManager<K, V>,
    {
        let root_id = manager.root_id();
        if manager.find(root_id)?.parent_id() != 0 {
            self.add_violation("root has a parent", operation_index, format!("root {root_id}"));
        }

        let mut leaf_depth = None;
        let mut entries = 0;
        let bounds = Bounds {
            lower: None,
            upper: None,
        };
        self.check_node(
            manager,
            root_id,
            0,
            &bounds,
            &mut leaf_depth,
            &mut entries,
            operation_index,
        )?;
        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node<K, V, M>(
        &mut self,
        manager: &mut M,
        id: NodeId,
        depth: usize,
        bounds: &Bounds<K>,
        leaf_depth: &mut Option<usize>,
        entries: &mut usize,
        operation_index: usize,
    ) -> Result<(), TreeError>
    where
        K: Clone + std::fmt::Debug,
        M: NodeManager<K, V>,
    {
        let min = manager.min_entries_per_node();
        let comparer = manager.key_comparer().clone();
        let is_root = id == manager.root_id();

        let (keys, children) = {
            let node = manager.find(id)?;
            let keys: Vec<K> = node.entries().iter().map(|(key, _)| key.clone()).collect();
            (keys, node.children().to_vec())
        };
        *entries += keys.len();

        if !is_root && (keys.len() < min || keys.len() > min * 2) {
            self.add_violation(
                "node size out of range",
                operation_index,
                format!("node {id} has {} entries, expected {min}..={}", keys.len(), min * 2),
            );
        }

        if keys
            .windows(2)
            .any(|pair| comparer(&pair[0], &pair[1]) == Ordering::Greater)
        {
            self.add_violation("entries out of order", operation_index, format!("node {id}: {keys:?}"));
        }

        let below_lower = bounds
            .lower
            .as_ref()
            .is_some_and(|lower| keys.first().is_some_and(|key| comparer(key, lower) == Ordering::Less));
        let above_upper = bounds
            .upper
            .as_ref()
            .is_some_and(|upper| keys.last().is_some_and(|key| comparer(key, upper) == Ordering::Greater));
        if below_lower || above_upper {
            self.add_violation(
                "entries escape separator bounds",
                operation_index,
                format!("node {id}: {keys:?} outside {:?}..={:?}", bounds.lower, bounds.upper),
            );
        }

        if children.is_empty() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => self.add_violation(
                    "leaves at different depths",
                    operation_index,
                    format!("leaf {id} at depth {depth}, expected {expected}"),
                ),
                Some(_) => {}
            }
            return Ok(());
        }

        if children.len() != keys.len() + 1 {
            self.add_violation(
                "child count mismatch",
                operation_index,
                format!("node {id} has {} entries and {} children", keys.len(), children.len()),
            );
            return Ok(());
        }

        for (index, &child) in children.iter().enumerate() {
            let parent = manager.find(child)?.parent_id();
            if parent != id {
                self.add_violation(
                    "broken parent link",
                    operation_index,
                    format!("child {child} of node {id} points at {parent}"),
                );
            }
            let child_bounds = Bounds {
                lower: index
                    .checked_sub(1)
                    .map_or_else(|| bounds.lower.clone(), |left| keys.get(left).cloned()),
                upper: keys.get(index).cloned().or_else(|| bounds.upper.clone()),
            };
            self.check_node(
                manager,
                child,
                depth + 1,
                &child_bounds,
                leaf_depth,
                entries,
                operation_index,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::{MemoryNodeManager, Tree};
    use crate::testing::small_memory_tree;

    #[test]
    fn test_valid_tree_has_no_violations() {
        let mut tree = small_memory_tree(false);
        for key in 0..64 {
            tree.insert(key, key).expect("insert");
        }
        let mut checker = InvariantChecker::new();
        let count = checker.check_tree(tree.manager_mut(), 0).expect("check");
        assert_eq!(count, 64);
        assert!(!checker.has_violations(), "{:?}", checker.violations());
    }

    #[test]
    fn test_detects_broken_structure() {
        let mut manager: MemoryNodeManager<i32, i32> = MemoryNodeManager::new(2);
        let left = manager.create(vec![(5, 0), (6, 0)], Vec::new()).expect("create");
        let right = manager.create(vec![(1, 0)], Vec::new()).expect("create");
        let old_root = manager.root_id();
        let root = manager.create_new_root(3, 0, left, right).expect("root");
        manager.delete(old_root).expect("delete");
        manager.find_mut(left).expect("left").set_parent_id(root);

        let mut tree = Tree::new(manager, false);
        let mut checker = InvariantChecker::new();
        checker.check_tree(tree.manager_mut(), 7).expect("check");

        let descriptions: Vec<&str> = checker
            .violations()
            .iter()
            .map(|violation| violation.description.as_str())
            .collect();
        assert!(descriptions.contains(&"node size out of range"));
        assert!(descriptions.contains(&"entries escape separator bounds"));
        assert!(descriptions.contains(&"broken parent link"));
        assert!(checker.violations().iter().all(|violation| violation.operation_index == 7));
    }
}
