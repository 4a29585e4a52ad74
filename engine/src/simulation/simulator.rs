//! Seeded model-check harnesses for the tree and record layers.
//!
//! Every run is a pure function of its config: the same seed produces the
//! same operations, the same injected faults and the same result.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::invariants::{InvariantChecker, InvariantViolation};
use super::storage::{FaultConfig, SimulatedStream};
use crate::storage::btree::{DiskNodeManager, I32Codec, MemoryNodeManager, NodeManager, Tree, TreeError};
use crate::storage::{BlockId, BlockStorage, RecordStorage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerKind {
    Memory,
    Disk,
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub seed: u64,
    pub manager: ManagerKind,
    pub allow_duplicate_keys: bool,
    pub min_entries_per_node: usize,
    /// Keys are drawn from `0..key_space`.
    pub key_space: i32,
    /// Block size of the disk manager's stream.
    pub block_size: usize,
    pub fault_config: FaultConfig,
    /// Walk the whole tree every this many operations.
    pub check_interval: usize,
}

impl SimulatorConfig {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            manager: ManagerKind::Memory,
            allow_duplicate_keys: false,
            min_entries_per_node: 2,
            key_space: 200,
            block_size: 512,
            fault_config: FaultConfig::default(),
            check_interval: 10,
        }
    }

    #[must_use]
    pub const fn with_manager(mut self, manager: ManagerKind) -> Self {
        self.manager = manager;
        self
    }

    #[must_use]
    pub const fn with_duplicate_keys(mut self) -> Self {
        self.allow_duplicate_keys = true;
        self
    }

    #[must_use]
    pub const fn with_min_entries(mut self, min_entries: usize) -> Self {
        self.min_entries_per_node = min_entries;
        self
    }

    #[must_use]
    pub const fn with_key_space(mut self, key_space: i32) -> Self {
        self.key_space = key_space;
        self
    }

    #[must_use]
    pub fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    pub seed: u64,
    pub operations_run: u64,
    pub successful_operations: u64,
    /// Operations that returned an error (expected only under fault injection).
    pub failed_operations: u64,
    pub invariant_violations: Vec<InvariantViolation>,
    pub completed_successfully: bool,
    pub error: Option<String>,
}

impl SimulationResult {
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.completed_successfully && self.invariant_violations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeKind {
    AtLeast,
    Above,
    AtMost,
    Below,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Insert(i32, i32),
    Get(i32),
    Delete(i32),
    DeleteEntry(i32, i32),
    Range(RangeKind, i32),
    Scan,
}

/// Reference behavior the tree is checked against.
enum Model {
    Unique(BTreeMap<i32, i32>),
    /// Sorted by key, equal keys in insertion order.
    Duplicate(Vec<(i32, i32)>),
}

impl Model {
    /// Apply an insert; returns whether the tree should accept it.
    fn insert(&mut self, key: i32, value: i32) -> bool {
        match self {
            Self::Unique(map) => {
                if map.contains_key(&key) {
                    return false;
                }
                map.insert(key, value);
                true
            }
            Self::Duplicate(entries) => {
                let position = entries.partition_point(|&(existing, _)| existing <= key);
                entries.insert(position, (key, value));
                true
            }
        }
    }

    fn get(&self, key: i32) -> Option<(i32, i32)> {
        match self {
            Self::Unique(map) => map.get(&key).map(|&value| (key, value)),
            Self::Duplicate(entries) => entries.iter().copied().find(|&(existing, _)| existing == key),
        }
    }

    fn delete(&mut self, key: i32) -> bool {
        match self {
            Self::Unique(map) => map.remove(&key).is_some(),
            Self::Duplicate(_) => false,
        }
    }

    fn delete_entry(&mut self, key: i32, value: i32) -> bool {
        match self {
            Self::Unique(_) => false,
            Self::Duplicate(entries) => {
                let before = entries.len();
                entries.retain(|&entry| entry != (key, value));
                entries.len() != before
            }
        }
    }

    fn entries(&self) -> Vec<(i32, i32)> {
        match self {
            Self::Unique(map) => map.iter().map(|(&key, &value)| (key, value)).collect(),
            Self::Duplicate(entries) => entries.clone(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Unique(map) => map.len(),
            Self::Duplicate(entries) => entries.len(),
        }
    }

    fn range(&self, kind: RangeKind, key: i32) -> Vec<(i32, i32)> {
        let entries = self.entries().into_iter();
        match kind {
            RangeKind::AtLeast => entries.filter(|&(k, _)| k >= key).collect(),
            RangeKind::Above => entries.filter(|&(k, _)| k > key).collect(),
            RangeKind::AtMost => entries.filter(|&(k, _)| k <= key).rev().collect(),
            RangeKind::Below => entries.filter(|&(k, _)| k < key).rev().collect(),
        }
    }
}

/// Drives random operations against a tree and a model in lockstep.
///
/// Once an operation fails the tree's contents can no longer be predicted,
/// so the run stops there.
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    model: Model,
    checker: InvariantChecker,
    diverged: bool,
    operations_run: u64,
    successful_operations: u64,
    failed_operations: u64,
}

impl Simulator {
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let model = if config.allow_duplicate_keys {
            Model::Duplicate(Vec::new())
        } else {
            Model::Unique(BTreeMap::new())
        };
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            model,
            checker: InvariantChecker::new(),
            diverged: false,
            operations_run: 0,
            successful_operations: 0,
            failed_operations: 0,
        }
    }

    pub fn run(&mut self, operation_count: usize) -> SimulationResult {
        let allow_duplicates = self.config.allow_duplicate_keys;
        let outcome = match self.config.manager {
            ManagerKind::Memory => {
                let manager = MemoryNodeManager::new(self.config.min_entries_per_node);
                self.drive(&mut Tree::new(manager, allow_duplicates), operation_count);
                Ok(())
            }
            ManagerKind::Disk => match self.open_disk_manager() {
                Ok(manager) => {
                    self.drive(&mut Tree::new(manager, allow_duplicates), operation_count);
                    Ok(())
                }
                Err(e) => Err(format!("failed to open disk manager: {e}")),
            },
        };

        SimulationResult {
            seed: self.config.seed,
            operations_run: self.operations_run,
            successful_operations: self.successful_operations,
            failed_operations: self.failed_operations,
            invariant_violations: self.checker.violations().to_vec(),
            completed_successfully: outcome.is_ok(),
            error: outcome.err(),
        }
    }

    fn open_disk_manager(
        &self,
    ) -> Result<DiskNodeManager<i32, i32, SimulatedStream, I32Codec, I32Codec>, TreeError> {
        let stream = SimulatedStream::with_config(self.config.seed, self.config.fault_config.clone());
        let blocks = BlockStorage::new(stream, self.config.block_size, 48)?;
        let records = RecordStorage::new(blocks)?;
        DiskNodeManager::new(records, I32Codec, I32Codec, self.config.min_entries_per_node)
    }

    fn drive<M: NodeManager<i32, i32>>(
        &mut self,
        tree: &mut Tree<i32, i32, M>,
        operation_count: usize,
    ) {
        let interval = self.config.check_interval.max(1);
        for index in 0..operation_count {
            let operation = self.next_operation();
            self.operations_run += 1;

            match self.apply(tree, operation, index) {
                Ok(()) => self.successful_operations += 1,
                Err(e) => {
                    self.failed_operations += 1;
                    self.diverged = true;
                    tracing::debug!("operation {index} ({operation:?}) failed: {e}");
                    if self.config.fault_config.is_fault_free() {
                        self.checker.add_violation(
                            "operation failed without injected faults",
                            index,
                            format!("{operation:?}: {e}"),
                        );
                    }
                    break;
                }
            }

            if (index + 1) % interval == 0 {
                self.check_structure(tree, index);
                if self.diverged {
                    break;
                }
            }
        }
        self.check_structure(tree, operation_count);
    }

    fn next_operation(&mut self) -> Operation {
        let key = self.rng.random_range(0..self.config.key_space);
        let value = if self.config.allow_duplicate_keys {
            self.rng.random_range(0..4)
        } else {
            self.rng.random_range(0..1_000_000)
        };

        match self.rng.random_range(0..100) {
            0..45 => Operation::Insert(key, value),
            45..60 => Operation::Get(key),
            60..80 if self.config.allow_duplicate_keys => Operation::DeleteEntry(key, value),
            60..80 => Operation::Delete(key),
            80..97 => {
                let kind = match self.rng.random_range(0..4) {
                    0 => RangeKind::AtLeast,
                    1 => RangeKind::Above,
                    2 => RangeKind::AtMost,
                    _ => RangeKind::Below,
                };
                Operation::Range(kind, key)
            }
            _ => Operation::Scan,
        }
    }

    fn apply<M: NodeManager<i32, i32>>(
        &mut self,
        tree: &mut Tree<i32, i32, M>,
        operation: Operation,
        index: usize,
    ) -> Result<(), TreeError> {
        match operation {
            Operation::Insert(key, value) => {
                let result = tree.insert(key, value);
                let accepted = self.model.insert(key, value);
                match result {
                    Ok(()) if !accepted => self.mismatch(index, operation, "accepted a duplicate key"),
                    Err(TreeError::DuplicateKey) if accepted => {
                        self.mismatch(index, operation, "rejected a new key");
                    }
                    Ok(()) | Err(TreeError::DuplicateKey) => {}
                    Err(e) => return Err(e),
                }
            }
            Operation::Get(key) => {
                let found = tree.get(&key)?;
                if found != self.model.get(key) {
                    self.mismatch(index, operation, format!("got {found:?}"));
                }
            }
            Operation::Delete(key) => {
                let deleted = tree.delete(&key)?;
                if deleted != self.model.delete(key) {
                    self.mismatch(index, operation, format!("delete returned {deleted}"));
                }
            }
            Operation::DeleteEntry(key, value) => {
                let deleted = tree.delete_entry(&key, &value)?;
                if deleted != self.model.delete_entry(key, value) {
                    self.mismatch(index, operation, format!("delete_entry returned {deleted}"));
                }
            }
            Operation::Range(kind, key) => {
                let found: Vec<(i32, i32)> = match kind {
                    RangeKind::AtLeast => tree.larger_than_or_equal_to(&key)?.collect::<Result<_, _>>()?,
                    RangeKind::Above => tree.larger_than(&key)?.collect::<Result<_, _>>()?,
                    RangeKind::AtMost => tree.less_than_or_equal_to(&key)?.collect::<Result<_, _>>()?,
                    RangeKind::Below => tree.less_than(&key)?.collect::<Result<_, _>>()?,
                };
                let expected = self.model.range(kind, key);
                if found != expected {
                    self.mismatch(index, operation, format!("expected {expected:?}, got {found:?}"));
                }
            }
            Operation::Scan => {
                let found: Vec<(i32, i32)> = tree.iter()?.collect::<Result<_, _>>()?;
                if found != self.model.entries() {
                    self.mismatch(index, operation, format!("scan returned {} entries", found.len()));
                }
            }
        }
        Ok(())
    }

    fn mismatch(&mut self, index: usize, operation: Operation, context: impl std::fmt::Display) {
        if !self.diverged {
            self.checker.add_violation(
                "tree disagrees with model",
                index,
                format!("{operation:?}: {context}"),
            );
        }
    }

    fn check_structure<M: NodeManager<i32, i32>>(&mut self, tree: &mut Tree<i32, i32, M>, index: usize) {
        if self.diverged {
            return;
        }
        match self.checker.check_tree(tree.manager_mut(), index) {
            Ok(count) if count != self.model.len() => self.checker.add_violation(
                "entry count disagrees with model",
                index,
                format!("tree holds {count}, model holds {}", self.model.len()),
            ),
            Ok(_) => {}
            Err(e) if !self.config.fault_config.is_fault_free() => {
                tracing::debug!("tree walk after operation {index} failed: {e}");
                self.diverged = true;
            }
            Err(e) => self.checker.add_violation("tree walk failed", index, e.to_string()),
        }
    }
}

/// Drives random record creates, updates and deletes against a map.
pub struct RecordSimulator {
    seed: u64,
    rng: StdRng,
    block_size: usize,
    max_record_len: usize,
    model: HashMap<BlockId, Vec<u8>>,
    checker: InvariantChecker,
}

impl RecordSimulator {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
            block_size: 256,
            max_record_len: 1200,
            model: HashMap::new(),
            checker: InvariantChecker::new(),
        }
    }

    pub fn run(&mut self, operation_count: usize) -> SimulationResult {
        let outcome = self.drive(operation_count).map_err(|e| e.to_string());
        SimulationResult {
            seed: self.seed,
            operations_run: operation_count as u64,
            successful_operations: if outcome.is_ok() { operation_count as u64 } else { 0 },
            failed_operations: u64::from(outcome.is_err()),
            invariant_violations: self.checker.violations().to_vec(),
            completed_successfully: outcome.is_ok(),
            error: outcome.err(),
        }
    }

    fn drive(&mut self, operation_count: usize) -> Result<(), StorageError> {
        let blocks = BlockStorage::new(SimulatedStream::new(self.seed), self.block_size, 48)?;
        let content_size = blocks.block_content_size();
        let mut records = RecordStorage::new(blocks)?;

        for index in 0..operation_count {
            let existing = self.pick_existing();
            match (self.rng.random_range(0..10), existing) {
                (0..5, _) | (_, None) => {
                    let data = self.payload();
                    let needed = data.len().div_ceil(content_size).max(1);
                    let free_before = records.free_block_count()?;
                    let blocks_before = records.block_storage().block_count()?;

                    let id = records.create(&data)?;

                    let blocks_after = records.block_storage().block_count()?;
                    if free_before >= needed && blocks_after != blocks_before {
                        self.checker.add_violation(
                            "stream grew while free blocks were available",
                            index,
                            format!("{free_before} free, {needed} needed"),
                        );
                    }
                    if self.model.insert(id, data).is_some() {
                        self.checker.add_violation("live record id reissued", index, format!("record {id}"));
                    }
                }
                (5..8, Some(id)) => {
                    let data = self.payload();
                    records.update(id, &data)?;
                    self.model.insert(id, data);
                }
                (_, Some(id)) => {
                    records.delete(id)?;
                    self.model.remove(&id);
                    if records.find(id)?.is_some() {
                        self.checker.add_violation("deleted record still visible", index, format!("record {id}"));
                    }
                }
            }

            if let Some(id) = self.pick_existing() {
                let found = records.find(id)?;
                if found.as_ref() != self.model.get(&id) {
                    self.checker.add_violation("record contents differ", index, format!("record {id}"));
                }
            }
        }

        // Everything must survive a reopen over the same bytes.
        let data = records.into_inner().into_inner()?.into_data();
        let blocks = BlockStorage::new(
            SimulatedStream::from_data(self.seed, data, FaultConfig::no_faults()),
            self.block_size,
            48,
        )?;
        let mut reopened = RecordStorage::new(blocks)?;
        let mut ids: Vec<BlockId> = self.model.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if reopened.find(id)?.as_ref() != self.model.get(&id) {
                self.checker.add_violation(
                    "record lost across reopen",
                    operation_count,
                    format!("record {id}"),
                );
            }
        }
        Ok(())
    }

    fn pick_existing(&mut self) -> Option<BlockId> {
        if self.model.is_empty() {
            return None;
        }
        let mut ids: Vec<BlockId> = self.model.keys().copied().collect();
        ids.sort_unstable();
        Some(ids[self.rng.random_range(0..ids.len())])
    }

    fn payload(&mut self) -> Vec<u8> {
        let len = self.rng.random_range(0..=self.max_record_len);
        let mut data = vec![0u8; len];
        self.rng.fill(data.as_mut_slice());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_passed(result: &SimulationResult) {
        let violations: Vec<String> = result
            .invariant_violations
            .iter()
            .map(|violation| {
                format!(
                    "op {}: {} ({})",
                    violation.operation_index, violation.description, violation.context
                )
            })
            .collect();
        assert!(
            result.passed(),
            "seed {} failed after {} operations: error={:?}, violations={violations:#?}",
            result.seed,
            result.operations_run,
            result.error,
        );
    }

    #[test]
    fn test_unique_memory_tree_matches_model() {
        for seed in 0..8 {
            let result = Simulator::new(SimulatorConfig::new(seed)).run(600);
            assert_passed(&result);
            assert_eq!(result.failed_operations, 0);
        }
    }

    #[test]
    fn test_duplicate_memory_tree_matches_model() {
        for seed in 0..8 {
            let config = SimulatorConfig::new(seed).with_duplicate_keys().with_key_space(25);
            assert_passed(&Simulator::new(config).run(600));
        }
    }

    #[test]
    fn test_wider_nodes_match_model() {
        for seed in 100..104 {
            let config = SimulatorConfig::new(seed).with_min_entries(5).with_key_space(1000);
            assert_passed(&Simulator::new(config).run(1500));
        }
    }

    #[test]
    fn test_unique_disk_tree_matches_model() {
        for seed in 0..3 {
            let config = SimulatorConfig::new(seed).with_manager(ManagerKind::Disk);
            assert_passed(&Simulator::new(config).run(400));
        }
    }

    #[test]
    fn test_duplicate_disk_tree_matches_model() {
        for seed in 0..3 {
            let config = SimulatorConfig::new(seed)
                .with_manager(ManagerKind::Disk)
                .with_duplicate_keys()
                .with_key_space(20);
            assert_passed(&Simulator::new(config).run(400));
        }
    }

    #[test]
    fn test_runs_are_deterministic() {
        let config = SimulatorConfig::new(77)
            .with_manager(ManagerKind::Disk)
            .with_fault_config(FaultConfig::low_faults());
        let first = Simulator::new(config.clone()).run(300);
        let second = Simulator::new(config).run(300);
        assert_eq!(first.successful_operations, second.successful_operations);
        assert_eq!(first.failed_operations, second.failed_operations);
        assert_eq!(first.error, second.error);
    }

    #[test]
    fn test_injected_faults_surface_as_errors() {
        for seed in 0..4 {
            let config = SimulatorConfig::new(seed)
                .with_manager(ManagerKind::Disk)
                .with_fault_config(FaultConfig::high_faults());
            let result = Simulator::new(config).run(200);
            assert!(
                result.failed_operations > 0 || result.error.is_some(),
                "seed {seed}: high fault rate produced no failures"
            );
            assert!(result.invariant_violations.is_empty());
        }
    }

    #[test]
    fn test_record_storage_matches_model() {
        for seed in 0..6 {
            assert_passed(&RecordSimulator::new(seed).run(300));
        }
    }
}
