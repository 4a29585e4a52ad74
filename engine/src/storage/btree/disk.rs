//! Node manager persisting nodes as records.
//!
//! Each node lives in its own record and the node id is the record id.
//! Record 1 holds the current root id as a little-endian `u32`; on an empty
//! stream it is created pointing at record 2, the first (empty) root.
//!
//! Nodes are cached in two places:
//!
//! - a bounded LRU of clean nodes, which may drop entries at any time
//! - a dirty map holding every node changed through `find_mut`, pinned until
//!   `save_changes` writes it back and moves it to the LRU

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::config::EngineConfig;
use crate::storage::btree::codec::Codec;
use crate::storage::btree::error::TreeError;
use crate::storage::btree::manager::{KeyComparer, NodeManager, default_comparer};
use crate::storage::btree::node::{NodeId, TreeNode};
use crate::storage::btree::serializer::NodeSerializer;
use crate::storage::{BlockStorage, RecordStorage, StorageError, Stream};

/// Record holding the root node id.
pub const ROOT_POINTER_RECORD: NodeId = 1;

pub const DEFAULT_MIN_ENTRIES_PER_NODE: usize = EngineConfig::DEFAULT_MIN_ENTRIES_PER_NODE;
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = EngineConfig::DEFAULT_NODE_CACHE_CAPACITY;

const FIRST_ROOT_NODE: NodeId = 2;

pub struct DiskNodeManager<K, V, S: Stream, KC, VC> {
    records: RecordStorage<S>,
    serializer: NodeSerializer<K, V, KC, VC>,
    comparer: KeyComparer<K>,
    min_entries: usize,
    root_id: NodeId,
    cache: LruCache<NodeId, TreeNode<K, V>>,
    dirty: BTreeMap<NodeId, TreeNode<K, V>>,
}

impl<K, V, S, KC, VC> DiskNodeManager<K, V, S, KC, VC>
where
    K: Ord + 'static,
    S: Stream,
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Open a tree over `stream` with the default block geometry.
    pub fn open(
        stream: S,
        key_codec: KC,
        value_codec: VC,
        min_entries: usize,
    ) -> Result<Self, TreeError> {
        let records = RecordStorage::new(BlockStorage::with_defaults(stream)?)?;
        Self::new(records, key_codec, value_codec, min_entries)
    }

    /// Open a tree over `stream` with geometry and tuning from `config`.
    pub fn with_config(
        stream: S,
        key_codec: KC,
        value_codec: VC,
        config: &EngineConfig,
    ) -> Result<Self, TreeError> {
        let records = RecordStorage::new(BlockStorage::with_config(stream, config)?)?;
        Self::with_comparer(
            records,
            key_codec,
            value_codec,
            default_comparer(),
            config.min_entries_per_node,
            config.node_cache_capacity,
        )
    }

    pub fn new(
        records: RecordStorage<S>,
        key_codec: KC,
        value_codec: VC,
        min_entries: usize,
    ) -> Result<Self, TreeError> {
        Self::with_comparer(
            records,
            key_codec,
            value_codec,
            default_comparer(),
            min_entries,
            DEFAULT_NODE_CACHE_CAPACITY,
        )
    }
}

impl<K, V, S, KC, VC> DiskNodeManager<K, V, S, KC, VC>
where
    S: Stream,
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Open a tree over `records`, creating the root pointer and an empty
    /// root node if the storage holds no tree yet.
    ///
    /// # Errors
    ///
    /// - [`TreeError::Unsupported`] if the codecs cannot be laid out in a node
    /// - [`TreeError::InvalidOperation`] if `cache_capacity` is 0
    /// - [`TreeError::Corruption`] if record 1 exists but is not a root pointer,
    ///   or the storage already holds unrelated records
    pub fn with_comparer(
        mut records: RecordStorage<S>,
        key_codec: KC,
        value_codec: VC,
        comparer: KeyComparer<K>,
        min_entries: usize,
        cache_capacity: usize,
    ) -> Result<Self, TreeError> {
        let serializer = NodeSerializer::new(key_codec, value_codec)?;
        let capacity = NonZeroUsize::new(cache_capacity).ok_or_else(|| {
            TreeError::InvalidOperation("node cache capacity must be at least 1".to_string())
        })?;

        let root_id = match records.find(ROOT_POINTER_RECORD)? {
            Some(bytes) => decode_root_pointer(&bytes)?,
            None => initialize(&mut records, &serializer)?,
        };

        Ok(Self {
            records,
            serializer,
            comparer,
            min_entries: min_entries.max(1),
            root_id,
            cache: LruCache::new(capacity),
            dirty: BTreeMap::new(),
        })
    }

    /// Save pending changes and hand back the record storage.
    pub fn into_records(mut self) -> Result<RecordStorage<S>, TreeError> {
        self.save_changes()?;
        Ok(self.records)
    }

    #[must_use]
    pub fn cached_node_count(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn dirty_node_count(&self) -> usize {
        self.dirty.len()
    }

    fn load(&mut self, id: NodeId) -> Result<TreeNode<K, V>, TreeError> {
        if id == 0 || id == ROOT_POINTER_RECORD {
            return Err(TreeError::NodeNotFound(id));
        }
        let bytes = self
            .records
            .find(id)?
            .ok_or(TreeError::NodeNotFound(id))?;
        self.serializer.deserialize(id, &bytes)
    }

    fn cache_clean(&mut self, node: TreeNode<K, V>) {
        let id = node.id();
        if let Some((evicted, _)) = self.cache.push(id, node)
            && evicted != id
        {
            tracing::trace!("evicted tree node {evicted} from cache");
        }
    }
}

impl<K, V, S, KC, VC> NodeManager<K, V> for DiskNodeManager<K, V, S, KC, VC>
where
    S: Stream,
    KC: Codec<K>,
    VC: Codec<V>,
{
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
        let id = self.records.create_empty()?;
        let node = TreeNode::new(id, 0, entries, children);
        let written = self
            .serializer
            .serialize(&node)
            .and_then(|bytes| self.records.update(id, &bytes).map_err(TreeError::from));
        if let Err(e) = written {
            self.records.delete(id)?;
            return Err(e);
        }
        self.cache_clean(node);
        Ok(id)
    }

    fn find(&mut self, id: NodeId) -> Result<&TreeNode<K, V>, TreeError> {
        if self.dirty.contains_key(&id) {
            return self.dirty.get(&id).ok_or(TreeError::NodeNotFound(id));
        }
        if !self.cache.contains(&id) {
            let node = self.load(id)?;
            self.cache_clean(node);
        }
        self.cache.get(&id).ok_or(TreeError::NodeNotFound(id))
    }

    fn find_mut(&mut self, id: NodeId) -> Result<&mut TreeNode<K, V>, TreeError> {
        if !self.dirty.contains_key(&id) {
            let node = match self.cache.pop(&id) {
                Some(node) => node,
                None => self.load(id)?,
            };
            self.dirty.insert(id, node);
        }
        self.dirty.get_mut(&id).ok_or(TreeError::NodeNotFound(id))
    }

    fn make_root(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.records.update(ROOT_POINTER_RECORD, &id.to_le_bytes())?;
        tracing::debug!("tree root moved from node {} to {id}", self.root_id);
        self.root_id = id;
        Ok(())
    }

    fn delete(&mut self, id: NodeId) -> Result<(), TreeError> {
        if id == ROOT_POINTER_RECORD {
            return Err(TreeError::NodeNotFound(id));
        }
        self.records.delete(id).map_err(|e| match e {
            StorageError::NotFound(_) => TreeError::NodeNotFound(id),
            other => TreeError::Storage(other),
        })?;
        self.dirty.remove(&id);
        self.cache.pop(&id);
        Ok(())
    }

    fn save_changes(&mut self) -> Result<(), TreeError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        for node in self.dirty.values() {
            let bytes = self.serializer.serialize(node)?;
            self.records.update(node.id(), &bytes)?;
        }
        let saved = std::mem::take(&mut self.dirty);
        tracing::debug!("saved {} tree nodes", saved.len());
        for (_, node) in saved {
            self.cache_clean(node);
        }
        Ok(())
    }
}

impl<K, V, S: Stream, KC, VC> std::fmt::Debug for DiskNodeManager<K, V, S, KC, VC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskNodeManager")
            .field("root_id", &self.root_id)
            .field("min_entries", &self.min_entries)
            .field("cached", &self.cache.len())
            .field("dirty", &self.dirty.len())
            .finish_non_exhaustive()
    }
}

fn decode_root_pointer(bytes: &[u8]) -> Result<NodeId, TreeError> {
    let array: [u8; 4] = bytes.try_into().map_err(|_| {
        TreeError::Corruption(format!(
            "root pointer record holds {} bytes, expected 4",
            bytes.len()
        ))
    })?;
    let root_id = NodeId::from_le_bytes(array);
    if root_id <= ROOT_POINTER_RECORD {
        return Err(TreeError::Corruption(format!("root pointer names record {root_id}")));
    }
    Ok(root_id)
}

/// Write the root pointer and an empty root node into fresh storage.
fn initialize<K, V, S, KC, VC>(
    records: &mut RecordStorage<S>,
    serializer: &NodeSerializer<K, V, KC, VC>,
) -> Result<NodeId, TreeError>
where
    S: Stream,
    KC: Codec<K>,
    VC: Codec<V>,
{
    let pointer = records.create(&FIRST_ROOT_NODE.to_le_bytes())?;
    if pointer != ROOT_POINTER_RECORD {
        return Err(TreeError::Corruption(format!(
            "storage already holds records; root pointer landed in record {pointer}"
        )));
    }

    let root_id = records.create_empty()?;
    let root = TreeNode::new(root_id, 0, Vec::new(), Vec::new());
    records.update(root_id, &serializer.serialize(&root)?)?;
    if root_id != FIRST_ROOT_NODE {
        records.update(ROOT_POINTER_RECORD, &root_id.to_le_bytes())?;
    }

    tracing::debug!("initialized tree storage with root node {root_id}");
    Ok(root_id)
}
