//! Binary layout of a tree node inside a record.
//!
//! ```text
//! u32 parent_id | u32 entry_count | u32 child_count | entries | child_count x u32 child_id
//! ```
//!
//! All integers are little-endian. With fixed-size keys and values an entry
//! is `key | value`. With variable-size keys (values still fixed) an entry is
//! `u32 key_len | key | value`.

use std::marker::PhantomData;

use crate::storage::btree::codec::Codec;
use crate::storage::btree::error::TreeError;
use crate::storage::btree::node::{NodeId, TreeNode};

/// Nodes encoding to this many bytes or more are rejected.
pub const MAX_SERIALIZED_NODE_SIZE: usize = 64 * 1024;

const NODE_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Fixed { key_len: usize, value_len: usize },
    VariableKey { value_len: usize },
}

/// Encodes and decodes nodes with a key codec and a value codec.
#[derive(Debug, Clone)]
pub struct NodeSerializer<K, V, KC, VC> {
    key_codec: KC,
    value_codec: VC,
    layout: Layout,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KC, VC> NodeSerializer<K, V, KC, VC>
where
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// # Errors
    ///
    /// [`TreeError::Unsupported`] when the value codec is not fixed-size.
    pub fn new(key_codec: KC, value_codec: VC) -> Result<Self, TreeError> {
        let layout = match (key_codec.fixed_length(), value_codec.fixed_length()) {
            (Some(key_len), Some(value_len)) => Layout::Fixed { key_len, value_len },
            (None, Some(value_len)) => Layout::VariableKey { value_len },
            (_, None) => {
                return Err(TreeError::Unsupported(
                    "variable-size values cannot be stored in tree nodes".to_string(),
                ));
            }
        };
        Ok(Self {
            key_codec,
            value_codec,
            layout,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        matches!(self.layout, Layout::Fixed { .. })
    }

    pub fn serialize(&self, node: &TreeNode<K, V>) -> Result<Vec<u8>, TreeError> {
        let entry_count = u32_len(node.entries_count(), "entry count")?;
        let child_count = u32_len(node.children_count(), "child count")?;

        let mut buf = Vec::with_capacity(self.estimated_size(node));
        buf.extend_from_slice(&node.parent_id().to_le_bytes());
        buf.extend_from_slice(&entry_count.to_le_bytes());
        buf.extend_from_slice(&child_count.to_le_bytes());

        for (key, value) in node.entries() {
            let key_bytes = self.key_codec.serialize(key);
            let value_bytes = self.value_codec.serialize(value);
            match self.layout {
                Layout::Fixed { key_len, value_len } => {
                    check_len(key_bytes.len(), key_len, "key")?;
                    check_len(value_bytes.len(), value_len, "value")?;
                }
                Layout::VariableKey { value_len } => {
                    check_len(value_bytes.len(), value_len, "value")?;
                    buf.extend_from_slice(&u32_len(key_bytes.len(), "key length")?.to_le_bytes());
                }
            }
            buf.extend_from_slice(&key_bytes);
            buf.extend_from_slice(&value_bytes);
        }

        for child in node.children() {
            buf.extend_from_slice(&child.to_le_bytes());
        }

        if buf.len() >= MAX_SERIALIZED_NODE_SIZE {
            return Err(TreeError::Serialization(format!(
                "node {} encodes to {} bytes, limit is {MAX_SERIALIZED_NODE_SIZE}",
                node.id(),
                buf.len()
            )));
        }
        Ok(buf)
    }

    pub fn deserialize(&self, id: NodeId, bytes: &[u8]) -> Result<TreeNode<K, V>, TreeError> {
        let mut reader = Reader { bytes, pos: 0 };
        let parent_id = reader.u32()?;
        let entry_count = reader.u32()? as usize;
        let child_count = reader.u32()? as usize;

        if child_count != 0 && child_count != entry_count + 1 {
            return Err(TreeError::Serialization(format!(
                "node {id} has {entry_count} entries but {child_count} children"
            )));
        }

        let mut entries = Vec::with_capacity(entry_count.min(bytes.len()));
        for _ in 0..entry_count {
            let (key_len, value_len) = match self.layout {
                Layout::Fixed { key_len, value_len } => (key_len, value_len),
                Layout::VariableKey { value_len } => (reader.u32()? as usize, value_len),
            };
            let key = self.key_codec.deserialize(reader.take(key_len)?)?;
            let value = self.value_codec.deserialize(reader.take(value_len)?)?;
            entries.push((key, value));
        }

        let mut children = Vec::with_capacity(child_count.min(bytes.len()));
        for _ in 0..child_count {
            children.push(reader.u32()?);
        }

        Ok(TreeNode::new(id, parent_id, entries, children))
    }

    fn estimated_size(&self, node: &TreeNode<K, V>) -> usize {
        let per_entry = match self.layout {
            Layout::Fixed { key_len, value_len } => key_len + value_len,
            Layout::VariableKey { value_len } => 4 + 16 + value_len,
        };
        NODE_HEADER_SIZE + per_entry * node.entries_count() + 4 * node.children_count()
    }
}

fn u32_len(len: usize, what: &str) -> Result<u32, TreeError> {
    u32::try_from(len).map_err(|_| TreeError::Serialization(format!("{what} {len} overflows u32")))
}

fn check_len(actual: usize, expected: usize, what: &str) -> Result<(), TreeError> {
    if actual == expected {
        Ok(())
    } else {
        Err(TreeError::Serialization(format!(
            "fixed-size {what} encoded to {actual} bytes, expected {expected}"
        )))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], TreeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                TreeError::Serialization(format!(
                    "node truncated: need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, TreeError> {
        let bytes = self.take(4)?;
        let mut array = [0u8; 4];
        array.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(array))
    }
}
