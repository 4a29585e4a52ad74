//! Errors for the index layer.

use crate::storage::btree::node::NodeId;
use crate::storage::StorageError;

/// Errors from encoding or decoding a single key or value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input length differs from the codec's fixed length.
    LengthMismatch { expected: usize, actual: usize },
    /// String bytes are not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthMismatch { expected, actual } => {
                write!(f, "expected {expected} bytes, got {actual}")
            }
            Self::InvalidUtf8 => write!(f, "invalid UTF-8"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors that can occur in tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// Error from the record or block layer.
    Storage(StorageError),
    /// Error decoding a key or value.
    Codec(CodecError),
    /// Insert of an existing key into a unique tree.
    DuplicateKey,
    /// Operation not valid for this tree's duplicate-key policy.
    InvalidOperation(String),
    /// Key/value codec combination cannot be serialized.
    Unsupported(String),
    /// A referenced node does not exist.
    NodeNotFound(NodeId),
    /// Tree structure is inconsistent (broken parent/child links).
    Corruption(String),
    /// A node cannot be encoded or decoded.
    Serialization(String),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::DuplicateKey => write!(f, "key already exists"),
            Self::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Self::NodeNotFound(id) => write!(f, "node {id} not found"),
            Self::Corruption(msg) => write!(f, "tree corruption: {msg}"),
            Self::Serialization(msg) => write!(f, "node serialization failed: {msg}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for TreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<CodecError> for TreeError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
