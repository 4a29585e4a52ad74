//! Block, record and index storage over a single stream.
//!
//! # Layers
//!
//! - [`BlockStorage`]: the stream as an array of fixed-size blocks, each with
//!   a small header of 8-byte slots
//! - [`RecordStorage`]: variable-length records as chains of blocks, with a
//!   free list of reusable blocks kept in record 0
//! - [`btree`]: a B-tree index whose nodes can live in records
//!
//! # Usage
//!
//! ```
//! use std::io::Cursor;
//! use engine::storage::{BlockStorage, RecordStorage};
//!
//! let blocks = BlockStorage::with_defaults(Cursor::new(Vec::new())).unwrap();
//! let mut records = RecordStorage::new(blocks).unwrap();
//!
//! let id = records.create(b"hello").unwrap();
//! assert_eq!(records.find(id).unwrap(), Some(b"hello".to_vec()));
//!
//! records.delete(id).unwrap();
//! assert_eq!(records.find(id).unwrap(), None);
//! ```

pub mod btree;
pub(crate) mod block;
pub(crate) mod io;
pub(crate) mod record;

pub use block::{
    Block, BlockGeometry, BlockId, BlockStorage, DEFAULT_BLOCK_HEADER_SIZE, DEFAULT_BLOCK_SIZE,
    HEADER_SLOT_SIZE, MIN_BLOCK_SIZE,
};
pub use io::{StorageError, Stream};
pub use record::{FREE_LIST_RECORD, MAX_RECORD_SIZE, MIN_RECORD_HEADER_SIZE, RecordStorage};
