//! Fixed-size block allocation over a byte stream.
//!
//! The stream is divided into equally sized blocks. Each block starts with a
//! header made of 8-byte little-endian slots, followed by content bytes:
//!
//! ```text
//! +------------------------+--------------------------------------------+
//! | Header (header_size)   | Content (block_size - header_size)         |
//! | slot 0 | slot 1 | ...  |                                            |
//! +------------------------+--------------------------------------------+
//! |<---- first sector (4096 or 128 bytes) ---->|
//! ```
//!
//! The first sector of an open block is held in memory. Header writes and
//! content writes that land in the first sector only touch that buffer; it is
//! written back as one sector-sized write when the block is released. Content
//! beyond the first sector is read from and written to the stream directly.
//!
//! # Invariants
//!
//! - `header_size < block_size` and `header_size <= sector_size`
//! - `block_size` is a multiple of `sector_size`
//! - At most one in-memory first sector exists per block id; every handle
//!   returned for an open id shares it

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::rc::Rc;

use crate::config::EngineConfig;
use crate::storage::io::{StorageError, Stream};

/// A block identifier (0-indexed block number within the stream).
pub type BlockId = u32;

/// Default block size in bytes (40KB).
pub const DEFAULT_BLOCK_SIZE: usize = 40_960;

/// Default header size in bytes (six 8-byte slots).
pub const DEFAULT_BLOCK_HEADER_SIZE: usize = 48;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Size of one header slot.
pub const HEADER_SLOT_SIZE: usize = 8;

const LARGE_SECTOR_SIZE: usize = 4096;
const SMALL_SECTOR_SIZE: usize = 128;

/// Largest single transfer issued to the stream for block content.
const IO_CHUNK_SIZE: usize = 4096;

/// Block size, header size and the derived content and sector sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    block_size: usize,
    header_size: usize,
    content_size: usize,
    sector_size: usize,
}

impl BlockGeometry {
    /// Validate and build a geometry.
    pub fn new(block_size: usize, header_size: usize) -> Result<Self, StorageError> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "block size {block_size} is smaller than {MIN_BLOCK_SIZE}"
            )));
        }
        if header_size >= block_size {
            return Err(StorageError::InvalidArgument(format!(
                "header size {header_size} must be smaller than block size {block_size}"
            )));
        }

        let sector_size = if block_size >= LARGE_SECTOR_SIZE {
            LARGE_SECTOR_SIZE
        } else {
            SMALL_SECTOR_SIZE
        };

        if header_size > sector_size {
            return Err(StorageError::InvalidArgument(format!(
                "header size {header_size} does not fit in a {sector_size}-byte sector"
            )));
        }
        if block_size % sector_size != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "block size {block_size} is not a multiple of the {sector_size}-byte sector"
            )));
        }

        Ok(Self {
            block_size,
            header_size,
            content_size: block_size - header_size,
            sector_size,
        })
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub const fn header_size(&self) -> usize {
        self.header_size
    }

    #[must_use]
    pub const fn content_size(&self) -> usize {
        self.content_size
    }

    #[must_use]
    pub const fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Number of header slots available per block.
    #[must_use]
    pub const fn header_slots(&self) -> usize {
        self.header_size / HEADER_SLOT_SIZE
    }

    /// Byte offset of a block within the stream.
    #[must_use]
    pub const fn block_position(&self, id: BlockId) -> u64 {
        id as u64 * self.block_size as u64
    }
}

/// Shared state of the stream and every block currently open on it.
struct StorageInner<S: Stream> {
    stream: S,
    geometry: BlockGeometry,
    open_blocks: HashMap<BlockId, Rc<RefCell<BlockState>>>,
}

/// In-memory state of one open block.
struct BlockState {
    first_sector: Vec<u8>,
    dirty: bool,
    released: bool,
}

/// Block allocator over a [`Stream`].
pub struct BlockStorage<S: Stream> {
    inner: Rc<RefCell<StorageInner<S>>>,
}

impl<S: Stream> BlockStorage<S> {
    /// Create block storage over `stream` with the given geometry.
    pub fn new(stream: S, block_size: usize, header_size: usize) -> Result<Self, StorageError> {
        let geometry = BlockGeometry::new(block_size, header_size)?;
        Ok(Self {
            inner: Rc::new(RefCell::new(StorageInner {
                stream,
                geometry,
                open_blocks: HashMap::new(),
            })),
        })
    }

    /// Create block storage with the default 40KB / 48-byte geometry.
    pub fn with_defaults(stream: S) -> Result<Self, StorageError> {
        Self::new(stream, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_HEADER_SIZE)
    }

    /// Create block storage using the geometry from an [`EngineConfig`].
    pub fn with_config(stream: S, config: &EngineConfig) -> Result<Self, StorageError> {
        Self::new(stream, config.block_size, config.block_header_size)
    }

    #[must_use]
    pub fn geometry(&self) -> BlockGeometry {
        self.inner.borrow().geometry
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.geometry().block_size()
    }

    #[must_use]
    pub fn block_header_size(&self) -> usize {
        self.geometry().header_size()
    }

    #[must_use]
    pub fn block_content_size(&self) -> usize {
        self.geometry().content_size()
    }

    #[must_use]
    pub fn disk_sector_size(&self) -> usize {
        self.geometry().sector_size()
    }

    /// Number of whole blocks currently in the stream.
    pub fn block_count(&self) -> Result<u64, StorageError> {
        let mut inner = self.inner.borrow_mut();
        let block_size = inner.geometry.block_size() as u64;
        Ok(inner.stream.len()? / block_size)
    }

    /// Number of blocks with an open handle.
    #[must_use]
    pub fn open_block_count(&self) -> usize {
        self.inner.borrow().open_blocks.len()
    }

    /// Extend the stream by exactly one block and return it, zero-initialized.
    pub fn create_new(&mut self) -> Result<Block<S>, StorageError> {
        let (id, geometry) = {
            let mut inner = self.inner.borrow_mut();
            let geometry = inner.geometry;
            let len = inner.stream.len()?;
            let block_size = geometry.block_size() as u64;

            if len % block_size != 0 {
                return Err(StorageError::Corruption(format!(
                    "unexpected stream length {len} (not a multiple of {block_size})"
                )));
            }

            let id = BlockId::try_from(len / block_size).map_err(|_| {
                StorageError::InvalidArgument(format!("stream of {len} bytes exceeds block id range"))
            })?;

            inner.stream.set_len(len + block_size)?;
            inner.stream.flush()?;
            (id, geometry)
        };

        tracing::debug!("allocated block {id} (stream grown by {} bytes)", geometry.block_size());
        Ok(self.open(id, vec![0u8; geometry.sector_size()]))
    }

    /// Find an existing block, or `None` if `id` lies beyond the end of the stream.
    ///
    /// Repeated calls for an id that is still open share the same in-memory sector.
    pub fn find(&mut self, id: BlockId) -> Result<Option<Block<S>>, StorageError> {
        let first_sector = {
            let mut inner = self.inner.borrow_mut();
            if let Some(state) = inner.open_blocks.get(&id) {
                return Ok(Some(Block {
                    id,
                    geometry: inner.geometry,
                    state: Rc::clone(state),
                    storage: Rc::clone(&self.inner),
                }));
            }

            let geometry = inner.geometry;
            let position = geometry.block_position(id);
            if position + geometry.block_size() as u64 > inner.stream.len()? {
                return Ok(None);
            }

            let mut first_sector = vec![0u8; geometry.sector_size()];
            inner.stream.seek(SeekFrom::Start(position))?;
            inner.stream.read_exact(&mut first_sector)?;
            first_sector
        };

        Ok(Some(self.open(id, first_sector)))
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.inner.borrow_mut().stream.flush()?;
        Ok(())
    }

    /// Recover the underlying stream.
    ///
    /// Fails while any block handle is still alive.
    pub fn into_inner(self) -> Result<S, StorageError> {
        let cell = Rc::try_unwrap(self.inner).map_err(|_| {
            StorageError::InvalidArgument("block handles are still open".to_string())
        })?;
        let mut inner = cell.into_inner();
        inner.stream.flush()?;
        Ok(inner.stream)
    }

    fn open(&self, id: BlockId, first_sector: Vec<u8>) -> Block<S> {
        let state = Rc::new(RefCell::new(BlockState {
            first_sector,
            dirty: false,
            released: false,
        }));
        let mut inner = self.inner.borrow_mut();
        inner.open_blocks.insert(id, Rc::clone(&state));

        Block {
            id,
            geometry: inner.geometry,
            state,
            storage: Rc::clone(&self.inner),
        }
    }
}

impl<S: Stream> std::fmt::Debug for BlockStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("BlockStorage")
            .field("geometry", &inner.geometry)
            .field("open_blocks", &inner.open_blocks.len())
            .finish_non_exhaustive()
    }
}

/// A handle to one block.
///
/// Header writes are buffered until the handle is released, either with
/// [`Block::release`] or by dropping it. The flush happens exactly once.
pub struct Block<S: Stream> {
    id: BlockId,
    geometry: BlockGeometry,
    state: Rc<RefCell<BlockState>>,
    storage: Rc<RefCell<StorageInner<S>>>,
}

impl<S: Stream> Block<S> {
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    /// Read a header slot.
    pub fn header(&self, field: usize) -> Result<u64, StorageError> {
        let state = self.state.borrow();
        self.check_field(&state, field)?;
        let offset = field * HEADER_SLOT_SIZE;
        let mut bytes = [0u8; HEADER_SLOT_SIZE];
        bytes.copy_from_slice(&state.first_sector[offset..offset + HEADER_SLOT_SIZE]);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a header slot. Buffered until release.
    pub fn set_header(&self, field: usize, value: u64) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        self.check_field(&state, field)?;
        let offset = field * HEADER_SLOT_SIZE;
        state.first_sector[offset..offset + HEADER_SLOT_SIZE].copy_from_slice(&value.to_le_bytes());
        state.dirty = true;
        Ok(())
    }

    /// Copy `count` content bytes starting at `block_offset` into
    /// `buffer[buffer_offset..]`.
    pub fn read(
        &self,
        buffer: &mut [u8],
        buffer_offset: usize,
        block_offset: usize,
        count: usize,
    ) -> Result<(), StorageError> {
        let state = self.state.borrow();
        if state.released {
            return Err(StorageError::Disposed(self.id));
        }
        self.check_range("source", block_offset, count, self.geometry.content_size())?;
        self.check_range("destination", buffer_offset, count, buffer.len())?;

        let start = self.geometry.header_size() + block_offset;
        let mut copied = 0;

        if start < self.geometry.sector_size() {
            copied = (self.geometry.sector_size() - start).min(count);
            buffer[buffer_offset..buffer_offset + copied]
                .copy_from_slice(&state.first_sector[start..start + copied]);
        }

        if copied < count {
            let mut inner = self.storage.borrow_mut();
            let position = self.geometry.block_position(self.id) + (start + copied) as u64;
            inner.stream.seek(SeekFrom::Start(position))?;
            for chunk in
                buffer[buffer_offset + copied..buffer_offset + count].chunks_mut(IO_CHUNK_SIZE)
            {
                inner.stream.read_exact(chunk)?;
            }
        }

        Ok(())
    }

    /// Copy `count` bytes from `buffer[buffer_offset..]` into the block
    /// content starting at `block_offset`.
    pub fn write(
        &self,
        buffer: &[u8],
        buffer_offset: usize,
        block_offset: usize,
        count: usize,
    ) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        if state.released {
            return Err(StorageError::Disposed(self.id));
        }
        self.check_range("destination", block_offset, count, self.geometry.content_size())?;
        self.check_range("source", buffer_offset, count, buffer.len())?;

        let start = self.geometry.header_size() + block_offset;
        let mut written = 0;

        if start < self.geometry.sector_size() {
            written = (self.geometry.sector_size() - start).min(count);
            state.first_sector[start..start + written]
                .copy_from_slice(&buffer[buffer_offset..buffer_offset + written]);
            state.dirty = true;
        }

        if written < count {
            let mut inner = self.storage.borrow_mut();
            let position = self.geometry.block_position(self.id) + (start + written) as u64;
            inner.stream.seek(SeekFrom::Start(position))?;
            for chunk in buffer[buffer_offset + written..buffer_offset + count].chunks(IO_CHUNK_SIZE)
            {
                inner.stream.write_all(chunk)?;
            }
            inner.stream.flush()?;
        }

        Ok(())
    }

    /// Flush the buffered first sector (if dirty) and close the handle.
    pub fn release(self) -> Result<(), StorageError> {
        self.release_inner()
        // Drop runs afterwards and finds the block already released.
    }

    /// Whether this handle (or another handle for the same id) was released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.state.borrow().released
    }

    fn release_inner(&self) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        if state.released {
            return Ok(());
        }
        state.released = true;

        let mut inner = self.storage.borrow_mut();
        inner.open_blocks.remove(&self.id);

        if state.dirty {
            state.dirty = false;
            let position = self.geometry.block_position(self.id);
            inner.stream.seek(SeekFrom::Start(position))?;
            inner.stream.write_all(&state.first_sector)?;
            inner.stream.flush()?;
        }

        Ok(())
    }

    fn check_field(&self, state: &BlockState, field: usize) -> Result<(), StorageError> {
        if state.released {
            return Err(StorageError::Disposed(self.id));
        }
        if field >= self.geometry.header_slots() {
            return Err(StorageError::InvalidArgument(format!(
                "invalid header field {field} (block has {} slots)",
                self.geometry.header_slots()
            )));
        }
        Ok(())
    }

    fn check_range(
        &self,
        what: &str,
        offset: usize,
        count: usize,
        limit: usize,
    ) -> Result<(), StorageError> {
        match offset.checked_add(count) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(StorageError::InvalidArgument(format!(
                "block {}: requested {count} bytes at {what} offset {offset} exceeds {what} bounds ({limit})",
                self.id
            ))),
        }
    }
}

impl<S: Stream> Drop for Block<S> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!("failed to flush block {} on release: {e}", self.id);
        }
    }
}

impl<S: Stream> std::fmt::Debug for Block<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("dirty", &state.dirty)
            .field("released", &state.released)
            .finish_non_exhaustive()
    }
}
