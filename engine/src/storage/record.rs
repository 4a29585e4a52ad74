//! Variable-length records built from chains of blocks.
//!
//! A record is a singly linked list of blocks. Each block's header carries
//! the chain links and how many content bytes it holds; only the head block
//! stores the total record length.
//!
//! ```text
//! slot 0: next block id      (0 terminates the chain)
//! slot 1: record length      (head block only)
//! slot 2: block content length
//! slot 3: previous block id  (0 on the head block)
//! slot 4: is deleted         (1 = logically absent)
//! ```
//!
//! Record 0 is reserved for the free list: a packed sequence of 4-byte
//! little-endian block ids appended to and popped from the tail of record 0's
//! own chain. It is created the first time the free list is consulted, so the
//! first user record gets id 1.

use crate::storage::block::{Block, BlockId, BlockStorage};
use crate::storage::io::{StorageError, Stream};

/// Largest record that will be read back (4MB).
pub const MAX_RECORD_SIZE: usize = 4 * 1024 * 1024;

/// Smallest block header able to hold every record header slot.
pub const MIN_RECORD_HEADER_SIZE: usize = 48;

/// Record holding the free block list.
pub const FREE_LIST_RECORD: BlockId = 0;

const NEXT_BLOCK_ID: usize = 0;
const RECORD_LENGTH: usize = 1;
const BLOCK_CONTENT_LENGTH: usize = 2;
const PREVIOUS_BLOCK_ID: usize = 3;
const IS_DELETED: usize = 4;

const HEADER_FIELDS: [usize; 5] = [
    NEXT_BLOCK_ID,
    RECORD_LENGTH,
    BLOCK_CONTENT_LENGTH,
    PREVIOUS_BLOCK_ID,
    IS_DELETED,
];

const FREE_ID_SIZE: usize = 4;

/// Record layer on top of [`BlockStorage`].
pub struct RecordStorage<S: Stream> {
    storage: BlockStorage<S>,
}

impl<S: Stream> RecordStorage<S> {
    pub fn new(storage: BlockStorage<S>) -> Result<Self, StorageError> {
        if storage.block_header_size() < MIN_RECORD_HEADER_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "block header size {} is too small for records (need {MIN_RECORD_HEADER_SIZE})",
                storage.block_header_size()
            )));
        }
        Ok(Self { storage })
    }

    #[must_use]
    pub const fn block_storage(&self) -> &BlockStorage<S> {
        &self.storage
    }

    /// Give back the underlying block storage.
    pub fn into_inner(self) -> BlockStorage<S> {
        self.storage
    }

    /// Read a record.
    ///
    /// Returns `None` for ids beyond the stream, deleted records, blocks that
    /// are not the head of a chain, and the reserved free list record.
    pub fn find(&mut self, id: BlockId) -> Result<Option<Vec<u8>>, StorageError> {
        if id == FREE_LIST_RECORD {
            return Ok(None);
        }

        let Some(head) = self.storage.find(id)? else {
            return Ok(None);
        };
        if head.header(IS_DELETED)? == 1 || head.header(PREVIOUS_BLOCK_ID)? != 0 {
            return Ok(None);
        }

        let total = header_as_usize(&head, RECORD_LENGTH)?;
        if total > MAX_RECORD_SIZE {
            return Err(StorageError::Corruption(format!(
                "record {id} declares length {total} (max {MAX_RECORD_SIZE})"
            )));
        }

        let mut data = vec![0u8; total];
        let mut read = 0;
        let mut current = head;

        loop {
            let length = self.content_length(&current)?;
            if read + length > total {
                return Err(StorageError::Corruption(format!(
                    "record {id} chain holds more than its declared {total} bytes"
                )));
            }

            current.read(&mut data, read, 0, length)?;
            read += length;

            let next = next_block_id(&current)?;
            current.release()?;
            if next == 0 {
                break;
            }

            current = self.storage.find(next)?.ok_or_else(|| {
                StorageError::Corruption(format!("record {id}: block {next} not found"))
            })?;
        }

        if read != total {
            return Err(StorageError::Corruption(format!(
                "record {id} chain holds {read} bytes, expected {total}"
            )));
        }

        Ok(Some(data))
    }

    /// Create a record holding `data`, returning its id.
    pub fn create(&mut self, data: &[u8]) -> Result<BlockId, StorageError> {
        check_record_size(data.len())?;
        let first = self.allocate_block()?;
        self.write_new_record(first, data)
    }

    /// Create a record whose payload depends on its own id.
    pub fn create_with<F>(&mut self, generator: F) -> Result<BlockId, StorageError>
    where
        F: FnOnce(BlockId) -> Vec<u8>,
    {
        let first = self.allocate_block()?;
        let data = generator(first.id());
        self.write_new_record(first, &data)
    }

    /// Reserve a record id with no content.
    pub fn create_empty(&mut self) -> Result<BlockId, StorageError> {
        let block = self.allocate_block()?;
        let id = block.id();
        block.release()?;
        tracing::debug!("created empty record {id}");
        Ok(id)
    }

    /// Replace the payload of an existing record.
    ///
    /// Chain blocks are reused in order; extra blocks are allocated for a
    /// longer payload and surplus trailing blocks go back to the free list.
    pub fn update(&mut self, id: BlockId, data: &[u8]) -> Result<(), StorageError> {
        check_user_record(id)?;
        check_record_size(data.len())?;

        let mut blocks = self.find_blocks(id)?;
        if let Some(head) = blocks.first()
            && head.header(PREVIOUS_BLOCK_ID)? != 0
        {
            return Err(StorageError::NotFound(format!("block {id} is not a record head")));
        }

        let content_size = self.storage.block_content_size();
        let needed = data.len().div_ceil(content_size).max(1);
        while blocks.len() < needed {
            blocks.push(self.allocate_block()?);
        }

        for index in 0..needed {
            let start = index * content_size;
            let count = content_size.min(data.len() - start);
            let target = &blocks[index];

            if index > 0 {
                let previous = &blocks[index - 1];
                previous.set_header(NEXT_BLOCK_ID, u64::from(target.id()))?;
                target.set_header(PREVIOUS_BLOCK_ID, u64::from(previous.id()))?;
            } else {
                target.set_header(RECORD_LENGTH, data.len() as u64)?;
            }

            target.write(data, start, 0, count)?;
            target.set_header(BLOCK_CONTENT_LENGTH, count as u64)?;
            target.set_header(NEXT_BLOCK_ID, 0)?;
        }

        let surplus = blocks.split_off(needed);
        for block in blocks {
            block.release()?;
        }
        let freed = surplus.len();
        for block in surplus {
            let block_id = block.id();
            block.release()?;
            self.mark_as_free(block_id)?;
        }

        tracing::debug!(
            "updated record {id} ({} bytes, {needed} blocks, {freed} freed)",
            data.len()
        );
        Ok(())
    }

    /// Delete a record, returning every chain block to the free list.
    pub fn delete(&mut self, id: BlockId) -> Result<(), StorageError> {
        check_user_record(id)?;

        let head = self
            .storage
            .find(id)?
            .ok_or_else(|| StorageError::NotFound(format!("record {id}")))?;
        if head.header(IS_DELETED)? == 1 || head.header(PREVIOUS_BLOCK_ID)? != 0 {
            return Err(StorageError::NotFound(format!("record {id}")));
        }

        let mut current = head;
        let mut freed = 0usize;
        loop {
            self.mark_as_free(current.id())?;
            current.set_header(IS_DELETED, 1)?;
            freed += 1;

            let next = next_block_id(&current)?;
            current.release()?;
            if next == 0 {
                break;
            }

            current = self.storage.find(next)?.ok_or_else(|| {
                StorageError::Corruption(format!("record {id}: block {next} not found"))
            })?;
        }

        tracing::debug!("deleted record {id} ({freed} blocks freed)");
        Ok(())
    }

    /// Number of block ids currently waiting in the free list.
    pub fn free_block_count(&mut self) -> Result<usize, StorageError> {
        let blocks = self.find_blocks(FREE_LIST_RECORD)?;
        let mut total = 0;
        for block in blocks {
            total += self.content_length(&block)? / FREE_ID_SIZE;
            block.release()?;
        }
        Ok(total)
    }

    fn write_new_record(&mut self, first: Block<S>, data: &[u8]) -> Result<BlockId, StorageError> {
        check_record_size(data.len())?;

        let id = first.id();
        first.set_header(RECORD_LENGTH, data.len() as u64)?;

        let content_size = self.storage.block_content_size();
        let mut current = first;
        let mut written = 0;
        let mut chained = 1usize;

        while written < data.len() {
            let count = content_size.min(data.len() - written);
            current.write(data, written, 0, count)?;
            current.set_header(BLOCK_CONTENT_LENGTH, count as u64)?;
            written += count;

            if written < data.len() {
                let next = self.allocate_block()?;
                next.set_header(PREVIOUS_BLOCK_ID, u64::from(current.id()))?;
                current.set_header(NEXT_BLOCK_ID, u64::from(next.id()))?;
                current.release()?;
                current = next;
                chained += 1;
            }
        }
        current.release()?;

        tracing::debug!("created record {id} ({} bytes, {chained} blocks)", data.len());
        Ok(id)
    }

    /// Collect every block of a chain in order.
    ///
    /// Record 0 is created here on first use.
    fn find_blocks(&mut self, id: BlockId) -> Result<Vec<Block<S>>, StorageError> {
        let limit = self.storage.block_count()?.max(1);
        let mut blocks = Vec::new();
        let mut current_id = id;

        loop {
            let block = match self.storage.find(current_id)? {
                Some(block) => block,
                None if current_id == FREE_LIST_RECORD => {
                    let block = self.storage.create_new()?;
                    if block.id() != FREE_LIST_RECORD {
                        return Err(StorageError::Corruption(format!(
                            "free list record allocated as block {}",
                            block.id()
                        )));
                    }
                    tracing::debug!("initialized free list record");
                    block
                }
                None => {
                    return Err(StorageError::NotFound(format!("block {current_id}")));
                }
            };

            if block.header(IS_DELETED)? == 1 {
                return Err(StorageError::NotFound(format!("block {current_id} is deleted")));
            }

            current_id = next_block_id(&block)?;
            blocks.push(block);

            if current_id == 0 {
                return Ok(blocks);
            }
            if blocks.len() as u64 > limit {
                return Err(StorageError::Corruption(format!(
                    "chain starting at block {id} does not terminate"
                )));
            }
        }
    }

    /// Reuse a block from the free list, or grow the stream by one block.
    fn allocate_block(&mut self) -> Result<Block<S>, StorageError> {
        let Some(id) = self.try_find_free_block()? else {
            return self.storage.create_new();
        };

        let block = self.storage.find(id)?.ok_or_else(|| {
            StorageError::Corruption(format!("free list points at missing block {id}"))
        })?;
        for field in HEADER_FIELDS {
            block.set_header(field, 0)?;
        }
        tracing::trace!("reusing free block {id}");
        Ok(block)
    }

    /// Pop a block id from the tail of the free list.
    fn try_find_free_block(&mut self) -> Result<Option<BlockId>, StorageError> {
        let (last, second_last) = self.space_tracking_blocks()?;
        let length = self.content_length(&last)?;

        if length > 0 {
            let id = read_trailing_id(&last, length)?;
            last.set_header(BLOCK_CONTENT_LENGTH, (length - FREE_ID_SIZE) as u64)?;
            last.release()?;
            if let Some(block) = second_last {
                block.release()?;
            }
            tracing::trace!("popped free block {id}");
            return Ok(Some(id));
        }

        let Some(second_last) = second_last else {
            last.release()?;
            return Ok(None);
        };

        // The tail block is empty: pop from the block before it and put the
        // tail block's own id in the vacated slot.
        let second_length = self.content_length(&second_last)?;
        let id = read_trailing_id(&second_last, second_length)?;
        write_id(&second_last, second_length - FREE_ID_SIZE, last.id())?;
        second_last.set_header(NEXT_BLOCK_ID, 0)?;
        last.set_header(PREVIOUS_BLOCK_ID, 0)?;

        tracing::trace!("popped free block {id}, retired free list block {}", last.id());
        second_last.release()?;
        last.release()?;
        Ok(Some(id))
    }

    /// Append a block id to the tail of the free list.
    fn mark_as_free(&mut self, id: BlockId) -> Result<(), StorageError> {
        let (last, second_last) = self.space_tracking_blocks()?;
        if let Some(block) = second_last {
            block.release()?;
        }

        let length = self.content_length(&last)?;
        if length + FREE_ID_SIZE <= self.storage.block_content_size() {
            write_id(&last, length, id)?;
            last.set_header(BLOCK_CONTENT_LENGTH, (length + FREE_ID_SIZE) as u64)?;
            last.release()?;
        } else {
            let target = self.storage.create_new()?;
            target.set_header(PREVIOUS_BLOCK_ID, u64::from(last.id()))?;
            last.set_header(NEXT_BLOCK_ID, u64::from(target.id()))?;
            write_id(&target, 0, id)?;
            target.set_header(BLOCK_CONTENT_LENGTH, FREE_ID_SIZE as u64)?;
            tracing::trace!("extended free list with block {}", target.id());
            target.release()?;
            last.release()?;
        }

        tracing::trace!("freed block {id}");
        Ok(())
    }

    /// The last two blocks of the free list chain.
    fn space_tracking_blocks(&mut self) -> Result<(Block<S>, Option<Block<S>>), StorageError> {
        let mut blocks = self.find_blocks(FREE_LIST_RECORD)?;
        let last = blocks.pop().ok_or_else(|| {
            StorageError::Corruption("free list record has no blocks".to_string())
        })?;
        let second_last = blocks.pop();
        for block in blocks {
            block.release()?;
        }
        Ok((last, second_last))
    }

    fn content_length(&self, block: &Block<S>) -> Result<usize, StorageError> {
        let length = header_as_usize(block, BLOCK_CONTENT_LENGTH)?;
        if length > self.storage.block_content_size() {
            return Err(StorageError::Corruption(format!(
                "block {} declares content length {length} (max {})",
                block.id(),
                self.storage.block_content_size()
            )));
        }
        Ok(length)
    }
}

impl<S: Stream> std::fmt::Debug for RecordStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStorage")
            .field("storage", &self.storage)
            .finish()
    }
}

fn check_user_record(id: BlockId) -> Result<(), StorageError> {
    if id == FREE_LIST_RECORD {
        return Err(StorageError::InvalidArgument(
            "record 0 is reserved for the free list".to_string(),
        ));
    }
    Ok(())
}

fn check_record_size(len: usize) -> Result<(), StorageError> {
    if len > MAX_RECORD_SIZE {
        return Err(StorageError::InvalidArgument(format!(
            "record of {len} bytes exceeds the {MAX_RECORD_SIZE}-byte limit"
        )));
    }
    Ok(())
}

fn header_as_usize<S: Stream>(block: &Block<S>, field: usize) -> Result<usize, StorageError> {
    let value = block.header(field)?;
    usize::try_from(value).map_err(|_| {
        StorageError::Corruption(format!(
            "block {} header slot {field} holds {value}",
            block.id()
        ))
    })
}

fn next_block_id<S: Stream>(block: &Block<S>) -> Result<BlockId, StorageError> {
    let value = block.header(NEXT_BLOCK_ID)?;
    BlockId::try_from(value).map_err(|_| {
        StorageError::Corruption(format!("block {} links to invalid block {value}", block.id()))
    })
}

fn read_trailing_id<S: Stream>(block: &Block<S>, length: usize) -> Result<BlockId, StorageError> {
    if length == 0 || length % FREE_ID_SIZE != 0 {
        return Err(StorageError::Corruption(format!(
            "free list block {} has misaligned length {length}",
            block.id()
        )));
    }
    let mut bytes = [0u8; FREE_ID_SIZE];
    block.read(&mut bytes, 0, length - FREE_ID_SIZE, FREE_ID_SIZE)?;
    Ok(BlockId::from_le_bytes(bytes))
}

fn write_id<S: Stream>(block: &Block<S>, offset: usize, id: BlockId) -> Result<(), StorageError> {
    if offset % FREE_ID_SIZE != 0 {
        return Err(StorageError::Corruption(format!(
            "free list block {} has misaligned length {offset}",
            block.id()
        )));
    }
    block.write(&id.to_le_bytes(), 0, offset, FREE_ID_SIZE)
}
