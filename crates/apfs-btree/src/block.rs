//! Block layer and allocator seams
//!
//! The engine never touches a device. It reads blocks through a
//! [`BlockStore`], obtains fresh block numbers from a [`Spaceman`], and
//! learns the current transaction from an explicit [`Transaction`] value.
//!
//! Blocks are handed out as `Arc<Block>`: holding a clone retains the buffer,
//! dropping it releases the buffer. The store must not recycle a block while
//! anyone else still holds a reference to it.

use crate::{BtreeError, Result, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// One fixed-size block and its dirty state
#[derive(Debug)]
pub struct Block {
    number: u64,
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

impl Block {
    /// Wrap a buffer read from (or destined for) block `number`
    pub fn new(number: u64, data: Vec<u8>) -> Self {
        Self {
            number,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    /// Block number on the device
    pub const fn number(&self) -> u64 {
        self.number
    }

    /// Shared access to the block contents
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Exclusive access to the block contents
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// Copy of the block contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Whether the block has unwritten modifications
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Flag the block for write-back
    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

/// Block layer used by the engine
pub trait BlockStore {
    /// Size of every block in bytes
    fn block_size(&self) -> usize;

    /// Read a block, retaining it for the caller
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the block cannot be read.
    fn read_block(&self, number: u64) -> Result<Arc<Block>>;

    /// Obtain a zeroed buffer for a freshly allocated block
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the block cannot be mapped.
    fn new_block(&self, number: u64) -> Result<Arc<Block>>;

    /// Schedule a modified block for write-back
    fn mark_dirty(&self, block: &Block);
}

/// In-memory block store
///
/// Keeps every block resident. Used by tests and by callers that load a
/// small image into memory.
#[derive(Debug)]
pub struct MemoryBlockStore {
    block_size: usize,
    blocks: DashMap<u64, Arc<Block>>,
    reads: AtomicU64,
}

impl MemoryBlockStore {
    /// Create an empty store
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::InvalidArgument`] for block sizes outside
    /// 4 KiB–64 KiB or not a power of two.
    pub fn new(block_size: usize) -> Result<Self> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            return Err(BtreeError::InvalidArgument(format!(
                "unsupported block size {block_size}"
            )));
        }
        Ok(Self {
            block_size,
            blocks: DashMap::new(),
            reads: AtomicU64::new(0),
        })
    }

    /// Store raw contents for block `number`, replacing any previous block
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::InvalidArgument`] if `data` is not exactly one
    /// block long.
    pub fn insert(&self, number: u64, data: Vec<u8>) -> Result<()> {
        if data.len() != self.block_size {
            return Err(BtreeError::InvalidArgument(format!(
                "block {number:#x} has {} bytes, expected {}",
                data.len(),
                self.block_size
            )));
        }
        self.blocks.insert(number, Arc::new(Block::new(number, data)));
        Ok(())
    }

    /// Number of successful `read_block` calls so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Block numbers currently flagged dirty, in ascending order
    pub fn dirty_blocks(&self) -> Vec<u64> {
        let mut dirty: Vec<u64> = self
            .blocks
            .iter()
            .filter(|entry| entry.value().is_dirty())
            .map(|entry| *entry.key())
            .collect();
        dirty.sort_unstable();
        dirty
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, number: u64) -> Result<Arc<Block>> {
        let block = self.blocks.get(&number).map(|entry| Arc::clone(entry.value()));
        match block {
            Some(block) => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                trace!("read block {:#x}", number);
                Ok(block)
            }
            None => Err(BtreeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("block {number:#x} is not mapped"),
            ))),
        }
    }

    fn new_block(&self, number: u64) -> Result<Arc<Block>> {
        let block = Arc::new(Block::new(number, vec![0u8; self.block_size]));
        self.blocks.insert(number, Arc::clone(&block));
        Ok(block)
    }

    fn mark_dirty(&self, block: &Block) {
        block.set_dirty();
    }
}

/// Free-space manager seam
pub trait Spaceman {
    /// Allocate a block for a relocated object
    ///
    /// # Errors
    ///
    /// Returns an error if the container is out of space.
    fn allocate_block(&self) -> Result<u64>;

    /// Queue a block to be freed once its transaction is no longer needed
    ///
    /// # Errors
    ///
    /// Returns an error if the free queue cannot record the block.
    fn free_queue_insert(&self, number: u64) -> Result<()>;
}

/// Allocator handing out consecutive block numbers from a fixed range
#[derive(Debug)]
pub struct SequentialSpaceman {
    next: Mutex<u64>,
    end: u64,
    freed: Mutex<Vec<u64>>,
}

impl SequentialSpaceman {
    /// Allocate from `start..end`
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            next: Mutex::new(start),
            end,
            freed: Mutex::new(Vec::new()),
        }
    }

    /// Blocks queued for freeing, in queue order
    pub fn freed(&self) -> Vec<u64> {
        self.freed.lock().clone()
    }
}

impl Spaceman for SequentialSpaceman {
    fn allocate_block(&self) -> Result<u64> {
        let mut next = self.next.lock();
        if *next >= self.end {
            return Err(BtreeError::NoSpace(*next));
        }
        let number = *next;
        *next += 1;
        debug!("allocated block {:#x}", number);
        Ok(number)
    }

    fn free_queue_insert(&self, number: u64) -> Result<()> {
        self.freed.lock().push(number);
        Ok(())
    }
}

/// Transaction context threaded through every mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    xid: u64,
    next_oid: u64,
}

impl Transaction {
    /// Start a context for transaction `xid`
    pub const fn new(xid: u64, next_oid: u64) -> Self {
        Self { xid, next_oid }
    }

    /// Current transaction id
    pub const fn xid(&self) -> u64 {
        self.xid
    }

    /// Next object id that will be handed out
    pub const fn next_oid(&self) -> u64 {
        self.next_oid
    }

    /// Reserve a new virtual object id
    pub fn allocate_oid(&mut self) -> u64 {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }
}
