//! Node accessor
//!
//! A node is one block laid out as:
//!
//! ```text
//! +----------------+-------------+------------------+----------+-------------------+-----------+
//! | object header  | node header | table of content | keys ->  |  free   <- values | tree info |
//! | (32 bytes)     | (24 bytes)  | (kvloc / kvoff)  |          |                   | (root)    |
//! +----------------+-------------+------------------+----------+-------------------+-----------+
//! ```
//!
//! Keys grow forward from the end of the table of contents, values grow
//! backward from the end of the block (or from the tree info, on the root).
//! Key offsets in the table of contents are relative to the start of the key
//! area and value offsets are measured backward from the end of the value
//! area.
//!
//! [`Node`] holds a retained block plus the header fields that never change
//! for the lifetime of the buffer. Record access goes through a [`NodeView`]
//! (shared lock) and rewriting goes through a [`NodeMut`] (exclusive lock),
//! whose [`NodeMut::commit`] restamps the checksum and marks the block dirty
//! before the lock is released.

mod builder;

pub use builder::NodeBuilder;

use crate::block::{Block, BlockStore};
use crate::config::BtreeConfig;
use crate::key::{Key, KeyFormat};
use crate::object::{
    self, ObjectHeader, OBJECT_HEADER_SIZE, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE,
    OBJECT_TYPE_OMAP, OBJECT_TYPE_SPACEMAN_FREE_QUEUE,
};
use crate::{BtreeError, Result};
use binrw::{BinRead, BinWrite};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::cmp::Ordering;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Size of the node header that follows the object header
pub const NODE_HEADER_SIZE: usize = 24;
/// Offset of the table of contents area
pub const BTREE_DATA_OFFSET: usize = OBJECT_HEADER_SIZE + NODE_HEADER_SIZE;
/// Size of the tree info stored at the end of a root node
pub const BTREE_INFO_SIZE: usize = 40;
/// Table of contents entry size in variable-size nodes
pub const KVLOC_SIZE: usize = 8;
/// Table of contents entry size in fixed-size nodes
pub const KVOFF_SIZE: usize = 4;
/// Offset marking a ghost value or an empty free list
pub const BTOFF_INVALID: u16 = 0xffff;
/// Size of a child id stored as a non-leaf value
pub const CHILD_ID_SIZE: usize = 8;
/// Number of entries the table of contents grows by when full
pub const TOC_ENTRY_INCREMENT: usize = 8;

const OMAP_KEY_SIZE: usize = 16;
const OMAP_VAL_SIZE: usize = 16;
const FREE_QUEUE_KEY_SIZE: usize = 16;
const FREE_QUEUE_VAL_SIZE: usize = 8;

/// Node flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NodeFlags {
    /// Raw flag value
    pub value: u16,
}

impl NodeFlags {
    /// Root node of its tree
    pub const ROOT: u16 = 0x0001;
    /// Leaf node
    pub const LEAF: u16 = 0x0002;
    /// Keys and values have a size fixed by the tree
    pub const FIXED_KV_SIZE: u16 = 0x0004;
    /// Non-leaf values carry child hashes
    pub const HASHED: u16 = 0x0008;
    /// Node is stored without an object header
    pub const NOHEADER: u16 = 0x0010;
    /// Transient flag, never valid on disk
    pub const CHECK_KOFF_INVAL: u16 = 0x8000;

    /// Create node flags from raw value
    pub const fn new(value: u16) -> Self {
        Self { value }
    }

    /// Check if flag is set
    pub const fn has(&self, flag: u16) -> bool {
        (self.value & flag) != 0
    }

    /// Set flag
    pub fn set(&mut self, flag: u16) {
        self.value |= flag;
    }

    /// Clear flag
    pub fn clear(&mut self, flag: u16) {
        self.value &= !flag;
    }

    /// Root node
    pub const fn is_root(&self) -> bool {
        self.has(Self::ROOT)
    }

    /// Leaf node
    pub const fn is_leaf(&self) -> bool {
        self.has(Self::LEAF)
    }

    /// Fixed-size keys and values
    pub const fn has_fixed_kv_size(&self) -> bool {
        self.has(Self::FIXED_KV_SIZE)
    }
}

/// Offset and length of an area within a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct Nloc {
    /// Offset
    pub off: u16,
    /// Length
    pub len: u16,
}

/// Node header following the object header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NodeHeader {
    /// Node flags
    pub flags: u16,
    /// Distance from the leaves
    pub level: u16,
    /// Number of records
    pub nkeys: u32,
    /// Table of contents, relative to the end of the node header
    pub table_space: Nloc,
    /// Free gap, offset relative to the start of the key area
    pub free_space: Nloc,
    /// Head and total size of freed key space
    pub key_free_list: Nloc,
    /// Head and total size of freed value space
    pub val_free_list: Nloc,
}

/// Tree-wide information stored at the end of the root node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct BtreeInfo {
    /// Tree flags
    pub flags: u32,
    /// Node size in bytes
    pub node_size: u32,
    /// Fixed key size, zero for variable-size trees
    pub key_size: u32,
    /// Fixed value size, zero for variable-size trees
    pub val_size: u32,
    /// Longest key ever stored
    pub longest_key: u32,
    /// Longest value ever stored
    pub longest_val: u32,
    /// Number of records in the tree
    pub key_count: u64,
    /// Number of nodes in the tree
    pub node_count: u64,
}

/// Table of contents entry of a variable-size node
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct KvLoc {
    /// Key location
    pub k: Nloc,
    /// Value location
    pub v: Nloc,
}

/// Table of contents entry of a fixed-size node
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct KvOff {
    /// Key offset
    pub k: u16,
    /// Value offset
    pub v: u16,
}

/// Location of one record within a node
///
/// Offsets are absolute within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLoc {
    /// Position in the table of contents
    pub index: usize,
    /// Start of the key
    pub key_off: usize,
    /// Key length
    pub key_len: usize,
    /// Start of the value (end of the value area for ghosts)
    pub val_off: usize,
    /// Value length, zero for ghosts
    pub val_len: usize,
    /// Record has no value
    pub ghost: bool,
}

/// Key and value sizes of a fixed-size node
pub(crate) fn fixed_kv_sizes(
    subtype: u32,
    leaf: bool,
    info: Option<&BtreeInfo>,
) -> Option<(usize, usize)> {
    let (key_size, val_size) = match subtype {
        OBJECT_TYPE_OMAP => (OMAP_KEY_SIZE, OMAP_VAL_SIZE),
        OBJECT_TYPE_SPACEMAN_FREE_QUEUE => (FREE_QUEUE_KEY_SIZE, FREE_QUEUE_VAL_SIZE),
        _ => {
            let info = info?;
            (info.key_size as usize, info.val_size as usize)
        }
    };
    Some((key_size, if leaf { val_size } else { CHILD_ID_SIZE }))
}

pub(crate) fn to_u16(value: usize, what: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| BtreeError::InvalidArgument(format!("{what} of {value} does not fit a node")))
}

/// Validated positions of the areas of a node
#[derive(Debug, Clone, Copy)]
struct Layout {
    header: NodeHeader,
    info: Option<BtreeInfo>,
    fixed: Option<(usize, usize)>,
    entry_size: usize,
    toc_start: usize,
    key_start: usize,
    free_start: usize,
    data_start: usize,
    value_end: usize,
}

impl Layout {
    fn parse(block: u64, data: &[u8], subtype: u32) -> Result<Self> {
        let corrupt = |what: String| BtreeError::Corrupted(format!("node {block:#x}: {what}"));

        let header_bytes = data
            .get(OBJECT_HEADER_SIZE..BTREE_DATA_OFFSET)
            .ok_or_else(|| corrupt(format!("block of {} bytes is too small", data.len())))?;
        let header = NodeHeader::read(&mut Cursor::new(header_bytes))?;
        let flags = NodeFlags::new(header.flags);

        let (value_end, info) = if flags.is_root() {
            let value_end = data
                .len()
                .checked_sub(BTREE_INFO_SIZE)
                .filter(|end| *end >= BTREE_DATA_OFFSET)
                .ok_or_else(|| corrupt("no room for tree info".to_string()))?;
            let info = BtreeInfo::read(&mut Cursor::new(&data[value_end..]))?;
            (value_end, Some(info))
        } else {
            (data.len(), None)
        };

        let entry_size = if flags.has_fixed_kv_size() {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        };
        let fixed = if flags.has_fixed_kv_size() {
            Some(
                fixed_kv_sizes(subtype, flags.is_leaf(), info.as_ref()).ok_or_else(|| {
                    corrupt(format!("fixed-size node of tree type {subtype:#x} without tree info"))
                })?,
            )
        } else {
            None
        };

        let toc_start = BTREE_DATA_OFFSET + usize::from(header.table_space.off);
        let key_start = toc_start + usize::from(header.table_space.len);
        let free_start = key_start + usize::from(header.free_space.off);
        let data_start = free_start + usize::from(header.free_space.len);
        let toc_end = (header.nkeys as usize)
            .checked_mul(entry_size)
            .and_then(|len| len.checked_add(toc_start))
            .ok_or_else(|| corrupt(format!("{} records overflow", header.nkeys)))?;

        if toc_end > key_start {
            return Err(corrupt(format!(
                "{} records overflow the table of contents",
                header.nkeys
            )));
        }
        if key_start > free_start || free_start > data_start || data_start > value_end {
            return Err(corrupt(format!(
                "areas out of order: keys {key_start}, free {free_start}, values {data_start}, end {value_end}"
            )));
        }

        Ok(Self {
            header,
            info,
            fixed,
            entry_size,
            toc_start,
            key_start,
            free_start,
            data_start,
            value_end,
        })
    }

    const fn records(&self) -> usize {
        self.header.nkeys as usize
    }

    const fn free_space(&self) -> usize {
        self.data_start - self.free_start
    }

    fn locate(&self, block: u64, data: &[u8], index: usize) -> Result<RecordLoc> {
        if index >= self.records() {
            return Err(BtreeError::Corrupted(format!(
                "node {block:#x}: record {index} out of {}",
                self.records()
            )));
        }
        let entry = self.toc_start + index * self.entry_size;
        let mut cursor = Cursor::new(&data[entry..entry + self.entry_size]);

        let (key_rel, key_len, val_rel, val_len) = match self.fixed {
            Some((key_size, val_size)) => {
                let kvoff = KvOff::read(&mut cursor)?;
                (kvoff.k, key_size, kvoff.v, val_size)
            }
            None => {
                let kvloc = KvLoc::read(&mut cursor)?;
                (
                    kvloc.k.off,
                    usize::from(kvloc.k.len),
                    kvloc.v.off,
                    usize::from(kvloc.v.len),
                )
            }
        };

        let key_off = self.key_start + usize::from(key_rel);
        if key_off + key_len > self.free_start {
            return Err(BtreeError::Corrupted(format!(
                "node {block:#x}: key {index} at {key_off}+{key_len} leaves the key area"
            )));
        }

        if val_rel == BTOFF_INVALID {
            return Ok(RecordLoc {
                index,
                key_off,
                key_len,
                val_off: self.value_end,
                val_len: 0,
                ghost: true,
            });
        }

        let val_off = self
            .value_end
            .checked_sub(usize::from(val_rel))
            .filter(|off| *off >= self.data_start && off + val_len <= self.value_end)
            .ok_or_else(|| {
                BtreeError::Corrupted(format!(
                    "node {block:#x}: value {index} at -{val_rel}+{val_len} leaves the value area"
                ))
            })?;

        Ok(RecordLoc {
            index,
            key_off,
            key_len,
            val_off,
            val_len,
            ghost: false,
        })
    }
}

/// A B-tree node retained in memory
#[derive(Debug, Clone)]
pub struct Node {
    block: Arc<Block>,
    oid: u64,
    xid: u64,
    object_type: u32,
    subtype: u32,
    flags: NodeFlags,
    level: u16,
}

impl Node {
    /// Validate a block as a B-tree node
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::Checksum`] if verification is enabled and the
    /// checksum is wrong, or [`BtreeError::Corrupted`] if the object is not a
    /// B-tree node, its root flag disagrees with its type, or any area
    /// offset falls outside the block.
    pub fn open(block: Arc<Block>, config: &BtreeConfig) -> Result<Self> {
        let number = block.number();
        let data = block.read();

        if config.verify_checksums {
            object::verify_checksum(number, &data).inspect_err(|e| {
                error!("bad checksum for node {:#x}: {}", number, e);
            })?;
        }

        let header = ObjectHeader::parse(&data)?;
        let object_type = header.object_type();
        if object_type != OBJECT_TYPE_BTREE && object_type != OBJECT_TYPE_BTREE_NODE {
            return Err(BtreeError::Corrupted(format!(
                "block {number:#x} holds object type {object_type:#x}, not a b-tree node"
            )));
        }

        let layout = Layout::parse(number, &data, header.subtype).inspect_err(|e| {
            error!("bad layout for node {:#x}: {}", number, e);
        })?;
        let flags = NodeFlags::new(layout.header.flags);

        if flags.is_root() != (object_type == OBJECT_TYPE_BTREE) {
            return Err(BtreeError::Corrupted(format!(
                "node {number:#x}: root flag disagrees with object type {object_type:#x}"
            )));
        }
        if flags.is_leaf() != (layout.header.level == 0) {
            warn!(
                "node {:#x}: leaf flag disagrees with level {}",
                number, layout.header.level
            );
        }

        drop(data);
        Ok(Self {
            block,
            oid: header.oid,
            xid: header.xid,
            object_type,
            subtype: header.subtype,
            flags,
            level: layout.header.level,
        })
    }

    /// Block holding the node
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Physical block number
    pub fn block_number(&self) -> u64 {
        self.block.number()
    }

    /// Object id stored in the header
    pub const fn oid(&self) -> u64 {
        self.oid
    }

    /// Transaction that last wrote the node
    pub const fn xid(&self) -> u64 {
        self.xid
    }

    /// Object type (root or non-root node)
    pub const fn object_type(&self) -> u32 {
        self.object_type
    }

    /// Tree type
    pub const fn subtype(&self) -> u32 {
        self.subtype
    }

    /// Node flags
    pub const fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Distance from the leaves
    pub const fn level(&self) -> u16 {
        self.level
    }

    /// Root node of its tree
    pub const fn is_root(&self) -> bool {
        self.flags.is_root()
    }

    /// Leaf node
    pub const fn is_leaf(&self) -> bool {
        self.flags.is_leaf()
    }

    /// Fixed-size keys and values
    pub const fn has_fixed_kv_size(&self) -> bool {
        self.flags.has_fixed_kv_size()
    }

    /// Key encoding implied by the tree type
    pub const fn key_format(&self) -> KeyFormat {
        match self.subtype {
            OBJECT_TYPE_OMAP => KeyFormat::ObjectMap,
            OBJECT_TYPE_SPACEMAN_FREE_QUEUE => KeyFormat::FreeQueue,
            _ => KeyFormat::Catalog,
        }
    }

    /// Number of records currently in the node
    pub fn records(&self) -> Result<usize> {
        Ok(self.view()?.records())
    }

    /// Lock the node for reading
    pub fn view(&self) -> Result<NodeView<'_>> {
        let data = self.block.read();
        let layout = Layout::parse(self.block_number(), &data, self.subtype)?;
        Ok(NodeView {
            node: self,
            data,
            layout,
        })
    }

    /// Lock the node for rewriting
    pub fn modify(&self) -> Result<NodeMut<'_>> {
        let data = self.block.write();
        let layout = Layout::parse(self.block_number(), &data, self.subtype)?;
        Ok(NodeMut {
            node: self,
            data,
            layout,
        })
    }
}

/// Shared access to the records of a node
pub struct NodeView<'a> {
    node: &'a Node,
    data: RwLockReadGuard<'a, Vec<u8>>,
    layout: Layout,
}

impl NodeView<'_> {
    /// Number of records
    pub const fn records(&self) -> usize {
        self.layout.records()
    }

    /// Bytes available between the key and value areas
    pub const fn free_space(&self) -> usize {
        self.layout.free_space()
    }

    /// Tree info, on a root node
    pub const fn tree_info(&self) -> Option<BtreeInfo> {
        self.layout.info
    }

    /// Node header as currently stored
    pub const fn header(&self) -> NodeHeader {
        self.layout.header
    }

    /// Locate record `index`
    pub fn record_at(&self, index: usize) -> Result<RecordLoc> {
        self.layout.locate(self.node.block_number(), &self.data, index)
    }

    /// Raw key of a located record
    pub fn key_bytes(&self, loc: &RecordLoc) -> &[u8] {
        &self.data[loc.key_off..loc.key_off + loc.key_len]
    }

    /// Raw value of a located record
    pub fn value_bytes(&self, loc: &RecordLoc) -> &[u8] {
        &self.data[loc.val_off..loc.val_off + loc.val_len]
    }

    /// Decode the key of record `index`
    pub fn key_at(&self, index: usize, format: KeyFormat) -> Result<Key> {
        let loc = self.record_at(index)?;
        Key::decode(self.key_bytes(&loc), format)
    }

    /// Find the last record in `[0, bound)` that orders at or below the target
    ///
    /// `cmp` orders a candidate key against the target. Returns the index of
    /// the record and how it compared, or `None` if every candidate orders
    /// above the target.
    pub fn search<F>(
        &self,
        bound: usize,
        format: KeyFormat,
        mut cmp: F,
    ) -> Result<Option<(usize, Ordering)>>
    where
        F: FnMut(&Key) -> Ordering,
    {
        let mut low = 0;
        let mut high = bound.min(self.records());
        let mut best = None;

        while low < high {
            let mid = low + (high - low) / 2;
            let ordering = cmp(&self.key_at(mid, format)?);
            trace!(
                "node {:#x}: record {} orders {:?}",
                self.node.block_number(),
                mid,
                ordering
            );
            if ordering == Ordering::Greater {
                high = mid;
            } else {
                best = Some((mid, ordering));
                low = mid + 1;
            }
        }

        Ok(best)
    }
}

/// Exclusive access to the layout of a node
pub struct NodeMut<'a> {
    node: &'a Node,
    data: RwLockWriteGuard<'a, Vec<u8>>,
    layout: Layout,
}

impl NodeMut<'_> {
    /// Number of records
    pub const fn records(&self) -> usize {
        self.layout.records()
    }

    /// Bytes available between the key and value areas
    pub const fn free_space(&self) -> usize {
        self.layout.free_space()
    }

    /// Key and value sizes, on a fixed-size node
    pub const fn fixed_sizes(&self) -> Option<(usize, usize)> {
        self.layout.fixed
    }

    /// Tree info, on a root node
    pub const fn tree_info(&self) -> Option<BtreeInfo> {
        self.layout.info
    }

    /// Node header as currently stored
    pub const fn header(&self) -> NodeHeader {
        self.layout.header
    }

    /// Locate record `index`
    pub fn record_at(&self, index: usize) -> Result<RecordLoc> {
        self.layout.locate(self.node.block_number(), &self.data, index)
    }

    /// Replace the tree info of a root node
    pub fn set_tree_info(&mut self, info: &BtreeInfo) -> Result<()> {
        if self.layout.info.is_none() {
            return Err(BtreeError::InvalidArgument(format!(
                "node {:#x} is not a root",
                self.node.block_number()
            )));
        }
        let at = self.layout.value_end;
        info.write(&mut Cursor::new(&mut self.data[at..]))?;
        self.layout.info = Some(*info);
        Ok(())
    }

    /// Overwrite bytes in place
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let target = self
            .data
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| {
                BtreeError::InvalidArgument(format!(
                    "write of {} bytes at {offset} leaves the block",
                    bytes.len()
                ))
            })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Insert a record at table of contents position `slot`
    ///
    /// The key is appended to the key area and the value is prepended to
    /// the value area. A `None` value stores a ghost record. The table of
    /// contents grows by [`TOC_ENTRY_INCREMENT`] entries when full, moving
    /// the key area forward.
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NoSpace`] if the record does not fit in the
    /// free gap.
    pub fn insert_record(&mut self, slot: usize, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let number = self.node.block_number();
        let records = self.records();
        if slot > records {
            return Err(BtreeError::InvalidArgument(format!(
                "slot {slot} past {records} records"
            )));
        }

        let val_len = value.map_or(0, <[u8]>::len);
        let needed = key.len() + val_len;
        if self.layout.free_start + needed > self.layout.data_start {
            return Err(BtreeError::NoSpace(number));
        }

        let entry_size = self.layout.entry_size;
        let mut header = self.layout.header;

        if self.layout.toc_start + (records + 1) * entry_size > self.layout.key_start {
            let increment = TOC_ENTRY_INCREMENT * entry_size;
            if self.layout.free_start + increment + needed > self.layout.data_start {
                return Err(BtreeError::NoSpace(number));
            }
            let keys = self.layout.key_start..self.layout.free_start;
            self.data.copy_within(keys, self.layout.key_start + increment);
            header.table_space.len = to_u16(
                usize::from(header.table_space.len) + increment,
                "table of contents",
            )?;
            header.free_space.len = to_u16(
                usize::from(header.free_space.len) - increment,
                "free space",
            )?;
            self.layout.key_start += increment;
            self.layout.free_start += increment;
            trace!("node {:#x}: grew table of contents by {} bytes", number, increment);
        }

        let entry = self.layout.toc_start + slot * entry_size;
        let toc_end = self.layout.toc_start + records * entry_size;
        self.data.copy_within(entry..toc_end, entry + entry_size);

        let key_rel = to_u16(self.layout.free_start - self.layout.key_start, "key offset")?;
        let key_at = self.layout.free_start;
        self.data[key_at..key_at + key.len()].copy_from_slice(key);
        header.free_space.off = to_u16(
            usize::from(header.free_space.off) + key.len(),
            "free space offset",
        )?;
        header.free_space.len = to_u16(
            usize::from(header.free_space.len) - key.len(),
            "free space",
        )?;

        let val_rel = match value {
            Some(value) => {
                let val_at = self.layout.data_start - value.len();
                self.data[val_at..val_at + value.len()].copy_from_slice(value);
                header.free_space.len = to_u16(
                    usize::from(header.free_space.len) - value.len(),
                    "free space",
                )?;
                to_u16(self.layout.value_end - val_at, "value offset")?
            }
            None => BTOFF_INVALID,
        };

        let mut cursor = Cursor::new(&mut self.data[entry..entry + entry_size]);
        if self.layout.fixed.is_some() {
            KvOff {
                k: key_rel,
                v: val_rel,
            }
            .write(&mut cursor)?;
        } else {
            KvLoc {
                k: Nloc {
                    off: key_rel,
                    len: to_u16(key.len(), "key length")?,
                },
                v: Nloc {
                    off: val_rel,
                    len: to_u16(val_len, "value length")?,
                },
            }
            .write(&mut cursor)?;
        }

        header.nkeys += 1;
        self.store_header(header)
    }

    /// Remove record `index` from the table of contents
    ///
    /// The key and value bytes stay where they are; their lengths are added
    /// to the free lists. Returns where the record was.
    pub fn remove_record(&mut self, index: usize) -> Result<RecordLoc> {
        let loc = self.record_at(index)?;
        let entry_size = self.layout.entry_size;
        let entry = self.layout.toc_start + index * entry_size;
        let toc_end = self.layout.toc_start + self.records() * entry_size;
        self.data.copy_within(entry + entry_size..toc_end, entry);

        let mut header = self.layout.header;
        header.nkeys -= 1;
        header.key_free_list.len = to_u16(
            usize::from(header.key_free_list.len) + loc.key_len,
            "key free list",
        )?;
        header.val_free_list.len = to_u16(
            usize::from(header.val_free_list.len) + loc.val_len,
            "value free list",
        )?;
        self.store_header(header)?;
        Ok(loc)
    }

    /// Restamp the checksum and mark the block dirty
    pub fn commit<S: BlockStore + ?Sized>(mut self, store: &S) -> Result<()> {
        let number = self.node.block_number();
        object::stamp_checksum(number, &mut self.data)?;
        store.mark_dirty(self.node.block());
        Ok(())
    }

    fn store_header(&mut self, header: NodeHeader) -> Result<()> {
        header.write(&mut Cursor::new(
            &mut self.data[OBJECT_HEADER_SIZE..BTREE_DATA_OFFSET],
        ))?;
        self.layout = Layout::parse(self.node.block_number(), &self.data, self.node.subtype)?;
        Ok(())
    }
}
