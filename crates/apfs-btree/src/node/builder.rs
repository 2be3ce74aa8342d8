//! Fresh node layout

use super::{
    fixed_kv_sizes, to_u16, BtreeInfo, KvLoc, KvOff, Nloc, NodeFlags, NodeHeader, BTOFF_INVALID,
    BTREE_DATA_OFFSET, BTREE_INFO_SIZE, KVLOC_SIZE, KVOFF_SIZE,
};
use crate::object::{
    self, ObjectHeader, OBJECT_HEADER_SIZE, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE,
    OBJECT_TYPE_FSTREE, OBJ_VIRTUAL,
};
use crate::{BtreeError, Result, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use binrw::BinWrite;
use std::io::Cursor;

/// Lays out a new node block
///
/// Records are stored in the order they are added, so callers add them in
/// key order. The default is an empty root leaf of a variable-size
/// filesystem tree.
///
/// ```rust,ignore
/// let block = NodeBuilder::new(4096)
///     .with_oid(0x402)
///     .with_xid(1)
///     .with_record(key.encode(KeyFormat::Catalog)?, value)
///     .build()?;
/// store.insert(0x402, block)?;
/// ```
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    block_size: usize,
    oid: u64,
    xid: u64,
    flags: NodeFlags,
    level: u16,
    subtype: u32,
    storage_flags: u32,
    toc_capacity: usize,
    key_size: u32,
    val_size: u32,
    node_count: u64,
    records: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl NodeBuilder {
    /// Start an empty root leaf for blocks of `block_size` bytes
    pub const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            oid: 0,
            xid: 0,
            flags: NodeFlags::new(NodeFlags::ROOT | NodeFlags::LEAF),
            level: 0,
            subtype: OBJECT_TYPE_FSTREE,
            storage_flags: OBJ_VIRTUAL,
            toc_capacity: 0,
            key_size: 0,
            val_size: 0,
            node_count: 1,
            records: Vec::new(),
        }
    }

    /// Set the object id
    #[must_use]
    pub const fn with_oid(mut self, oid: u64) -> Self {
        self.oid = oid;
        self
    }

    /// Set the owning transaction
    #[must_use]
    pub const fn with_xid(mut self, xid: u64) -> Self {
        self.xid = xid;
        self
    }

    /// Set the tree type
    #[must_use]
    pub const fn with_subtype(mut self, subtype: u32) -> Self {
        self.subtype = subtype;
        self
    }

    /// Set the storage flags of the object header
    #[must_use]
    pub const fn with_storage_flags(mut self, flags: u32) -> Self {
        self.storage_flags = flags;
        self
    }

    /// Mark the node as the root of its tree, or not
    #[must_use]
    pub fn with_root(mut self, root: bool) -> Self {
        if root {
            self.flags.set(NodeFlags::ROOT);
        } else {
            self.flags.clear(NodeFlags::ROOT);
        }
        self
    }

    /// Set the level; level zero marks a leaf
    #[must_use]
    pub fn with_level(mut self, level: u16) -> Self {
        self.level = level;
        if level == 0 {
            self.flags.set(NodeFlags::LEAF);
        } else {
            self.flags.clear(NodeFlags::LEAF);
        }
        self
    }

    /// Use fixed-size table of contents entries
    #[must_use]
    pub fn with_fixed_kv_size(mut self, fixed: bool) -> Self {
        if fixed {
            self.flags.set(NodeFlags::FIXED_KV_SIZE);
        } else {
            self.flags.clear(NodeFlags::FIXED_KV_SIZE);
        }
        self
    }

    /// Reserve table of contents room for at least `entries` records
    #[must_use]
    pub const fn with_toc_capacity(mut self, entries: usize) -> Self {
        self.toc_capacity = entries;
        self
    }

    /// Set the fixed key and value sizes recorded in the tree info
    #[must_use]
    pub const fn with_tree_sizes(mut self, key_size: u32, val_size: u32) -> Self {
        self.key_size = key_size;
        self.val_size = val_size;
        self
    }

    /// Set the node count recorded in the tree info
    #[must_use]
    pub const fn with_node_count(mut self, count: u64) -> Self {
        self.node_count = count;
        self
    }

    /// Append a record
    #[must_use]
    pub fn with_record(mut self, key: Vec<u8>, value: Vec<u8>) -> Self {
        self.records.push((key, Some(value)));
        self
    }

    /// Append a ghost record
    #[must_use]
    pub fn with_ghost(mut self, key: Vec<u8>) -> Self {
        self.records.push((key, None));
        self
    }

    /// Lay out the node and stamp its checksum
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NoSpace`] if the records do not fit and
    /// [`BtreeError::InvalidArgument`] for an unsupported block size or a
    /// record whose size disagrees with a fixed-size tree.
    pub fn build(&self) -> Result<Vec<u8>> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(BtreeError::InvalidArgument(format!(
                "unsupported block size {}",
                self.block_size
            )));
        }

        let root = self.flags.is_root();
        let info = BtreeInfo {
            key_size: self.key_size,
            val_size: self.val_size,
            ..BtreeInfo::default()
        };
        let fixed = if self.flags.has_fixed_kv_size() {
            Some(
                fixed_kv_sizes(self.subtype, self.flags.is_leaf(), root.then_some(&info))
                    .ok_or_else(|| {
                        BtreeError::InvalidArgument(
                            "fixed-size node needs tree info or a fixed tree type".to_string(),
                        )
                    })?,
            )
        } else {
            None
        };
        let entry_size = if fixed.is_some() { KVOFF_SIZE } else { KVLOC_SIZE };

        let value_end = self.block_size - if root { BTREE_INFO_SIZE } else { 0 };
        let toc_len = self.toc_capacity.max(self.records.len()) * entry_size;
        let key_start = BTREE_DATA_OFFSET + toc_len;
        if key_start > value_end {
            return Err(BtreeError::NoSpace(self.oid));
        }

        let mut data = vec![0u8; self.block_size];
        let mut free_start = key_start;
        let mut data_start = value_end;
        let mut longest_key = 0;
        let mut longest_val = 0;

        for (index, (key, value)) in self.records.iter().enumerate() {
            let val_len = value.as_ref().map_or(0, Vec::len);
            if let Some((key_size, val_size)) = fixed {
                if key.len() != key_size || (value.is_some() && val_len != val_size) {
                    return Err(BtreeError::InvalidArgument(format!(
                        "record {index} is {}/{val_len} bytes in a {key_size}/{val_size} tree",
                        key.len()
                    )));
                }
            }
            if free_start + key.len() + val_len > data_start {
                return Err(BtreeError::NoSpace(self.oid));
            }

            let key_rel = to_u16(free_start - key_start, "key offset")?;
            data[free_start..free_start + key.len()].copy_from_slice(key);
            free_start += key.len();

            let val_rel = match value {
                Some(value) => {
                    data_start -= value.len();
                    data[data_start..data_start + value.len()].copy_from_slice(value);
                    to_u16(value_end - data_start, "value offset")?
                }
                None => BTOFF_INVALID,
            };

            let entry = BTREE_DATA_OFFSET + index * entry_size;
            let mut cursor = Cursor::new(&mut data[entry..entry + entry_size]);
            if fixed.is_some() {
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

            longest_key = longest_key.max(key.len());
            longest_val = longest_val.max(val_len);
        }

        let header = NodeHeader {
            flags: self.flags.value,
            level: self.level,
            nkeys: u32::try_from(self.records.len())
                .map_err(|_| BtreeError::InvalidArgument("too many records".to_string()))?,
            table_space: Nloc {
                off: 0,
                len: to_u16(toc_len, "table of contents")?,
            },
            free_space: Nloc {
                off: to_u16(free_start - key_start, "free space offset")?,
                len: to_u16(data_start - free_start, "free space")?,
            },
            key_free_list: Nloc {
                off: BTOFF_INVALID,
                len: 0,
            },
            val_free_list: Nloc {
                off: BTOFF_INVALID,
                len: 0,
            },
        };
        header.write(&mut Cursor::new(
            &mut data[OBJECT_HEADER_SIZE..BTREE_DATA_OFFSET],
        ))?;

        if root {
            let info = BtreeInfo {
                node_size: u32::try_from(self.block_size).unwrap_or(u32::MAX),
                longest_key: u32::try_from(longest_key).unwrap_or(u32::MAX),
                longest_val: u32::try_from(longest_val).unwrap_or(u32::MAX),
                key_count: self.records.len() as u64,
                node_count: self.node_count,
                ..info
            };
            info.write(&mut Cursor::new(&mut data[value_end..]))?;
        }

        let object_type = if root {
            OBJECT_TYPE_BTREE
        } else {
            OBJECT_TYPE_BTREE_NODE
        };
        ObjectHeader::new(self.oid, self.xid, object_type, self.storage_flags, self.subtype)
            .store(&mut data)?;
        object::stamp_checksum(self.oid, &mut data)?;
        Ok(data)
    }
}
