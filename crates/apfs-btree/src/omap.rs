//! Object map translator
//!
//! Virtual object ids are resolved through the object map, a B-tree keyed
//! by `(oid, xid)` whose values hold the physical address of each version of
//! an object. A lookup at ceiling `xid` returns the newest version written
//! at or before that transaction.
//!
//! Writers relocate the object first (copy-on-write) and then publish the
//! new address in the map entry. Only single-node maps are rewritten.

use crate::block::{BlockStore, Spaceman, Transaction};
use crate::key::Key;
use crate::node::Node;
use crate::object::{
    self, ObjectHeader, OBJECT_HEADER_SIZE, OBJECT_TYPE_BTREE, OBJECT_TYPE_OMAP, OBJ_PHYSICAL,
};
use crate::query::{Query, QueryFlags};
use crate::volume::Volume;
use crate::{BtreeError, Result};
use binrw::{BinRead, BinWrite};
use std::fmt;
use std::io::Cursor;
use tracing::{debug, error, warn};

/// Size of an object map value
pub const OMAP_VAL_SIZE: usize = 16;

/// How the caller intends to use the object it looks up
#[derive(Clone, Copy)]
pub enum Access<'a> {
    /// Read the object where it is
    Read,
    /// Relocate the object into the transaction and publish its new address
    Write {
        /// Transaction the object joins
        txn: &'a Transaction,
        /// Allocator for the relocated block
        spaceman: &'a dyn Spaceman,
    },
}

impl fmt::Debug for Access<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "Read"),
            Self::Write { txn, .. } => write!(f, "Write(xid {})", txn.xid()),
        }
    }
}

/// Object map value
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct OmapVal {
    /// Value flags
    pub flags: u32,
    /// Object size in bytes
    pub size: u32,
    /// Physical address of the object
    pub paddr: u64,
}

impl OmapVal {
    /// Object was deleted in this transaction
    pub const DELETED: u32 = 0x0000_0001;
    /// Object is retained by a snapshot
    pub const SAVED: u32 = 0x0000_0002;
    /// Object is encrypted
    pub const ENCRYPTED: u32 = 0x0000_0004;
    /// Object is stored without a header
    pub const NOHEADER: u32 = 0x0000_0008;
    /// Object uses the newer crypto generation
    pub const CRYPTO_GENERATION: u32 = 0x0000_0010;

    /// Create a live mapping to `paddr`
    pub const fn new(size: u32, paddr: u64) -> Self {
        Self {
            flags: 0,
            size,
            paddr,
        }
    }

    /// Parse a value stored in an object map leaf
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != OMAP_VAL_SIZE {
            return Err(BtreeError::Corrupted(format!(
                "object map value of {} bytes",
                raw.len()
            )));
        }
        Ok(Self::read(&mut Cursor::new(raw))?)
    }

    /// Encode for storage in an object map leaf
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(OMAP_VAL_SIZE);
        self.write(&mut Cursor::new(&mut out))?;
        Ok(out)
    }

    /// Check if flag is set
    pub const fn has(&self, flag: u32) -> bool {
        (self.flags & flag) != 0
    }

    /// Mapping was deleted
    pub const fn is_deleted(&self) -> bool {
        self.has(Self::DELETED)
    }
}

/// Object map object
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ObjectMapPhys {
    /// Object header
    pub header: ObjectHeader,
    /// Object map flags
    pub flags: u32,
    /// Number of snapshots
    pub snap_count: u32,
    /// Type of the mapping tree
    pub tree_type: u32,
    /// Type of the snapshot tree
    pub snapshot_tree_type: u32,
    /// Physical address of the mapping tree root
    pub tree_oid: u64,
    /// Physical address of the snapshot tree root
    pub snapshot_tree_oid: u64,
    /// Most recent snapshot transaction
    pub most_recent_snap: u64,
    /// Start of an in-progress revert
    pub pending_revert_min: u64,
    /// End of an in-progress revert
    pub pending_revert_max: u64,
}

impl ObjectMapPhys {
    /// Size of the object map object on disk
    pub const SIZE: usize = OBJECT_HEADER_SIZE + 56;

    /// Object map at block `paddr` whose tree root is block `tree_oid`
    pub const fn new(paddr: u64, xid: u64, tree_oid: u64) -> Self {
        Self {
            header: ObjectHeader::new(paddr, xid, OBJECT_TYPE_OMAP, OBJ_PHYSICAL, 0),
            flags: 0,
            snap_count: 0,
            tree_type: OBJ_PHYSICAL | OBJECT_TYPE_BTREE,
            snapshot_tree_type: OBJ_PHYSICAL | OBJECT_TYPE_BTREE,
            tree_oid,
            snapshot_tree_oid: 0,
            most_recent_snap: 0,
            pending_revert_min: 0,
            pending_revert_max: 0,
        }
    }

    /// Parse the object map stored in `block`
    ///
    /// # Errors
    ///
    /// Returns a checksum error when `verify` is set and the checksum is
    /// wrong, or [`BtreeError::Corrupted`] if the object is not an object
    /// map.
    pub fn parse(block: u64, data: &[u8], verify: bool) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(BtreeError::Corrupted(format!(
                "object map block {block:#x} has {} bytes",
                data.len()
            )));
        }
        if verify {
            object::verify_checksum(block, data)?;
        }
        let omap = Self::read(&mut Cursor::new(&data[..Self::SIZE]))?;
        if omap.header.object_type() != OBJECT_TYPE_OMAP {
            return Err(BtreeError::Corrupted(format!(
                "block {block:#x} holds object type {:#x}, not an object map",
                omap.header.object_type()
            )));
        }
        Ok(omap)
    }

    /// Lay the object map out in a block and stamp its checksum
    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>> {
        if block_size < Self::SIZE {
            return Err(BtreeError::InvalidArgument(format!(
                "block size {block_size} cannot hold an object map"
            )));
        }
        let mut data = vec![0u8; block_size];
        self.write(&mut Cursor::new(&mut data[..Self::SIZE]))?;
        object::stamp_checksum(self.header.oid, &mut data)?;
        Ok(data)
    }
}

impl<S: BlockStore> Volume<S> {
    /// Translate virtual object `oid` to a physical block
    ///
    /// Finds the newest mapping of `oid` written at or before transaction
    /// `ceiling` in the object map rooted at `map_root`. With
    /// [`Access::Write`] the lookup runs at the transaction's xid instead of
    /// `ceiling`, the object is relocated into the transaction, and the
    /// newest mapping is rewritten to the transaction's xid and new block.
    /// Rewriting the newest mapping in place keeps the map in key order.
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NotFound`] if no live mapping exists and
    /// [`BtreeError::Corrupted`] for a malformed mapping.
    ///
    /// # Panics
    ///
    /// For [`Access::Write`], panics if the map is not a single root leaf or
    /// was not written by the caller's transaction.
    pub fn omap_lookup_block(
        &self,
        map_root: &Node,
        oid: u64,
        ceiling: u64,
        access: Access<'_>,
    ) -> Result<u64> {
        let ceiling = match access {
            Access::Read => ceiling,
            Access::Write { txn, .. } => txn.xid(),
        };
        let mut query = Query::new(map_root.clone(), Key::omap(oid, ceiling), QueryFlags::OMAP);
        self.btree_query(&mut query)?;

        if query.record_key()?.id != oid {
            return Err(BtreeError::NotFound);
        }

        let leaf = query.node().block_number();
        let raw = query.value()?;
        let value = OmapVal::parse(&raw).inspect_err(|_| {
            error!("bad object map leaf block: {:#x}", leaf);
        })?;
        if value.is_deleted() {
            return Err(BtreeError::NotFound);
        }

        match access {
            Access::Read => Ok(value.paddr),
            Access::Write { txn, spaceman } => {
                let node = query.node();
                assert!(
                    node.is_root() && node.is_leaf(),
                    "object map node {leaf:#x} must be a root leaf to be rewritten"
                );
                assert_eq!(
                    node.xid(),
                    txn.xid(),
                    "object map node {leaf:#x} is not part of transaction {}",
                    txn.xid()
                );

                let new_block = self.cow_object(value.paddr, txn, spaceman)?;
                let loc = query.location().ok_or(BtreeError::NotFound)?;
                let mut edit = node.modify()?;
                edit.write_at(loc.key_off + 8, &txn.xid().to_le_bytes())?;
                edit.write_at(loc.val_off + 8, &new_block.to_le_bytes())?;
                edit.commit(self.store())?;

                debug!(
                    "object {:#x} now maps to block {:#x} at transaction {}",
                    oid,
                    new_block,
                    txn.xid()
                );
                Ok(new_block)
            }
        }
    }

    /// Relocate the object in `block` into the current transaction
    ///
    /// Objects already written by the transaction stay where they are.
    /// Otherwise the contents are copied to a freshly allocated block, the
    /// header is updated and restamped, and the old block is queued for
    /// freeing. Returns the block now holding the object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be read, the allocator is out
    /// of space, or the free queue rejects the old block.
    pub fn cow_object(
        &self,
        block: u64,
        txn: &Transaction,
        spaceman: &dyn Spaceman,
    ) -> Result<u64> {
        let old = self.store().read_block(block)?;
        let contents = old.to_vec();
        drop(old);

        if self.config().verify_checksums {
            object::verify_checksum(block, &contents)?;
        }
        let mut header = ObjectHeader::parse(&contents)?;
        if header.xid == txn.xid() {
            return Ok(block);
        }

        let number = spaceman.allocate_block()?;
        let new = self.store().new_block(number)?;
        {
            let mut data = new.write();
            if data.len() != contents.len() {
                return Err(BtreeError::InvalidArgument(format!(
                    "block {number:#x} has {} bytes, object has {}",
                    data.len(),
                    contents.len()
                )));
            }
            data.copy_from_slice(&contents);
            header.xid = txn.xid();
            if header.is_physical() {
                header.oid = number;
            }
            header.store(&mut data)?;
            object::stamp_checksum(number, &mut data)?;
        }
        self.store().mark_dirty(&new);
        spaceman.free_queue_insert(block)?;

        debug!(
            "relocated object {:#x} from block {:#x} to {:#x}",
            header.oid, block, number
        );
        Ok(number)
    }

    /// Resolve virtual object `oid` at the volume's transaction and read it
    ///
    /// # Errors
    ///
    /// Returns the lookup error, or the error from reading the node.
    pub fn omap_read_node(&self, oid: u64) -> Result<Node> {
        let block = self.omap_lookup_block(self.omap_root(), oid, self.xid(), Access::Read)?;
        let node = self.read_node(block)?;
        if node.oid() != oid {
            warn!(
                "node in block {:#x} claims object id {:#x}, expected {:#x}",
                block,
                node.oid(),
                oid
            );
        }
        Ok(node)
    }
}
