//! Object header shared by every on-disk structure
//!
//! Each block begins with a 32-byte header: checksum, object id, owning
//! transaction id, and the object's type and subtype. The checksum covers
//! everything after its own field.

use crate::{BtreeError, Result};
use binrw::{BinRead, BinWrite};
use std::io::Cursor;

/// Size of the object header in bytes
pub const OBJECT_HEADER_SIZE: usize = 32;

/// Mask selecting the object type from the type field
pub const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;
/// Mask selecting the storage flags from the type field
pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xffff_0000;

/// Storage flag: object is virtual (resolved through an object map)
pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
/// Storage flag: object lives only in memory between checkpoints
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
/// Storage flag: object id is its physical address
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;

/// Object type: root node of a B-tree
pub const OBJECT_TYPE_BTREE: u32 = 0x0000_0002;
/// Object type: non-root node of a B-tree
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0000_0003;
/// Object type (and tree subtype): free-space queue
pub const OBJECT_TYPE_SPACEMAN_FREE_QUEUE: u32 = 0x0000_0009;
/// Object type (and tree subtype): object map
pub const OBJECT_TYPE_OMAP: u32 = 0x0000_000b;
/// Tree subtype: filesystem (catalog) tree
pub const OBJECT_TYPE_FSTREE: u32 = 0x0000_000e;
/// Tree subtype: extent reference tree
pub const OBJECT_TYPE_BLOCKREFTREE: u32 = 0x0000_000f;
/// Tree subtype: snapshot metadata tree
pub const OBJECT_TYPE_SNAPMETATREE: u32 = 0x0000_0010;

/// On-disk object header
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ObjectHeader {
    /// Fletcher-64 checksum of the rest of the object
    pub checksum: u64,
    /// Object id (virtual id, or physical address for physical objects)
    pub oid: u64,
    /// Transaction that last modified the object
    pub xid: u64,
    /// Object type in the low 16 bits, storage flags in the high 16 bits
    pub type_and_flags: u32,
    /// Object subtype (the tree type, for B-tree nodes)
    pub subtype: u32,
}

impl ObjectHeader {
    /// Create a header with a zero checksum
    pub const fn new(oid: u64, xid: u64, object_type: u32, flags: u32, subtype: u32) -> Self {
        Self {
            checksum: 0,
            oid,
            xid,
            type_and_flags: (object_type & OBJECT_TYPE_MASK) | (flags & OBJECT_TYPE_FLAGS_MASK),
            subtype,
        }
    }

    /// Parse the header at the start of an object
    pub fn parse(object: &[u8]) -> Result<Self> {
        if object.len() < OBJECT_HEADER_SIZE {
            return Err(BtreeError::Corrupted(format!(
                "object of {} bytes has no room for a header",
                object.len()
            )));
        }
        Ok(Self::read(&mut Cursor::new(&object[..OBJECT_HEADER_SIZE]))?)
    }

    /// Write the header over the start of an object
    pub fn store(&self, object: &mut [u8]) -> Result<()> {
        if object.len() < OBJECT_HEADER_SIZE {
            return Err(BtreeError::InvalidArgument(format!(
                "object of {} bytes has no room for a header",
                object.len()
            )));
        }
        self.write(&mut Cursor::new(&mut object[..OBJECT_HEADER_SIZE]))?;
        Ok(())
    }

    /// Object type without storage flags
    pub const fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    /// Storage flags without the object type
    pub const fn storage_flags(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_FLAGS_MASK
    }

    /// Whether the object id is a physical address
    pub const fn is_physical(&self) -> bool {
        self.type_and_flags & OBJ_PHYSICAL != 0
    }
}

/// Verify the checksum of an object read from `block`
pub fn verify_checksum(block: u64, object: &[u8]) -> Result<()> {
    apfs_checksum::verify_object(object).map_err(|source| BtreeError::Checksum { block, source })
}

/// Restamp the checksum of an object stored in `block`
pub fn stamp_checksum(block: u64, object: &mut [u8]) -> Result<()> {
    apfs_checksum::set_object_checksum(object)
        .map(|_| ())
        .map_err(|source| BtreeError::Checksum { block, source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = ObjectHeader::new(
            0x404,
            7,
            OBJECT_TYPE_BTREE,
            OBJ_PHYSICAL,
            OBJECT_TYPE_OMAP,
        );
        let mut block = vec![0u8; 4096];
        header.store(&mut block).unwrap();
        stamp_checksum(0x404, &mut block).unwrap();

        let parsed = ObjectHeader::parse(&block).unwrap();
        assert_eq!(parsed.oid, 0x404);
        assert_eq!(parsed.xid, 7);
        assert_eq!(parsed.object_type(), OBJECT_TYPE_BTREE);
        assert!(parsed.is_physical());
        assert_eq!(parsed.subtype, OBJECT_TYPE_OMAP);
        assert_ne!(parsed.checksum, 0);
        verify_checksum(0x404, &block).unwrap();
    }

    #[test]
    fn test_layout_offsets() {
        let mut block = vec![0u8; 64];
        ObjectHeader::new(0x1122, 0x3344, 0x3, OBJ_EPHEMERAL, 0xe)
            .store(&mut block)
            .unwrap();
        assert_eq!(&block[8..10], &[0x22, 0x11]);
        assert_eq!(&block[16..18], &[0x44, 0x33]);
        assert_eq!(&block[24..28], &[0x03, 0x00, 0x00, 0x80]);
        assert_eq!(&block[28..32], &[0x0e, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_set_xid_invalidates_checksum() {
        let mut block = vec![0u8; 4096];
        ObjectHeader::new(9, 1, OBJECT_TYPE_BTREE_NODE, OBJ_VIRTUAL, OBJECT_TYPE_FSTREE)
            .store(&mut block)
            .unwrap();
        stamp_checksum(9, &mut block).unwrap();
        let mut header = ObjectHeader::parse(&block).unwrap();
        header.xid = 2;
        header.store(&mut block).unwrap();
        let err = verify_checksum(9, &block).unwrap_err();
        assert!(err.is_corruption());
        stamp_checksum(9, &mut block).unwrap();
        verify_checksum(9, &block).unwrap();
        assert_eq!(ObjectHeader::parse(&block).unwrap().xid, 2);
    }

    #[test]
    fn test_short_object_is_corrupt() {
        assert!(ObjectHeader::parse(&[0u8; 16]).unwrap_err().is_corruption());
    }
}
