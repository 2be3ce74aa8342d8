//! Key codec
//!
//! Every tree orders its records by an in-memory [`Key`]: an owner id, a
//! record kind, an auxiliary number and an optional name. The meaning of the
//! number depends on the tree:
//!
//! | Tree | `id` | `number` | `name` |
//! |------|------|----------|--------|
//! | Object map | object id | transaction id | - |
//! | Free queue | transaction id | physical address | - |
//! | Catalog extent | owner id | logical offset | - |
//! | Catalog dir entry | parent inode | name hash (high 22 bits of the packed field) | entry name |
//! | Catalog xattr | inode | 0 | attribute name |
//!
//! Keys compare by id, then kind, then number, and finally by name when both
//! keys carry one. Object-map keys therefore sort ascending by transaction
//! id within an object id; a lookup wants the *last* record at or below its
//! ceiling.

use crate::{BtreeError, Result};
use binrw::{BinRead, BinWrite};
use caseless::Caseless;
use std::cmp::Ordering;
use std::io::Cursor;
use unicode_normalization::UnicodeNormalization;

/// Mask selecting the object id from a catalog key header
pub const OBJ_ID_MASK: u64 = 0x0fff_ffff_ffff_ffff;
/// Mask selecting the record kind from a catalog key header
pub const OBJ_TYPE_MASK: u64 = 0xf000_0000_0000_0000;
/// Shift of the record kind within a catalog key header
pub const OBJ_TYPE_SHIFT: u32 = 60;

/// Mask selecting the name length from a dir-entry key
pub const DREC_LEN_MASK: u32 = 0x0000_03ff;
/// Mask selecting the name hash from a dir-entry key
pub const DREC_HASH_MASK: u32 = 0xffff_fc00;
/// Shift of the name hash within a dir-entry key
pub const DREC_HASH_SHIFT: u32 = 10;

/// Size of an object-map or free-queue key
pub const FIXED_KEY_SIZE: usize = 16;
/// Size of a catalog key header
pub const CATALOG_HEADER_SIZE: usize = 8;
/// Size of a file-extent key
pub const FILE_EXTENT_KEY_SIZE: usize = 16;
/// Size of a dir-entry key without its name
pub const DREC_KEY_HEADER_SIZE: usize = 12;
/// Size of an xattr key without its name
pub const XATTR_KEY_HEADER_SIZE: usize = 10;

/// Catalog record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Wildcard, and the kind used by object-map and free-queue keys
    Any = 0,
    /// Snapshot metadata
    SnapMetadata = 1,
    /// Physical extent reference
    Extent = 2,
    /// Inode
    Inode = 3,
    /// Extended attribute
    Xattr = 4,
    /// Hard link sibling
    SiblingLink = 5,
    /// Data stream
    DstreamId = 6,
    /// Per-file encryption state
    CryptoState = 7,
    /// File extent
    FileExtent = 8,
    /// Directory entry
    DirRec = 9,
    /// Directory statistics
    DirStats = 10,
    /// Snapshot name
    SnapName = 11,
    /// Sibling map
    SiblingMap = 12,
    /// Invalid record
    Invalid = 15,
}

impl RecordType {
    /// Map a raw record kind, if it names a known kind
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Any,
            1 => Self::SnapMetadata,
            2 => Self::Extent,
            3 => Self::Inode,
            4 => Self::Xattr,
            5 => Self::SiblingLink,
            6 => Self::DstreamId,
            7 => Self::CryptoState,
            8 => Self::FileExtent,
            9 => Self::DirRec,
            10 => Self::DirStats,
            11 => Self::SnapName,
            12 => Self::SiblingMap,
            15 => Self::Invalid,
            _ => return None,
        })
    }

    /// Raw record kind
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// On-disk key encoding used by a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFormat {
    /// `(oid, xid)` object-map keys
    ObjectMap,
    /// `(xid, paddr)` free-queue keys
    FreeQueue,
    /// Catalog keys with a packed id/kind header
    Catalog,
}

#[derive(BinRead, BinWrite)]
#[brw(little)]
struct OmapKeyRaw {
    oid: u64,
    xid: u64,
}

#[derive(BinRead, BinWrite)]
#[brw(little)]
struct FreeQueueKeyRaw {
    xid: u64,
    paddr: u64,
}

/// In-memory key used for searching and ordering
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Object or owner id (the transaction id for free-queue keys)
    pub id: u64,
    /// Raw record kind, zero outside catalog trees
    pub kind: u8,
    /// Extent offset, name hash or transaction id depending on the tree
    pub number: u64,
    /// Entry or attribute name
    pub name: Option<String>,
}

impl Key {
    /// Key for an object-map lookup of `oid` at or below transaction `xid`
    pub const fn omap(oid: u64, xid: u64) -> Self {
        Self {
            id: oid,
            kind: 0,
            number: xid,
            name: None,
        }
    }

    /// Key for a free-queue entry
    pub const fn free_queue(xid: u64, paddr: u64) -> Self {
        Self {
            id: xid,
            kind: 0,
            number: paddr,
            name: None,
        }
    }

    /// Catalog key with no discriminator
    pub const fn catalog(id: u64, kind: RecordType) -> Self {
        Self {
            id,
            kind: kind.as_u8(),
            number: 0,
            name: None,
        }
    }

    /// Key for an inode record
    pub const fn inode(ino: u64) -> Self {
        Self::catalog(ino, RecordType::Inode)
    }

    /// Key for a file extent record starting at `offset`
    pub const fn file_extent(id: u64, offset: u64) -> Self {
        Self {
            id,
            kind: RecordType::FileExtent.as_u8(),
            number: offset,
            name: None,
        }
    }

    /// Key for a data stream record
    pub const fn dstream_id(id: u64) -> Self {
        Self::catalog(id, RecordType::DstreamId)
    }

    /// Key for a hashed directory entry
    ///
    /// The hash is computed the way the volume computes it, so `case_fold`
    /// must match the volume's case sensitivity.
    pub fn dir_rec(parent: u64, name: &str, case_fold: bool) -> Self {
        Self {
            id: parent,
            kind: RecordType::DirRec.as_u8(),
            number: u64::from(name_hash(name, case_fold)),
            name: Some(name.to_string()),
        }
    }

    /// Key for an extended attribute
    pub fn xattr(ino: u64, name: &str) -> Self {
        Self {
            id: ino,
            kind: RecordType::Xattr.as_u8(),
            number: 0,
            name: Some(name.to_string()),
        }
    }

    /// Known record kind, if any
    pub const fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.kind)
    }

    /// Decode an on-disk key
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::Corrupted`] if the size does not fit the record
    /// kind, a name is not NUL-terminated or not UTF-8, or a stored name
    /// length disagrees with the key size.
    pub fn decode(raw: &[u8], format: KeyFormat) -> Result<Self> {
        match format {
            KeyFormat::ObjectMap => {
                check_exact(raw, FIXED_KEY_SIZE, "object map")?;
                let key = OmapKeyRaw::read(&mut Cursor::new(raw))?;
                Ok(Self::omap(key.oid, key.xid))
            }
            KeyFormat::FreeQueue => {
                check_exact(raw, FIXED_KEY_SIZE, "free queue")?;
                let key = FreeQueueKeyRaw::read(&mut Cursor::new(raw))?;
                Ok(Self::free_queue(key.xid, key.paddr))
            }
            KeyFormat::Catalog => Self::decode_catalog(raw),
        }
    }

    fn decode_catalog(raw: &[u8]) -> Result<Self> {
        if raw.len() < CATALOG_HEADER_SIZE {
            return Err(malformed(format!(
                "catalog key of {} bytes is shorter than its header",
                raw.len()
            )));
        }
        let header = read_u64(raw, 0);
        let id = header & OBJ_ID_MASK;
        #[allow(clippy::cast_possible_truncation)]
        let kind = ((header & OBJ_TYPE_MASK) >> OBJ_TYPE_SHIFT) as u8;

        let mut key = Self {
            id,
            kind,
            number: 0,
            name: None,
        };

        match RecordType::from_u8(kind) {
            Some(RecordType::Inode) => check_exact(raw, CATALOG_HEADER_SIZE, "inode")?,
            Some(RecordType::DstreamId) => check_exact(raw, CATALOG_HEADER_SIZE, "dstream id")?,
            Some(RecordType::FileExtent) => {
                check_exact(raw, FILE_EXTENT_KEY_SIZE, "file extent")?;
                key.number = read_u64(raw, CATALOG_HEADER_SIZE);
            }
            Some(RecordType::DirRec) => {
                if raw.len() < DREC_KEY_HEADER_SIZE + 1 {
                    return Err(malformed(format!(
                        "dir entry key of {} bytes has no name",
                        raw.len()
                    )));
                }
                let packed = read_u32(raw, CATALOG_HEADER_SIZE);
                let name_len = (packed & DREC_LEN_MASK) as usize;
                if name_len != raw.len() - DREC_KEY_HEADER_SIZE {
                    return Err(malformed(format!(
                        "dir entry name length {name_len} disagrees with key size {}",
                        raw.len()
                    )));
                }
                key.number = u64::from(packed & DREC_HASH_MASK);
                key.name = Some(decode_name(&raw[DREC_KEY_HEADER_SIZE..])?);
            }
            Some(RecordType::Xattr) => {
                if raw.len() < XATTR_KEY_HEADER_SIZE + 1 {
                    return Err(malformed(format!(
                        "xattr key of {} bytes has no name",
                        raw.len()
                    )));
                }
                let name_len = usize::from(read_u16(raw, CATALOG_HEADER_SIZE));
                if name_len != raw.len() - XATTR_KEY_HEADER_SIZE {
                    return Err(malformed(format!(
                        "xattr name length {name_len} disagrees with key size {}",
                        raw.len()
                    )));
                }
                key.name = Some(decode_name(&raw[XATTR_KEY_HEADER_SIZE..])?);
            }
            _ => {}
        }

        Ok(key)
    }

    /// Encode the key in a tree's on-disk format
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::InvalidArgument`] if a name is too long for its
    /// length field, contains NUL, or is missing for a named record kind.
    pub fn encode(&self, format: KeyFormat) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(FIXED_KEY_SIZE);
        match format {
            KeyFormat::ObjectMap => {
                OmapKeyRaw {
                    oid: self.id,
                    xid: self.number,
                }
                .write(&mut Cursor::new(&mut out))?;
            }
            KeyFormat::FreeQueue => {
                FreeQueueKeyRaw {
                    xid: self.id,
                    paddr: self.number,
                }
                .write(&mut Cursor::new(&mut out))?;
            }
            KeyFormat::Catalog => self.encode_catalog(&mut out)?,
        }
        Ok(out)
    }

    fn encode_catalog(&self, out: &mut Vec<u8>) -> Result<()> {
        let header = (self.id & OBJ_ID_MASK) | (u64::from(self.kind) << OBJ_TYPE_SHIFT);
        out.extend_from_slice(&header.to_le_bytes());

        match self.record_type() {
            Some(RecordType::FileExtent) => out.extend_from_slice(&self.number.to_le_bytes()),
            Some(RecordType::DirRec) => {
                let name = self.encodable_name()?;
                let name_len = u32::try_from(name.len() + 1)
                    .ok()
                    .filter(|len| *len <= DREC_LEN_MASK)
                    .ok_or_else(|| {
                        BtreeError::InvalidArgument(format!(
                            "dir entry name of {} bytes is too long",
                            name.len()
                        ))
                    })?;
                #[allow(clippy::cast_possible_truncation)]
                let hash = (self.number as u32) & DREC_HASH_MASK;
                out.extend_from_slice(&(hash | name_len).to_le_bytes());
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
            Some(RecordType::Xattr) => {
                let name = self.encodable_name()?;
                let name_len = u16::try_from(name.len() + 1).map_err(|_| {
                    BtreeError::InvalidArgument(format!(
                        "xattr name of {} bytes is too long",
                        name.len()
                    ))
                })?;
                out.extend_from_slice(&name_len.to_le_bytes());
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
            _ => {}
        }
        Ok(())
    }

    fn encodable_name(&self) -> Result<&str> {
        let name = self.name.as_deref().ok_or_else(|| {
            BtreeError::InvalidArgument(format!("record kind {} requires a name", self.kind))
        })?;
        if name.as_bytes().contains(&0) {
            return Err(BtreeError::InvalidArgument(
                "names may not contain NUL".to_string(),
            ));
        }
        Ok(name)
    }
}

/// How entry and attribute names compare on a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NameComparison {
    /// Ignore letter case
    pub case_insensitive: bool,
    /// Compare canonical decompositions instead of raw code points
    pub normalization_insensitive: bool,
}

impl NameComparison {
    /// Byte-wise comparison
    pub const CASE_SENSITIVE: Self = Self {
        case_insensitive: false,
        normalization_insensitive: false,
    };

    /// Compare two names under this mode
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        if !self.case_insensitive && !self.normalization_insensitive {
            return a.as_bytes().cmp(b.as_bytes());
        }
        folded(a, self.case_insensitive, self.normalization_insensitive)
            .cmp(folded(b, self.case_insensitive, self.normalization_insensitive))
    }
}

/// Code points of `name` after optional decomposition and full case folding
fn folded(name: &str, case_fold: bool, decompose: bool) -> Box<dyn Iterator<Item = char> + '_> {
    match (decompose, case_fold) {
        (true, true) => Box::new(name.nfd().default_case_fold()),
        (true, false) => Box::new(name.nfd()),
        (false, true) => Box::new(name.chars().default_case_fold()),
        (false, false) => Box::new(name.chars()),
    }
}

/// Hash of a directory entry name, positioned as stored on disk
///
/// CRC-32C register (seeded with all ones, not inverted at the end) over
/// the UTF-32LE code points of the canonically decomposed and, on
/// case-insensitive volumes, case-folded name. The low 22 bits are shifted
/// above the 10-bit length field.
pub fn name_hash(name: &str, case_fold: bool) -> u32 {
    let crc = folded(name, case_fold, true).fold(0u32, |crc, c| {
        crc32c::crc32c_append(crc, &u32::from(c).to_le_bytes())
    });
    ((!crc) & (DREC_HASH_MASK >> DREC_HASH_SHIFT)) << DREC_HASH_SHIFT
}

/// Order two keys
pub fn compare(a: &Key, b: &Key, names: NameComparison) -> Ordering {
    a.id.cmp(&b.id)
        .then(a.kind.cmp(&b.kind))
        .then(a.number.cmp(&b.number))
        .then_with(|| match (&a.name, &b.name) {
            (Some(a), Some(b)) => names.compare(a, b),
            _ => Ordering::Equal,
        })
}

fn malformed(message: String) -> BtreeError {
    BtreeError::Corrupted(format!("malformed key: {message}"))
}

fn check_exact(raw: &[u8], size: usize, what: &str) -> Result<()> {
    if raw.len() != size {
        return Err(malformed(format!(
            "{what} key has {} bytes, expected {size}",
            raw.len()
        )));
    }
    Ok(())
}

fn decode_name(raw: &[u8]) -> Result<String> {
    let Some((&0, name)) = raw.split_last() else {
        return Err(malformed("name is not NUL-terminated".to_string()));
    };
    String::from_utf8(name.to_vec())
        .map_err(|_| malformed(format!("name {} is not UTF-8", hex::encode(name))))
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u16(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([raw[offset], raw[offset + 1]])
}
