//! On-disk B-tree engine for APFS.
//!
//! APFS keeps almost everything in B-trees made of fixed-size, checksummed
//! blocks. Catalog trees address their children by *virtual* object id, and
//! an object map (itself a B-tree keyed by object id and transaction id)
//! translates those ids to physical blocks. This lets a copy-on-write
//! filesystem relocate a node without rewriting its parent.
//!
//! The engine is split into:
//!
//! - **Key codec** ([`key`]): in-memory [`Key`] and its object-map,
//!   free-queue and catalog encodings, plus the ordering comparator
//! - **Node accessor** ([`node`]): layout validation, binary search and
//!   record lookup within one block, and the primitives used to rewrite it
//! - **Object map translator** ([`omap`]): virtual id to physical block,
//!   with copy-on-write publish for writers
//! - **Query engine** ([`query`]): the depth-bounded descent from a root to
//!   the leaf holding a record, with multi-record iteration
//! - **Mutation engine** ([`mutate`]): single-node insert and remove
//!
//! Block I/O and allocation are external collaborators, reached through the
//! [`BlockStore`] and [`Spaceman`] traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use apfs_btree::{BtreeConfig, Key, MemoryBlockStore, Query, QueryFlags, Volume};
//!
//! # fn example(store: MemoryBlockStore, omap_paddr: u64, xid: u64, root_oid: u64)
//! #     -> apfs_btree::Result<()> {
//! let volume = Volume::open(store, omap_paddr, xid, BtreeConfig::default())?;
//! let catalog = volume.omap_read_node(root_oid)?;
//!
//! let mut query = Query::new(catalog, Key::inode(2), QueryFlags::EXACT);
//! volume.btree_query(&mut query)?;
//! let value = query.value()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Block layer and allocator seams
pub mod block;

// Engine configuration
pub mod config;

// Key codec
pub mod key;

// Object header and object types
pub mod object;

// Node accessor
pub mod node;

// Object map translator
pub mod omap;

// Query engine
pub mod query;

// Mutation engine
pub mod mutate;

// Shared engine state
mod volume;

pub use block::{Block, BlockStore, MemoryBlockStore, SequentialSpaceman, Spaceman, Transaction};
pub use config::BtreeConfig;
pub use key::{Key, KeyFormat, NameComparison, RecordType};
pub use node::{Node, NodeBuilder, RecordLoc};
pub use omap::{Access, ObjectMapPhys, OmapVal};
pub use query::{Query, QueryFlags, Record};
pub use volume::Volume;

/// Result type for B-tree operations.
pub type Result<T> = std::result::Result<T, BtreeError>;

/// Errors that can occur during B-tree operations.
#[derive(Debug, Error)]
pub enum BtreeError {
    /// I/O error reported by the block layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk structure violates a layout or ordering invariant.
    #[error("Corrupted b-tree: {0}")]
    Corrupted(String),

    /// Object checksum verification failed.
    #[error("Checksum error in block {block:#x}: {source}")]
    Checksum {
        /// Block holding the object
        block: u64,
        /// Underlying checksum failure
        #[source]
        source: apfs_checksum::ChecksumError,
    },

    /// Binary structure could not be decoded.
    #[error("Binary format error: {0}")]
    Format(#[from] binrw::Error),

    /// No record matches the query.
    #[error("Record not found")]
    NotFound,

    /// The target node has no room for the record.
    #[error("No space left in node {0:#x}")]
    NoSpace(u64),

    /// Caller passed a record that does not fit the tree.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl BtreeError {
    /// Whether the error reports damaged on-disk data.
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupted(_) | Self::Checksum { .. } | Self::Format(_)
        )
    }

    /// Whether the error is a negative lookup result.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Version information for the engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Depth at which a descent is declared corrupt.
///
/// There is no trustworthy height field on disk, so this bounds the walk
/// through a damaged or cyclic tree. Twelve levels map every block of the
/// largest possible container.
pub const MAX_TREE_DEPTH: usize = 12;
