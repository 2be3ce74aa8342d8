//! Object checksums for APFS on-disk structures
//!
//! Every APFS object starts with a 64-bit Fletcher checksum covering the rest
//! of the object. Readers verify it before trusting any other field, and
//! writers restamp it after each modification.
//!
//! # Examples
//!
//! ```
//! use apfs_checksum::{set_object_checksum, verify_object};
//!
//! let mut block = vec![0u8; 4096];
//! block[8..16].copy_from_slice(&0x402u64.to_le_bytes());
//! set_object_checksum(&mut block).expect("aligned block");
//! assert!(verify_object(&block).is_ok());
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod fletcher;

pub use error::ChecksumError;
pub use fletcher::{
    object_checksum, set_object_checksum, stored_checksum, verify_object, Fletcher64,
    CHECKSUM_SIZE,
};
