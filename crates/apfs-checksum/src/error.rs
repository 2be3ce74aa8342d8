//! Error types for checksum operations

use thiserror::Error;

/// Errors that can occur while computing or verifying an object checksum
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// Object is too small to carry a checksum field
    #[error("Object too short for a checksum: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum object size in bytes
        expected: usize,
        /// Actual object size in bytes
        actual: usize,
    },

    /// Checksummed payload is not made of whole 32-bit words
    #[error("Checksummed length {0} is not a multiple of 4")]
    UnalignedLength(usize),

    /// Stored checksum does not match the object contents
    #[error("Checksum mismatch: stored {stored:016x}, computed {computed:016x}")]
    Mismatch {
        /// Checksum read from the object header
        stored: u64,
        /// Checksum computed over the object payload
        computed: u64,
    },
}
