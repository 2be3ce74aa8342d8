//! Fletcher-64 checksum used by every APFS object header
//!
//! The payload is consumed as little-endian 32-bit words. Both running sums
//! are reduced modulo `2^32 - 1`, and the final pair is folded so that the
//! checksum of a valid object can be recomputed from bytes 8 onward and
//! compared against the value stored in the first 8 bytes.

use crate::error::ChecksumError;
use std::fmt;

/// Size of the checksum field at the start of every object
pub const CHECKSUM_SIZE: usize = 8;

const MODULUS: u64 = 0xffff_ffff;

/// Fletcher-64 checksum value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fletcher64 {
    /// Packed checksum as stored on disk (`high << 32 | low`)
    pub value: u64,
}

impl Fletcher64 {
    /// Compute the checksum of a word-aligned payload
    ///
    /// # Errors
    ///
    /// Returns [`ChecksumError::UnalignedLength`] if `data` is not a whole
    /// number of 32-bit words.
    pub fn checksum(data: &[u8]) -> Result<Self, ChecksumError> {
        if data.len() % 4 != 0 {
            return Err(ChecksumError::UnalignedLength(data.len()));
        }

        let mut sum1 = 0u64;
        let mut sum2 = 0u64;
        for word in data.chunks_exact(4) {
            let word = u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
            sum1 = (sum1 + word) % MODULUS;
            sum2 = (sum2 + sum1) % MODULUS;
        }

        let low = MODULUS - ((sum1 + sum2) % MODULUS);
        let high = MODULUS - ((sum1 + low) % MODULUS);

        Ok(Self {
            value: (high << 32) | low,
        })
    }

    /// Create from a raw stored value
    pub const fn from_value(value: u64) -> Self {
        Self { value }
    }

    /// Little-endian on-disk representation
    pub const fn to_le_bytes(self) -> [u8; CHECKSUM_SIZE] {
        self.value.to_le_bytes()
    }
}

impl fmt::Display for Fletcher64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.value)
    }
}

fn check_object_len(object: &[u8]) -> Result<(), ChecksumError> {
    if object.len() <= CHECKSUM_SIZE {
        return Err(ChecksumError::TooShort {
            expected: CHECKSUM_SIZE + 4,
            actual: object.len(),
        });
    }
    Ok(())
}

/// Compute the checksum an object should carry in its header
///
/// # Errors
///
/// Returns an error if the object is too short or not word aligned.
pub fn object_checksum(object: &[u8]) -> Result<Fletcher64, ChecksumError> {
    check_object_len(object)?;
    Fletcher64::checksum(&object[CHECKSUM_SIZE..])
}

/// Read the checksum stored in an object header
///
/// # Errors
///
/// Returns an error if the object is too short to hold a checksum.
pub fn stored_checksum(object: &[u8]) -> Result<Fletcher64, ChecksumError> {
    check_object_len(object)?;
    let mut raw = [0u8; CHECKSUM_SIZE];
    raw.copy_from_slice(&object[..CHECKSUM_SIZE]);
    Ok(Fletcher64::from_value(u64::from_le_bytes(raw)))
}

/// Verify the stored checksum of an object against its contents
///
/// # Errors
///
/// Returns [`ChecksumError::Mismatch`] when the checksums differ, or a
/// length error for malformed input.
pub fn verify_object(object: &[u8]) -> Result<(), ChecksumError> {
    let stored = stored_checksum(object)?;
    let computed = object_checksum(object)?;
    if stored != computed {
        return Err(ChecksumError::Mismatch {
            stored: stored.value,
            computed: computed.value,
        });
    }
    Ok(())
}

/// Recompute an object's checksum and store it in the header
///
/// # Errors
///
/// Returns an error if the object is too short or not word aligned.
pub fn set_object_checksum(object: &mut [u8]) -> Result<Fletcher64, ChecksumError> {
    let checksum = object_checksum(object)?;
    object[..CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());
    Ok(checksum)
}
