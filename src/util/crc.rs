//! CRC32C (Castagnoli) checksums with the storage mask.
//!
//! Checksums written to disk are masked so that computing the CRC of a string
//! that itself contains an embedded CRC stays well distributed.

use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282ead8;

/// Computes the CRC32C of `data`.
pub fn value(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// Computes the CRC32C of several byte slices as one contiguous stream.
///
/// Record formats checksum a type byte together with a payload without
/// concatenating them into one buffer first.
pub fn value_of_parts(parts: &[&[u8]]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

/// Masks a raw CRC for storage.
pub fn mask(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Recovers the raw CRC from a stored, masked value.
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}
