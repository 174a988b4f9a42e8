//! Low-level encoding and checksum utilities shared by every on-disk format.

pub mod coding;
pub mod crc;
