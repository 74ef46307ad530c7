//! Checksum and framing utilities for ObjectIO
//!
//! Persisted hit sets are wrapped in a small self-describing frame:
//!
//! ```text
//! magic:u32 | version:u16 | len:u32 | payload[len] | crc32c:u32
//! ```
//!
//! The CRC covers everything before it.

use crate::error::{Error, Result};

const FRAME_HEADER_SIZE: usize = 4 + 2 + 4;
const FRAME_TRAILER_SIZE: usize = 4;

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// 32-bit placement hash of an object name within a namespace
#[must_use]
pub fn object_hash(namespace: &str, name: &str) -> u32 {
    let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
    hasher.update(namespace.as_bytes());
    hasher.update(&[0]);
    hasher.update(name.as_bytes());
    let h = hasher.digest();
    // Fold both halves so the low bits used for pg selection see the whole hash
    ((h >> 32) ^ h) as u32
}

/// Wrap a payload in a checksummed frame
#[must_use]
pub fn seal_frame(magic: u32, version: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    let crc = compute_crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Validate a frame and return its version and payload
pub fn open_frame(magic: u32, data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE {
        return Err(Error::Deserialization("frame too small".into()));
    }

    let stored_magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if stored_magic != magic {
        return Err(Error::Deserialization(format!(
            "bad frame magic: {stored_magic:#010x}"
        )));
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;

    let total = FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE;
    if data.len() != total {
        return Err(Error::Deserialization(format!(
            "frame length mismatch: header says {total}, have {}",
            data.len()
        )));
    }

    let body_end = FRAME_HEADER_SIZE + len;
    let t = &data[body_end..];
    let stored_crc = u32::from_le_bytes([t[0], t[1], t[2], t[3]]);
    let actual_crc = compute_crc32c(&data[..body_end]);
    if stored_crc != actual_crc {
        return Err(Error::ChecksumMismatch {
            expected: format!("{stored_crc:08x}"),
            actual: format!("{actual_crc:08x}"),
        });
    }

    Ok((version, &data[FRAME_HEADER_SIZE..body_end]))
}
