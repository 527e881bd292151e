//! Checksummed record framing
//!
//! Superblocks and snapshot records are bincode payloads stored at the start
//! of a block behind a fixed header. The rest of the block is zero padding.
//!
//! # Binary Format
//!
//! ```text
//! magic("CSNP", 4) + version(2) + kind(1) + reserved(1)
//! + payload_len(4) + crc32(payload, 4) = 16 byte header, then payload
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cowsnap_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Cursor, Read};

/// Magic bytes of a framed record
pub const RECORD_MAGIC: &[u8; 4] = b"CSNP";

/// Current record format version
pub const RECORD_FORMAT_VERSION: u16 = 1;

/// Size of the record header
pub const RECORD_HEADER_SIZE: usize = 16;

/// Type of a framed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Filesystem superblock
    Superblock = 1,
    /// Per-snapshot record
    Snapshot = 2,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::Superblock),
            2 => Some(RecordKind::Snapshot),
            _ => None,
        }
    }
}

/// Encode `value` into a zero-padded block of `block_size` bytes
///
/// # Errors
///
/// `SerializationError` if the value cannot be encoded or does not fit.
pub fn encode_record<T: Serialize>(kind: RecordKind, value: &T, block_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    if RECORD_HEADER_SIZE + payload.len() > block_size {
        return Err(Error::SerializationError(format!(
            "{:?} record of {} bytes does not fit in a {} byte block",
            kind,
            payload.len(),
            block_size
        )));
    }

    let mut buf = Vec::with_capacity(block_size);
    buf.extend_from_slice(RECORD_MAGIC);
    buf.write_u16::<LittleEndian>(RECORD_FORMAT_VERSION)?;
    buf.write_u8(kind as u8)?;
    buf.write_u8(0)?;
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    buf.extend_from_slice(&payload);
    buf.resize(block_size, 0);
    Ok(buf)
}

/// Decode a record of the expected `kind` from a block
///
/// # Errors
///
/// `Corruption` on bad magic, version, kind, length or checksum;
/// `SerializationError` if the payload does not decode.
pub fn decode_record<T: DeserializeOwned>(kind: RecordKind, block: &[u8]) -> Result<T> {
    if block.len() < RECORD_HEADER_SIZE {
        return Err(Error::Corruption(format!(
            "record block too short: {} bytes",
            block.len()
        )));
    }
    if &block[0..4] != RECORD_MAGIC {
        return Err(Error::Corruption(format!("bad {:?} record magic", kind)));
    }

    let mut cursor = Cursor::new(&block[4..RECORD_HEADER_SIZE]);
    let version = cursor.read_u16::<LittleEndian>()?;
    if version != RECORD_FORMAT_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported record version {}",
            version
        )));
    }
    let stored_kind = cursor.read_u8()?;
    if RecordKind::from_u8(stored_kind) != Some(kind) {
        return Err(Error::Corruption(format!(
            "expected {:?} record, found kind {}",
            kind, stored_kind
        )));
    }
    let _reserved = cursor.read_u8()?;
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let stored_crc = cursor.read_u32::<LittleEndian>()?;

    if RECORD_HEADER_SIZE + len > block.len() {
        return Err(Error::Corruption(format!(
            "record length {} exceeds block",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    Cursor::new(&block[RECORD_HEADER_SIZE..]).read_exact(&mut payload)?;

    let computed_crc = crc32fast::hash(&payload);
    if stored_crc != computed_crc {
        return Err(Error::Corruption(format!(
            "{:?} record checksum mismatch: stored {:#x}, computed {:#x}",
            kind, stored_crc, computed_crc
        )));
    }
    Ok(bincode::deserialize(&payload)?)
}
