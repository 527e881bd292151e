//! Storage layer for cowsnap
//!
//! This crate provides:
//! - bitmap: bit-level helpers over group bitmap blocks
//! - format: checksummed record framing for superblock and snapshot records
//! - memory: MemBlockStore, an in-memory block device with allocator and file maps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitmap;
pub mod format;
pub mod memory;

pub use format::{decode_record, encode_record, RecordKind};
pub use memory::{MemBlockStore, StoreStats};
