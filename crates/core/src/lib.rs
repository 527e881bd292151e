//! Core types and traits for cowsnap
//!
//! This crate defines the foundational types shared by every layer:
//! - Address types: BlockNr (physical), SnapBlock (snapshot logical), GroupNumber
//! - Geometry: block size, group layout, per-group metadata block locations
//! - SnapshotId / InodeNo: snapshot identity
//! - SnapshotFlags: LIST/ACTIVE/ENABLED/DELETED/INUSE/OPEN status bits
//! - Error: Error type hierarchy with errno-style codes
//! - Limits: journal credit budgets and snapshot layout constants
//! - Traits: the BlockStore collaborator interface
//! - Records: persisted superblock and snapshot records

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flags;
pub mod limits;
pub mod record;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use flags::SnapshotFlags;
pub use record::{SnapshotRecord, Superblock};
pub use traits::{BlockStore, FileInfo};
pub use types::{
    BlockBuf, BlockNr, GroupNumber, Geometry, InodeNo, MapMode, MapOutcome, Owner, SnapBlock,
    SnapshotId, Tid,
};
