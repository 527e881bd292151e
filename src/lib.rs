//! cowsnap - block-level copy-on-write snapshots for journaling filesystems
//!
//! A snapshot is a special file whose logical block `b` holds the contents
//! filesystem block `b` had when the snapshot was taken. Only blocks that
//! change afterwards are stored: they are copied (metadata) or moved (data)
//! into the active snapshot right before they are first modified.
//!
//! # Quick Start
//!
//! ```
//! use cowsnap::{FormatOptions, InodeNo, Volume, VolumeConfig};
//!
//! let volume = Volume::in_memory(FormatOptions::new(1024, 100), VolumeConfig::default())?;
//! let file = volume.create_file(InodeNo(12), false)?;
//!
//! let mut handle = volume.start(1)?;
//! let block = volume.write_file_block(&mut handle, &file, 0, &[1u8; 1024])?;
//! volume.stop(handle)?;
//!
//! volume.create_file(InodeNo(20), false)?;
//! {
//!     let mut snapshots = volume.lock_snapshots();
//!     snapshots.create(InodeNo(20))?;
//!     snapshots.take(InodeNo(20))?;
//!     snapshots.enable(InodeNo(20))?;
//! }
//!
//! let mut handle = volume.start(1)?;
//! volume.write_file_block(&mut handle, &file, 0, &[2u8; 1024])?;
//! volume.stop(handle)?;
//!
//! let image = volume.open_snapshot(InodeNo(20))?;
//! assert_eq!(image.read_block(block)?.as_slice(), &[1u8; 1024][..]);
//! # Ok::<(), cowsnap::Error>(())
//! ```
//!
//! # Architecture
//!
//! - `cowsnap-core`: addresses, geometry, flags, errors, credit limits and
//!   the [`BlockStore`] interface
//! - `cowsnap-storage`: bitmap helpers, record framing, [`MemBlockStore`]
//! - `cowsnap-concurrency`: [`Journal`] and transaction [`Handle`]s
//! - `cowsnap-engine`: [`Volume`], the COW engine and the snapshot lifecycle

pub use cowsnap_concurrency::{CowStats, FreezeGuard, Handle, Journal};
pub use cowsnap_core::{
    limits, BlockBuf, BlockNr, BlockStore, Error, ErrorCode, FileInfo, Geometry, InodeNo, MapMode,
    MapOutcome, Owner, Result, SnapBlock, SnapshotFlags, SnapshotId, SnapshotRecord, Superblock,
};
pub use cowsnap_engine::{
    ActiveSnapshot, BitmapCacheMode, CowCacheMode, FormatOptions, RemoveOutcome, SnapshotBlocks,
    SnapshotControl, SnapshotInfo, SnapshotListMode, SnapshotReader, Volume, VolumeConfig,
};
pub use cowsnap_storage::MemBlockStore;
