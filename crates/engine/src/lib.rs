//! Snapshot engine for cowsnap
//!
//! This crate ties the lower layers together:
//! - Volume: the context object owning the store, journal, COW engine and snapshot list
//! - CowEngine: `test_and_cow` / `test_and_move` decisions and backups
//! - BitmapCache: lazily synthesized per-group COW bitmaps
//! - SnapshotControl: create / take / enable / disable / delete / remove / update
//! - SnapshotReader: read access to an enabled snapshot image
//! - VolumeConfig: strategy selection and runtime options (`cowsnap.toml`)
//!
//! Writers hold a [`cowsnap_concurrency::Handle`] and go through the
//! `Volume` access methods; the COW engine runs inline on their thread.
//! Lifecycle operations run one at a time through [`Volume::lock_snapshots`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitmap;
pub mod config;
pub mod cow;
pub mod lifecycle;
pub mod reader;
pub mod volume;

pub use bitmap::{BitmapCache, BitmapCacheStrategy, CachedBitmaps, UncachedBitmaps};
pub use config::{BitmapCacheMode, CowCacheMode, FormatOptions, SnapshotListMode, VolumeConfig};
pub use cow::{ActiveSnapshot, CowEngine};
pub use lifecycle::{
    ListStrategy, RemoveOutcome, SingleSlotStrategy, SnapshotControl, SnapshotInfo,
    SnapshotListStrategy,
};
pub use reader::{SnapshotBlocks, SnapshotReader};
pub use volume::Volume;
