//! Block Reference Bitmap cache
//!
//! The COW bitmap of a group is the active snapshot's copy of that group's
//! block bitmap, masked by the exclude bitmap: a set bit means the block was
//! in use when the snapshot was taken and does not belong to a snapshot or
//! excluded file. It is stored inside the snapshot at the snapshot address
//! equal to the group's bitmap block, so the snapshot image carries a
//! consistent allocation bitmap.
//!
//! The bitmap is synthesized on first reference after take, preferring the
//! journal's committed image of the live bitmap, and never rebuilt within the
//! same epoch. Synthesis is serialized per group; losers re-check the cache.

use cowsnap_concurrency::{Handle, Journal};
use cowsnap_core::limits::COW_BITMAP_CREDITS;
use cowsnap_core::{
    BlockBuf, BlockNr, BlockStore, Error, GroupNumber, InodeNo, MapMode, Result, SnapBlock,
};
use cowsnap_storage::bitmap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Where synthesized COW bitmaps are remembered
pub trait BitmapCacheStrategy: Send + Sync {
    /// Cached physical location of `group`'s COW bitmap
    fn get(&self, group: GroupNumber) -> Option<BlockNr>;

    /// Remember the physical location of `group`'s COW bitmap
    fn put(&self, group: GroupNumber, physical: BlockNr);

    /// Forget every group
    fn reset(&self);

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

/// One slot per group; zero means "not cached"
///
/// Block 0 is the superblock and can never hold a COW bitmap.
#[derive(Debug)]
pub struct CachedBitmaps {
    slots: Vec<AtomicU64>,
}

impl CachedBitmaps {
    /// Cache for `groups` groups
    pub fn new(groups: u32) -> Self {
        Self {
            slots: (0..groups).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl BitmapCacheStrategy for CachedBitmaps {
    fn get(&self, group: GroupNumber) -> Option<BlockNr> {
        match self.slots.get(group as usize)?.load(Ordering::Acquire) {
            0 => None,
            physical => Some(physical),
        }
    }

    fn put(&self, group: GroupNumber, physical: BlockNr) {
        if let Some(slot) = self.slots.get(group as usize) {
            slot.store(physical, Ordering::Release);
        }
    }

    fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
    }

    fn name(&self) -> &'static str {
        "cached"
    }
}

/// Remembers nothing; the snapshot map is consulted every time
#[derive(Debug, Default, Clone, Copy)]
pub struct UncachedBitmaps;

impl BitmapCacheStrategy for UncachedBitmaps {
    fn get(&self, _group: GroupNumber) -> Option<BlockNr> {
        None
    }

    fn put(&self, _group: GroupNumber, _physical: BlockNr) {}

    fn reset(&self) {}

    fn name(&self) -> &'static str {
        "uncached"
    }
}

/// COW bitmap reader and synthesizer
pub struct BitmapCache {
    strategy: Box<dyn BitmapCacheStrategy>,
    build_locks: Vec<Mutex<()>>,
    builds: AtomicU64,
}

impl BitmapCache {
    /// Cache for `groups` groups using `strategy`
    pub fn new(strategy: Box<dyn BitmapCacheStrategy>, groups: u32) -> Self {
        Self {
            strategy,
            build_locks: (0..groups).map(|_| Mutex::new(())).collect(),
            builds: AtomicU64::new(0),
        }
    }

    /// Number of bitmaps synthesized in the current epoch
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Acquire)
    }

    /// Start a new epoch: forget every group
    pub fn reset(&self) {
        self.strategy.reset();
        self.builds.store(0, Ordering::Release);
        debug!(target: "cowsnap::bitmap", strategy = self.strategy.name(), "COW bitmap cache reset");
    }

    /// COW bitmap of `group` for `snapshot`, synthesizing it if needed
    ///
    /// # Errors
    ///
    /// I/O errors reading the live or exclude bitmap propagate. Lack of
    /// credits for a synthesis fails with `InsufficientCredits` before
    /// anything is written.
    pub fn read(
        &self,
        store: &dyn BlockStore,
        journal: &Journal,
        handle: &mut Handle,
        snapshot: InodeNo,
        group: GroupNumber,
    ) -> Result<BlockBuf> {
        if let Some(physical) = self.strategy.get(group) {
            return store.read_block(physical);
        }

        let lock = self
            .build_locks
            .get(group as usize)
            .ok_or_else(|| Error::invalid_argument(format!("no group {}", group)))?;
        let _guard = lock.lock();

        if let Some(physical) = self.strategy.get(group) {
            return store.read_block(physical);
        }

        let geometry = *store.geometry();
        let bitmap_nr = geometry.bitmap_block(group);
        let addr = bitmap_nr as i64;

        // Copied at take or synthesized before a remount
        if let Some(physical) = store.lookup(snapshot, addr)? {
            trace!(target: "cowsnap::bitmap", group, physical, "COW bitmap found in snapshot");
            self.strategy.put(group, physical);
            return store.read_block(physical);
        }

        handle.reserve(COW_BITMAP_CREDITS)?;
        let mut cow_bitmap = match journal.committed_data(bitmap_nr) {
            Some(committed) => (*committed).clone(),
            None => store.read_block(bitmap_nr)?,
        };
        let exclude = store.read_block(geometry.exclude_block(group))?;
        bitmap::mask_excluded(cow_bitmap.as_mut_slice(), exclude.as_slice());

        let outcome = store.map_snapshot_blocks(snapshot, addr, 1, MapMode::Bitmap)?;
        let physical = outcome
            .physical
            .ok_or_else(|| Error::io(format!("no snapshot block for group {} bitmap", group)))?;
        if !outcome.allocated {
            self.strategy.put(group, physical);
            return store.read_block(physical);
        }

        if let Err(e) = store.write_block(physical, cow_bitmap.as_slice()) {
            release_unwritten(store, snapshot, addr, physical);
            return Err(e);
        }
        handle.consume(COW_BITMAP_CREDITS)?;
        handle.record(|s| s.bitmaps += 1);
        self.builds.fetch_add(1, Ordering::AcqRel);
        self.strategy.put(group, physical);
        debug!(
            target: "cowsnap::bitmap",
            snapshot = snapshot.0,
            group,
            physical,
            "synthesized COW bitmap"
        );
        Ok(cow_bitmap)
    }
}

/// Drop a snapshot block that was mapped at `addr` but never written
///
/// A mapping left behind would read as already preserved.
pub(crate) fn release_unwritten(
    store: &dyn BlockStore,
    snapshot: InodeNo,
    addr: SnapBlock,
    physical: BlockNr,
) {
    let released = store
        .clear_mapping(snapshot, addr)
        .and_then(|_| store.free_block(physical))
        .and_then(|()| store.charge_blocks(snapshot, -1));
    match released {
        Ok(()) => debug!(
            target: "cowsnap::bitmap",
            snapshot = snapshot.0,
            addr,
            physical,
            "released unwritten snapshot block"
        ),
        Err(e) => warn!(
            target: "cowsnap::bitmap",
            snapshot = snapshot.0,
            addr,
            physical,
            error = %e,
            "failed to release unwritten snapshot block"
        ),
    }
}
