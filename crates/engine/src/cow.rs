//! COW decision engine
//!
//! Every modification of a live block is preceded by [`CowEngine::test_and_cow`]
//! and every release of a live block by [`CowEngine::test_and_move`]. Both run
//! inline on the writer's thread with the writer's handle.
//!
//! A block needs protecting when its bit is set in the active snapshot's COW
//! bitmap and the snapshot does not map it yet. Protection is either a copy
//! into a newly allocated snapshot block (backup) or a transfer of the
//! physical block itself to the snapshot (move).
//!
//! The caller holds the block's buffer lock across the decision and the
//! following write, so two writers never back up the same block at once.

use crate::bitmap::{release_unwritten, BitmapCache, BitmapCacheStrategy};
use arc_swap::ArcSwapOption;
use cowsnap_concurrency::{FreezeGuard, Handle, Journal, TransactionCowCacheStrategy};
use cowsnap_core::limits::COW_BLOCK_CREDITS;
use cowsnap_core::{
    BlockBuf, BlockNr, BlockStore, Error, GroupNumber, InodeNo, MapMode, Owner, Result,
    SnapshotId,
};
use cowsnap_storage::bitmap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// The snapshot currently protecting live blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSnapshot {
    /// Snapshot file
    pub ino: InodeNo,
    /// Generation id
    pub id: SnapshotId,
}

/// Decides and performs backups and moves for the active snapshot
pub struct CowEngine {
    store: Arc<dyn BlockStore>,
    journal: Arc<Journal>,
    active: ArcSwapOption<ActiveSnapshot>,
    bitmaps: BitmapCache,
    cow_cache: Box<dyn TransactionCowCacheStrategy>,
}

impl CowEngine {
    /// Engine with no active snapshot
    pub fn new(
        store: Arc<dyn BlockStore>,
        journal: Arc<Journal>,
        bitmap_strategy: Box<dyn BitmapCacheStrategy>,
        cow_cache: Box<dyn TransactionCowCacheStrategy>,
    ) -> Self {
        let groups = store.geometry().group_count();
        debug!(
            target: "cowsnap::cow",
            bitmap_cache = bitmap_strategy.name(),
            cow_cache = cow_cache.name(),
            groups,
            "COW engine ready"
        );
        CowEngine {
            store,
            journal,
            active: ArcSwapOption::empty(),
            bitmaps: BitmapCache::new(bitmap_strategy, groups),
            cow_cache,
        }
    }

    /// The active snapshot, if any
    pub fn active(&self) -> Option<ActiveSnapshot> {
        self.active.load().as_deref().copied()
    }

    /// Replace the active snapshot
    ///
    /// Only legal while the journal is frozen, so no handle can observe the
    /// switch halfway. Starts a new COW bitmap epoch.
    pub fn set_active(&self, _frozen: &FreezeGuard<'_>, snapshot: Option<ActiveSnapshot>) {
        let previous = self.active();
        self.active.store(snapshot.map(Arc::new));
        self.bitmaps.reset();
        info!(
            target: "cowsnap::cow",
            previous = ?previous.map(|s| s.ino.0),
            active = ?snapshot.map(|s| s.ino.0),
            "active snapshot changed"
        );
    }

    /// Number of COW bitmaps synthesized since the last switch
    pub fn bitmap_builds(&self) -> u64 {
        self.bitmaps.builds()
    }

    /// COW bitmap of `group` for the active snapshot
    pub fn read_group_bitmap(&self, handle: &mut Handle, group: GroupNumber) -> Result<BlockBuf> {
        let active = self
            .active()
            .ok_or_else(|| Error::invalid_argument("no active snapshot"))?;
        self.bitmaps
            .read(&*self.store, &self.journal, handle, active.ino, group)
    }

    /// Common guards of both entry points
    ///
    /// Returns the active snapshot if the block must be examined further.
    fn precheck(&self, handle: &Handle, owner: Option<&Owner>) -> Result<Option<ActiveSnapshot>> {
        handle.check_active()?;
        let Some(active) = self.active() else {
            return Ok(None);
        };
        if handle.is_cowing() {
            if let Some(owner) = owner.filter(|o| o.ino != active.ino) {
                warn!(
                    target: "cowsnap::cow",
                    ino = owner.ino.0,
                    "file block accessed while COWing"
                );
            }
            return Ok(None);
        }
        if owner.is_some_and(|o| o.ino == active.ino) {
            return Err(Error::permission_denied(format!(
                "snapshot {} is protected from modification",
                active.ino
            )));
        }
        Ok(Some(active))
    }

    /// Back up `block` into the active snapshot if it needs protecting
    ///
    /// # Arguments
    /// * `owner` - File owning the block, `None` for filesystem metadata
    /// * `cached` - Current contents of the block, if the caller has them
    /// * `allow_backup` - False for freshly allocated blocks, which must
    ///   never need a backup
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` if `owner` is the active snapshot
    /// - `InsufficientCredits` if a needed bitmap or backup cannot be paid for
    /// - `IoError` if `allow_backup` is false but the block needs one, or on
    ///   device errors; these also abort the handle
    pub fn test_and_cow(
        &self,
        handle: &mut Handle,
        owner: Option<&Owner>,
        block: BlockNr,
        cached: Option<&[u8]>,
        allow_backup: bool,
    ) -> Result<()> {
        let Some(active) = self.precheck(handle, owner)? else {
            return Ok(());
        };
        self.store.geometry().check_block(block)?;

        if self.cow_cache.contains(handle.tid(), block) {
            handle.record(|s| s.ok_jh += 1);
            return Ok(());
        }

        let result = {
            let mut cowing = handle.enter_cow();
            self.cow_inner(&mut cowing, active, owner, block, cached, allow_backup)
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                handle.abort();
            }
        }
        result
    }

    fn cow_inner(
        &self,
        handle: &mut Handle,
        active: ActiveSnapshot,
        owner: Option<&Owner>,
        block: BlockNr,
        cached: Option<&[u8]>,
        allow_backup: bool,
    ) -> Result<()> {
        let tid = handle.tid();

        if owner.is_some_and(|o| o.excluded) {
            self.store.set_excluded(block, 1)?;
            handle.record(|s| s.excluded += 1);
            self.cow_cache.insert(tid, block);
            return Ok(());
        }

        let geometry = *self.store.geometry();
        let cow_bitmap = self.bitmaps.read(
            &*self.store,
            &self.journal,
            handle,
            active.ino,
            geometry.group_of(block),
        )?;
        if !bitmap::test_bit(cow_bitmap.as_slice(), geometry.offset_in_group(block)) {
            handle.record(|s| s.ok_bitmap += 1);
            self.cow_cache.insert(tid, block);
            return Ok(());
        }

        if self.store.lookup(active.ino, block as i64)?.is_some() {
            handle.record(|s| s.ok_mapped += 1);
            self.cow_cache.insert(tid, block);
            return Ok(());
        }

        if !allow_backup {
            return Err(Error::io(format!(
                "block {} needs a backup but was handed out as new",
                block
            )));
        }

        handle.reserve(COW_BLOCK_CREDITS)?;
        let source = match cached {
            Some(data) if data.len() == geometry.block_size() => BlockBuf::new(data.to_vec()),
            _ => self.store.read_block(block)?,
        };
        let outcome =
            self.store
                .map_snapshot_blocks(active.ino, block as i64, 1, MapMode::Cow)?;
        let physical = outcome
            .physical
            .ok_or_else(|| Error::io(format!("no backup destination for block {}", block)))?;
        if outcome.allocated {
            if let Err(e) = self.store.write_block(physical, source.as_slice()) {
                release_unwritten(&*self.store, active.ino, block as i64, physical);
                return Err(e);
            }
            handle.consume(COW_BLOCK_CREDITS)?;
            handle.record(|s| s.copied += 1);
            trace!(
                target: "cowsnap::cow",
                snapshot = active.ino.0,
                block,
                physical,
                "backed up block"
            );
        } else {
            handle.record(|s| s.ok_mapped += 1);
        }
        self.cow_cache.insert(tid, block);
        Ok(())
    }

    /// Move up to `count` blocks starting at `block` into the active snapshot
    /// instead of freeing them
    ///
    /// The run is clipped to the block's group and stops at the first block
    /// that does not need protecting. With `allow_move` false nothing is
    /// changed and the length of the run that would be moved is returned.
    ///
    /// Returns the number of blocks the snapshot now owns; the caller must
    /// not free them.
    pub fn test_and_move(
        &self,
        handle: &mut Handle,
        owner: Option<&Owner>,
        block: BlockNr,
        count: u32,
        allow_move: bool,
    ) -> Result<u32> {
        let Some(active) = self.precheck(handle, owner)? else {
            return Ok(0);
        };
        self.store.geometry().check_block(block)?;
        if count == 0 {
            return Ok(0);
        }

        let result = {
            let mut cowing = handle.enter_cow();
            self.move_inner(&mut cowing, active, owner, block, count, allow_move)
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                handle.abort();
            }
        }
        result
    }

    fn move_inner(
        &self,
        handle: &mut Handle,
        active: ActiveSnapshot,
        owner: Option<&Owner>,
        block: BlockNr,
        count: u32,
        allow_move: bool,
    ) -> Result<u32> {
        if owner.is_some_and(|o| o.excluded) {
            handle.record(|s| s.excluded += 1);
            return Ok(0);
        }

        let geometry = *self.store.geometry();
        let group = geometry.group_of(block);
        let group_end = geometry.group_first_block(group) + geometry.group_len(group) as u64;
        let count = count.min((group_end - block) as u32);

        let cow_bitmap =
            self.bitmaps
                .read(&*self.store, &self.journal, handle, active.ino, group)?;

        let mut run = 0u32;
        let mut mapped = false;
        while run < count {
            let b = block + run as u64;
            if !bitmap::test_bit(cow_bitmap.as_slice(), geometry.offset_in_group(b)) {
                break;
            }
            if self.store.lookup(active.ino, b as i64)?.is_some() {
                mapped = true;
                break;
            }
            run += 1;
        }
        if run == 0 {
            if mapped {
                handle.record(|s| s.ok_mapped += 1);
            } else {
                handle.record(|s| s.ok_bitmap += 1);
            }
            return Ok(0);
        }
        if !allow_move {
            return Ok(run);
        }

        handle.reserve(COW_BLOCK_CREDITS)?;
        let outcome =
            self.store
                .map_snapshot_blocks(active.ino, block as i64, run, MapMode::Move)?;
        handle.consume(COW_BLOCK_CREDITS)?;
        let moved = outcome.count;
        handle.record(|s| s.moved += moved as u64);
        trace!(
            target: "cowsnap::cow",
            snapshot = active.ino.0,
            block,
            moved,
            "moved blocks to snapshot"
        );
        Ok(moved)
    }
}
