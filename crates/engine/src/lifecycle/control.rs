//! Lifecycle transitions
//!
//! [`SnapshotControl`] holds the volume's snapshot lock for as long as it
//! lives, so at most one transition runs at a time. Transitions that swap
//! the active snapshot additionally freeze the journal.

use super::{SnapshotEntry, SnapshotList, SnapshotState};
use crate::cow::ActiveSnapshot;
use crate::volume::Volume;
use chrono::Utc;
use cowsnap_core::limits::{SNAPSHOT_RECORD_BLOCK, SUPERBLOCK_NR};
use cowsnap_core::{
    BlockNr, Error, Geometry, InodeNo, MapMode, Result, SnapshotFlags, SnapshotRecord,
    Superblock,
};
use cowsnap_storage::{bitmap, decode_record, encode_record, RecordKind};
use parking_lot::MutexGuard;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

/// Result of a removal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Unlinked and truncated
    Removed,
    /// Still needed; left on the list
    Deferred,
}

/// Exclusive handle on the snapshot lifecycle
pub struct SnapshotControl<'a> {
    volume: &'a Volume,
    state: MutexGuard<'a, SnapshotState>,
}

/// Free blocks a snapshot may need for its own metadata: two levels of
/// indirect blocks for the whole volume plus a bitmap copy per group
fn reserve_blocks(geometry: &Geometry) -> u64 {
    let addr_per_block_bits = (geometry.block_size() / 4).trailing_zeros();
    let groups = geometry.group_count() as u64;
    2 * (geometry.blocks_count() >> addr_per_block_bits) + 1 + 2 * groups
}

impl<'a> SnapshotControl<'a> {
    pub(crate) fn new(volume: &'a Volume, state: MutexGuard<'a, SnapshotState>) -> Self {
        SnapshotControl { volume, state }
    }

    fn geometry(&self) -> Geometry {
        *self.volume.store().geometry()
    }

    fn check_writable(&self) -> Result<()> {
        if self.volume.config().read_only {
            return Err(Error::permission_denied("volume is mounted read-only"));
        }
        Ok(())
    }

    fn listed(&self, ino: InodeNo) -> Result<usize> {
        self.state
            .list
            .position(ino)
            .ok_or_else(|| Error::invalid_argument(format!("inode {} is not on the snapshot list", ino)))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn read_record(&self, ino: InodeNo) -> Result<Option<SnapshotRecord>> {
        let store = self.volume.store();
        let Some(physical) = store.lookup(ino, SNAPSHOT_RECORD_BLOCK)? else {
            return Ok(None);
        };
        let block = store.read_block(physical)?;
        decode_record(RecordKind::Snapshot, block.as_slice()).map(Some)
    }

    fn write_record_at(&self, ino: InodeNo, record: &SnapshotRecord) -> Result<()> {
        let store = self.volume.store();
        let physical = store
            .lookup(ino, SNAPSHOT_RECORD_BLOCK)?
            .ok_or_else(|| Error::io(format!("snapshot {} has no record block", ino)))?;
        let bytes = encode_record(RecordKind::Snapshot, record, self.geometry().block_size())?;
        store.write_block(physical, &bytes)
    }

    /// Persist the entry at `idx` with its current older neighbour
    fn write_record(&self, idx: usize) -> Result<()> {
        let list = &self.state.list;
        let entry = &list.entries()[idx];
        self.write_record_at(entry.ino, &entry.to_record(list.older_than(idx)))
    }

    /// Persist `sb` through a handle, as any metadata update
    ///
    /// Callers update `self.state.superblock` only once this succeeded.
    fn write_superblock(&self, sb: &Superblock) -> Result<()> {
        let bytes = encode_record(RecordKind::Superblock, sb, self.geometry().block_size())?;
        let mut handle = self.volume.start(1)?;
        let written = self
            .volume
            .write_block(&mut handle, None, SUPERBLOCK_NR, &bytes);
        let stopped = self.volume.stop(handle);
        written.and(stopped)
    }

    /// Persist `sb` while the journal is frozen
    fn write_superblock_frozen(&self, sb: &Superblock) -> Result<()> {
        let bytes = encode_record(RecordKind::Superblock, sb, self.geometry().block_size())?;
        self.volume.store().write_block(SUPERBLOCK_NR, &bytes)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Turn the empty file `ino` into a new snapshot at the head of the list
    ///
    /// # Errors
    ///
    /// - `NotFound` if the file does not exist
    /// - `InvalidArgument` if it is unlinked or the list strategy refuses
    /// - `AlreadyExists` if it carries snapshot state (including a removed,
    ///   deleted snapshot)
    /// - `NotEmpty` if it maps any block
    pub fn create(&mut self, ino: InodeNo) -> Result<()> {
        self.check_writable()?;
        let store = self.volume.store();
        let info = store.file_info(ino)?;
        if !info.linked {
            return Err(Error::invalid_argument(format!("inode {} has no links", ino)));
        }
        if self.state.list.get(ino).is_some() {
            return Err(Error::AlreadyExists(format!("inode {} is already a snapshot", ino)));
        }
        if let Some(record) = self.read_record(ino)? {
            if !record.flags().is_empty() {
                return Err(Error::AlreadyExists(format!(
                    "inode {} is a former snapshot ({:?})",
                    ino,
                    record.flags()
                )));
            }
        }
        if !info.is_empty() {
            return Err(Error::NotEmpty(format!(
                "inode {} maps {} blocks",
                ino, info.mapped_blocks
            )));
        }

        let heads: SmallVec<[(InodeNo, SnapshotFlags); 8]> =
            self.state.list.iter().map(|e| (e.ino, e.flags)).collect();
        let active = self.volume.active_snapshot().map(|a| a.ino);
        self.volume.list_strategy().check_create(&heads, active)?;

        let geometry = self.geometry();
        let id = self.state.superblock.last_snapshot_id.next();
        let preallocated = [
            SNAPSHOT_RECORD_BLOCK,
            SUPERBLOCK_NR as i64,
            geometry.bitmap_block(0) as i64,
        ];
        for addr in preallocated {
            if let Err(e) = store.map_snapshot_blocks(ino, addr, 1, MapMode::Write) {
                if let Err(undo) = store.truncate(ino) {
                    warn!(target: "cowsnap::lifecycle", ino = ino.0, error = %undo, "failed to release snapshot blocks");
                }
                return Err(e);
            }
        }

        let entry = SnapshotEntry {
            ino,
            id,
            flags: SnapshotFlags::LIST,
            size_blocks: geometry.blocks_count(),
            created_at: Utc::now(),
        };
        let next = self.state.list.head().map(|e| e.ino);
        let mut sb = self.state.superblock.clone();
        sb.last_snapshot_id = id;
        sb.has_snapshot = true;
        sb.snapshot_list_head = Some(ino);
        let persisted = self
            .write_record_at(ino, &entry.to_record(next))
            .and_then(|()| self.write_superblock(&sb));
        if let Err(e) = persisted {
            if let Err(undo) = store.truncate(ino) {
                warn!(target: "cowsnap::lifecycle", ino = ino.0, error = %undo, "failed to release snapshot blocks");
            }
            return Err(e);
        }
        self.state.superblock = sb;
        self.state.list.push_head(entry);

        info!(
            target: "cowsnap::lifecycle",
            ino = ino.0,
            id = id.0,
            blocks = geometry.blocks_count(),
            strategy = self.volume.list_strategy().name(),
            "snapshot created"
        );
        Ok(())
    }

    /// Make the newest snapshot the active one
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` unless `ino` is the list head, listed, not active
    ///   and not deleted
    /// - `IoError` if the blocks reserved at create are missing
    /// - `NoSpace` if free space is below the metadata reserve
    pub fn take(&mut self, ino: InodeNo) -> Result<()> {
        self.check_writable()?;
        let head = self
            .state
            .list
            .head()
            .ok_or_else(|| Error::invalid_argument("no snapshot to take"))?;
        if head.ino != ino {
            return Err(Error::invalid_argument(format!(
                "only the newest snapshot ({}) can be taken",
                head.ino
            )));
        }
        if !head.flags.contains(SnapshotFlags::LIST)
            || head.flags.intersects(SnapshotFlags::ACTIVE | SnapshotFlags::DELETED)
        {
            return Err(Error::invalid_argument(format!(
                "snapshot {} cannot be taken in state {:?}",
                head.id, head.flags
            )));
        }
        let id = head.id;

        let store = self.volume.store();
        let geometry = self.geometry();
        let bitmap_nr = geometry.bitmap_block(0);
        let missing = |what: &str| Error::io(format!("snapshot {} has no {} block", ino, what));
        let sb_copy: BlockNr = store
            .lookup(ino, SUPERBLOCK_NR as i64)?
            .ok_or_else(|| missing("superblock"))?;
        let bitmap_copy: BlockNr = store
            .lookup(ino, bitmap_nr as i64)?
            .ok_or_else(|| missing("bitmap"))?;

        if self.volume.config().reserve_check {
            let needed = reserve_blocks(&geometry);
            let free = store.free_blocks_count()?;
            if free < needed {
                return Err(Error::NoSpace(format!(
                    "{} free blocks, snapshot needs {} in reserve",
                    free, needed
                )));
            }
        }

        {
            let frozen = self.volume.journal().freeze();

            let image = encode_record(
                RecordKind::Superblock,
                &self.state.superblock.snapshot_image(),
                geometry.block_size(),
            )?;
            store.write_block(sb_copy, &image)?;

            let mut cow_bitmap = store.read_block(bitmap_nr)?;
            let exclude = store.read_block(geometry.exclude_block(0))?;
            bitmap::mask_excluded(cow_bitmap.as_mut_slice(), exclude.as_slice());
            store.write_block(bitmap_copy, cow_bitmap.as_slice())?;

            let mut sb = self.state.superblock.clone();
            sb.active_snapshot = Some(ino);
            self.write_superblock_frozen(&sb)?;

            self.state.superblock = sb;
            self.volume
                .cow()
                .set_active(&frozen, Some(ActiveSnapshot { ino, id }));
            for e in self.state.list.iter_mut() {
                e.flags.set(SnapshotFlags::ACTIVE, e.ino == ino);
            }
        }

        info!(target: "cowsnap::lifecycle", ino = ino.0, id = id.0, "snapshot taken");
        Ok(())
    }

    /// Make a listed snapshot readable
    pub fn enable(&mut self, ino: InodeNo) -> Result<()> {
        self.check_writable()?;
        let idx = self.listed(ino)?;
        let entry = &self.state.list.entries()[idx];
        if entry.flags.contains(SnapshotFlags::DELETED) {
            return Err(Error::permission_denied(format!(
                "snapshot {} is deleted",
                entry.id
            )));
        }
        self.set_entry_flag(idx, SnapshotFlags::ENABLED, true)?;
        info!(target: "cowsnap::lifecycle", ino = ino.0, "snapshot enabled");
        Ok(())
    }

    /// Hide a listed snapshot
    pub fn disable(&mut self, ino: InodeNo) -> Result<()> {
        self.check_writable()?;
        let idx = self.listed(ino)?;
        let readers = self.volume.reader_count(ino);
        if readers > 0 {
            return Err(Error::permission_denied(format!(
                "snapshot {} is open by {} readers",
                ino, readers
            )));
        }
        self.set_entry_flag(idx, SnapshotFlags::ENABLED, false)?;
        info!(target: "cowsnap::lifecycle", ino = ino.0, "snapshot disabled");
        Ok(())
    }

    /// Mark a disabled snapshot for removal
    pub fn delete(&mut self, ino: InodeNo) -> Result<()> {
        self.check_writable()?;
        let idx = self.listed(ino)?;
        let entry = &self.state.list.entries()[idx];
        if entry.flags.contains(SnapshotFlags::ENABLED) {
            return Err(Error::permission_denied(format!(
                "snapshot {} must be disabled first",
                entry.id
            )));
        }
        self.set_entry_flag(idx, SnapshotFlags::DELETED, true)?;
        info!(target: "cowsnap::lifecycle", ino = ino.0, "snapshot deleted");
        Ok(())
    }

    fn set_entry_flag(&mut self, idx: usize, flag: SnapshotFlags, on: bool) -> Result<()> {
        if let Some(entry) = self.state.list.iter_mut().nth(idx) {
            entry.flags.set(flag, on);
        }
        self.write_record(idx)
    }

    /// Unlink a snapshot and release its blocks
    ///
    /// Deferred while the snapshot is active, enabled, in use by a newer
    /// snapshot, or read through by an older enabled one. A deleted snapshot
    /// keeps a record carrying `DELETED` so its file is never reused.
    pub fn remove(&mut self, ino: InodeNo) -> Result<RemoveOutcome> {
        self.check_writable()?;
        let idx = self.listed(ino)?;
        let list = &self.state.list;
        let entry = &list.entries()[idx];

        let blocking = entry.flags
            & (SnapshotFlags::ACTIVE | SnapshotFlags::ENABLED | SnapshotFlags::INUSE);
        if !blocking.is_empty() {
            debug!(
                target: "cowsnap::lifecycle",
                ino = ino.0,
                id = entry.id.0,
                flags = ?blocking,
                "snapshot removal deferred"
            );
            return Ok(RemoveOutcome::Deferred);
        }
        let taken = list.active_position().is_some_and(|a| idx >= a);
        let read_through = list.entries()[idx + 1..]
            .iter()
            .any(|e| e.flags.contains(SnapshotFlags::ENABLED));
        if taken && read_through {
            debug!(
                target: "cowsnap::lifecycle",
                ino = ino.0,
                id = entry.id.0,
                "snapshot removal deferred, an older enabled snapshot reads through it"
            );
            return Ok(RemoveOutcome::Deferred);
        }

        let entry = self.state.list.remove(idx);
        if idx > 0 {
            self.write_record(idx - 1)?;
        } else {
            let mut sb = self.state.superblock.clone();
            sb.snapshot_list_head = self.state.list.head().map(|e| e.ino);
            self.write_superblock(&sb)?;
            self.state.superblock = sb;
        }

        let store = self.volume.store();
        let freed = store.truncate(ino)?;
        let retained = entry.flags.persistent() - (SnapshotFlags::LIST | SnapshotFlags::ENABLED);
        if !retained.is_empty() {
            store.map_snapshot_blocks(ino, SNAPSHOT_RECORD_BLOCK, 1, MapMode::Write)?;
            let tombstone = SnapshotEntry {
                flags: retained,
                ..entry.clone()
            };
            self.write_record_at(ino, &tombstone.to_record(None))?;
        }

        info!(
            target: "cowsnap::lifecycle",
            ino = ino.0,
            id = entry.id.0,
            freed,
            "snapshot removed"
        );
        Ok(RemoveOutcome::Removed)
    }

    /// Reconcile the list after any transition or at mount
    ///
    /// Walks oldest to newest recomputing `LIST`, `ACTIVE` and `INUSE`,
    /// removes failed takes, and with `cleanup` removes deleted snapshots
    /// nothing depends on. If every snapshot ends up deleted the active one
    /// is deactivated and removed too.
    pub fn update(&mut self, cleanup: bool, read_only: bool) -> Result<()> {
        if cleanup && read_only {
            return Err(Error::invalid_argument("cleanup on a read-only volume"));
        }
        if self.state.list.is_empty() {
            return Ok(());
        }
        let active = self.volume.active_snapshot().map(|a| a.ino);

        let mut failed: SmallVec<[InodeNo; 4]> = SmallVec::new();
        let mut found_active = false;
        for e in self.state.list.iter_mut().rev() {
            e.flags.insert(SnapshotFlags::LIST);
            if found_active || active.is_none() {
                e.flags.remove(SnapshotFlags::ACTIVE | SnapshotFlags::INUSE);
                failed.push(e.ino);
                continue;
            }
            if read_only && !e.flags.contains(SnapshotFlags::DELETED) {
                e.flags.insert(SnapshotFlags::ENABLED);
            }
            let is_active = Some(e.ino) == active;
            e.flags.set(SnapshotFlags::ACTIVE, is_active);
            found_active |= is_active;
        }

        // newest to oldest from the active snapshot
        let mut newer_enabled = false;
        for e in self.state.list.iter_mut().skip_while(|e| Some(e.ino) != active) {
            e.flags.set(SnapshotFlags::INUSE, newer_enabled);
            if e.flags.contains(SnapshotFlags::ENABLED) && !e.flags.contains(SnapshotFlags::DELETED) {
                newer_enabled = true;
            }
        }

        let mut used_by = false;
        let mut reap: SmallVec<[InodeNo; 4]> = SmallVec::new();
        for e in self.state.list.iter().rev() {
            if failed.contains(&e.ino) {
                break;
            }
            let is_active = Some(e.ino) == active;
            let deleted = e.flags.contains(SnapshotFlags::DELETED) && !is_active;
            if cleanup && deleted && !used_by {
                reap.push(e.ino);
            }
            if !deleted && !is_active {
                used_by = true;
            }
        }

        if !read_only {
            for ino in failed {
                warn!(target: "cowsnap::lifecycle", ino = ino.0, "removing snapshot that was never taken");
                self.remove(ino)?;
            }
        }
        for ino in reap {
            self.remove(ino)?;
        }

        let Some(active) = active else {
            return Ok(());
        };
        let active_deleted = self
            .state
            .list
            .get(active)
            .is_some_and(|e| e.flags.contains(SnapshotFlags::DELETED));
        if cleanup && !used_by && active_deleted {
            self.deactivate(active)?;
            self.remove(active)?;
        }
        Ok(())
    }

    fn deactivate(&mut self, ino: InodeNo) -> Result<()> {
        {
            let frozen = self.volume.journal().freeze();
            let mut sb = self.state.superblock.clone();
            sb.active_snapshot = None;
            self.write_superblock_frozen(&sb)?;

            self.state.superblock = sb;
            self.volume.cow().set_active(&frozen, None);
            if let Some(e) = self.state.list.get_mut(ino) {
                e.flags.remove(SnapshotFlags::ACTIVE);
            }
        }
        info!(target: "cowsnap::lifecycle", ino = ino.0, "active snapshot deactivated");
        Ok(())
    }

    // ========================================================================
    // Control surface
    // ========================================================================

    /// Current flags of `ino`, with `OPEN` reflecting live readers
    ///
    /// Files that are no longer listed report the flags kept in their record.
    pub fn get_flags(&self, ino: InodeNo) -> Result<SnapshotFlags> {
        if let Some(e) = self.state.list.get(ino) {
            let mut flags = e.flags;
            flags.set(SnapshotFlags::OPEN, self.volume.reader_count(ino) > 0);
            return Ok(flags);
        }
        Ok(self
            .read_record(ino)?
            .map(|r| r.flags())
            .unwrap_or_default())
    }

    /// Apply a requested flag set the way a `chattr`-style control call does
    ///
    /// `ENABLED` toggles enable / disable, setting `LIST` creates and takes a
    /// snapshot, clearing it deletes one. The list is reconciled afterwards
    /// even if a transition failed; the first error is returned.
    pub fn set_flags(&mut self, ino: InodeNo, requested: SnapshotFlags) -> Result<SnapshotFlags> {
        let old = self.get_flags(ino)?;
        let changed = old ^ requested;

        let mut result = Ok(());
        if changed.contains(SnapshotFlags::ENABLED) {
            result = if requested.contains(SnapshotFlags::ENABLED) {
                self.enable(ino)
            } else {
                self.disable(ino)
            };
        }
        if result.is_ok() && changed.contains(SnapshotFlags::LIST) {
            result = if requested.contains(SnapshotFlags::LIST) {
                self.create(ino).and_then(|()| self.take(ino))
            } else {
                self.delete(ino)
            };
        }
        if (old | requested).contains(SnapshotFlags::LIST) {
            let cleanup = !requested.contains(SnapshotFlags::LIST);
            let updated = self.update(cleanup, false);
            if result.is_ok() {
                result = updated;
            }
        }
        result?;
        self.get_flags(ino)
    }

    // ========================================================================
    // Mount
    // ========================================================================

    /// Load the on-disk list and activate the active snapshot
    pub(crate) fn load(&mut self) -> Result<()> {
        let read_only = self.volume.config().read_only;
        let sb = &self.state.superblock;
        if !sb.has_snapshot {
            if sb.active_snapshot.is_some() || sb.snapshot_list_head.is_some() {
                debug!(target: "cowsnap::lifecycle", "ignoring snapshot fields without the feature flag");
            }
            return Ok(());
        }
        let active = sb.active_snapshot;
        let head = sb.snapshot_list_head;

        let entries = match self.load_entries(head, active) {
            Ok(entries) => entries,
            Err(e) if read_only => {
                warn!(target: "cowsnap::lifecycle", error = %e, "failed to load snapshots, continuing read-only");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.state.list = SnapshotList::from_entries(entries);

        if let Some(ino) = active {
            if self.state.list.get(ino).is_none() {
                let err = Error::Corruption(format!("active snapshot {} is not on the list", ino));
                if read_only {
                    warn!(target: "cowsnap::lifecycle", error = %err, "continuing read-only");
                    self.state.list.clear();
                    return Ok(());
                }
                return Err(err);
            }
            let mut id = None;
            if let Some(entry) = self.state.list.get_mut(ino) {
                entry.flags.insert(SnapshotFlags::ACTIVE);
                id = Some(entry.id);
            }
            if let Some(id) = id {
                let frozen = self.volume.journal().freeze();
                self.volume
                    .cow()
                    .set_active(&frozen, Some(ActiveSnapshot { ino, id }));
            }
        }

        info!(
            target: "cowsnap::lifecycle",
            snapshots = self.state.list.len(),
            active = ?active.map(|a| a.0),
            "snapshot list loaded"
        );
        self.update(false, read_only)
    }

    fn load_entries(
        &self,
        head: Option<InodeNo>,
        active: Option<InodeNo>,
    ) -> Result<Vec<SnapshotEntry>> {
        let Some(head) = head.or(active) else {
            return Ok(Vec::new());
        };
        match self.walk(head) {
            Ok(entries) => Ok(entries),
            Err(e) => match active {
                Some(active) if active != head => {
                    warn!(
                        target: "cowsnap::lifecycle",
                        head = head.0,
                        active = active.0,
                        error = %e,
                        "failed to load list head, loading from the active snapshot"
                    );
                    self.walk(active)
                }
                _ => Err(e),
            },
        }
    }

    fn walk(&self, start: InodeNo) -> Result<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        let mut seen = FxHashSet::default();
        let mut next = Some(start);
        while let Some(ino) = next {
            if !seen.insert(ino) {
                return Err(Error::Corruption(format!(
                    "snapshot list loops back to inode {}",
                    ino
                )));
            }
            let record = self
                .read_record(ino)?
                .ok_or_else(|| Error::Corruption(format!("snapshot {} has no record", ino)))?;
            if !record.flags().contains(SnapshotFlags::LIST) {
                return Err(Error::Corruption(format!(
                    "snapshot {} on the list without the list flag",
                    ino
                )));
            }
            if !record.id.is_valid() {
                return Err(Error::Corruption(format!(
                    "snapshot {} carries the reserved id {}",
                    ino, record.id
                )));
            }
            entries.push(SnapshotEntry::from_record(ino, &record));
            next = record.next;
        }
        Ok(entries)
    }
}
