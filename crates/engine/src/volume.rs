//! Volume: the context object every operation goes through
//!
//! A `Volume` owns the block store, the journal, the COW engine and the
//! snapshot list. It provides:
//!
//! - Format / mount / unmount
//! - Handle admission (`start` / `stop`) with COW counters folded into
//!   volume-wide metrics
//! - The journal access hooks (`get_write_access`, `get_undo_access`,
//!   `get_create_access`, `mark_dirty`) that run the COW engine before a
//!   block joins a transaction
//! - A small file layer (allocate, overwrite, free) that exercises backup
//!   and move the way a filesystem would
//!
//! ## Locking
//!
//! Lock order is snapshot state, then journal freeze, then buffer lock.
//! Writers only ever take buffer locks, one at a time. The buffer lock of a
//! block is held across its COW decision and the write that follows.

use crate::bitmap::{BitmapCacheStrategy, CachedBitmaps, UncachedBitmaps};
use crate::config::{BitmapCacheMode, CowCacheMode, FormatOptions, SnapshotListMode, VolumeConfig};
use crate::cow::{ActiveSnapshot, CowEngine};
use crate::lifecycle::{
    ListStrategy, SingleSlotStrategy, SnapshotControl, SnapshotInfo, SnapshotListStrategy,
    SnapshotState,
};
use crate::reader::SnapshotReader;
use cowsnap_concurrency::{
    CowStats, Handle, Journal, NoCowCache, TidTaggedCowCache, TransactionCowCacheStrategy,
};
use cowsnap_core::limits::SUPERBLOCK_NR;
use cowsnap_core::{
    BlockNr, BlockStore, Error, InodeNo, Owner, Result, SnapshotFlags, Superblock,
};
use cowsnap_storage::{decode_record, encode_record, MemBlockStore, RecordKind};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Number of buffer lock stripes
const BUFFER_LOCK_STRIPES: usize = 256;

/// A mounted volume
pub struct Volume {
    config: VolumeConfig,
    store: Arc<dyn BlockStore>,
    journal: Arc<Journal>,
    cow: CowEngine,
    state: Mutex<SnapshotState>,
    list_strategy: Box<dyn SnapshotListStrategy>,
    readers: DashMap<InodeNo, u32>,
    buffer_locks: Vec<Mutex<()>>,
    metrics: Mutex<CowStats>,
}

impl Volume {
    // ========================================================================
    // Format / mount
    // ========================================================================

    /// Write a fresh superblock
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `options` disagree with the store's geometry.
    pub fn format(store: &dyn BlockStore, options: FormatOptions) -> Result<Superblock> {
        let geometry = *store.geometry();
        if options.geometry()? != geometry {
            return Err(Error::invalid_argument(
                "format options do not match the block store geometry",
            ));
        }
        let sb = Superblock::new(
            geometry.block_size() as u32,
            geometry.blocks_count(),
            options.last_snapshot_id,
        );
        let bytes = encode_record(RecordKind::Superblock, &sb, geometry.block_size())?;
        store.write_block(SUPERBLOCK_NR, &bytes)?;
        info!(
            target: "cowsnap::lifecycle",
            uuid = %sb.uuid,
            blocks = geometry.blocks_count(),
            block_size = geometry.block_size(),
            "formatted volume"
        );
        Ok(sb)
    }

    /// Mount a formatted store and load its snapshot list
    ///
    /// # Errors
    ///
    /// - `Corruption` if the superblock is unreadable or disagrees with the
    ///   store geometry
    /// - `PermissionDenied` when mounting a snapshot image read-write
    /// - any error loading the active snapshot on a read-write mount
    pub fn mount(store: Arc<dyn BlockStore>, config: VolumeConfig) -> Result<Volume> {
        config.validate()?;
        let geometry = *store.geometry();
        let sb: Superblock = decode_record(
            RecordKind::Superblock,
            store.read_block(SUPERBLOCK_NR)?.as_slice(),
        )?;
        if sb.blocks_count != geometry.blocks_count()
            || sb.block_size as usize != geometry.block_size()
        {
            return Err(Error::Corruption(format!(
                "superblock describes {} blocks of {} bytes, device has {} of {}",
                sb.blocks_count,
                sb.block_size,
                geometry.blocks_count(),
                geometry.block_size()
            )));
        }
        if sb.is_snapshot && !config.read_only {
            return Err(Error::permission_denied(
                "snapshot images can only be mounted read-only",
            ));
        }

        let journal = Arc::new(Journal::new(config.max_transaction_credits, config.cow_stats));
        let bitmap_strategy: Box<dyn BitmapCacheStrategy> = match config.bitmap_cache {
            BitmapCacheMode::Cached => Box::new(CachedBitmaps::new(geometry.group_count())),
            BitmapCacheMode::Uncached => Box::new(UncachedBitmaps),
        };
        let cow_cache: Box<dyn TransactionCowCacheStrategy> = match config.cow_cache {
            CowCacheMode::Tid => Box::new(TidTaggedCowCache::new()),
            CowCacheMode::Disabled => Box::new(NoCowCache),
        };
        let list_strategy: Box<dyn SnapshotListStrategy> = match config.snapshot_list {
            SnapshotListMode::List => Box::new(ListStrategy),
            SnapshotListMode::SingleSlot => Box::new(SingleSlotStrategy),
        };
        let cow = CowEngine::new(store.clone(), journal.clone(), bitmap_strategy, cow_cache);

        let volume = Volume {
            config,
            store,
            journal,
            cow,
            state: Mutex::new(SnapshotState::new(sb)),
            list_strategy,
            readers: DashMap::new(),
            buffer_locks: (0..BUFFER_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            metrics: Mutex::new(CowStats::default()),
        };
        volume.lock_snapshots().load()?;

        info!(
            target: "cowsnap::lifecycle",
            read_only = volume.config.read_only,
            snapshots = volume.state.lock().list.len(),
            active = ?volume.cow.active().map(|a| a.ino.0),
            "mounted volume"
        );
        Ok(volume)
    }

    /// Format and mount a volume on a fresh in-memory store
    pub fn in_memory(options: FormatOptions, config: VolumeConfig) -> Result<Volume> {
        let store = Arc::new(MemBlockStore::new(options.geometry()?));
        Self::format(&*store, options)?;
        Self::mount(store, config)
    }

    /// Drop the in-memory snapshot state and hand back the store
    ///
    /// Nothing is written: the on-disk list and active snapshot stay as they
    /// are and are picked up again by the next mount.
    pub fn unmount(self) -> Result<Arc<dyn BlockStore>> {
        {
            let mut state = self.state.lock();
            let frozen = self.journal.freeze();
            self.cow.set_active(&frozen, None);
            state.list.clear();
        }
        info!(target: "cowsnap::lifecycle", metrics = ?*self.metrics.lock(), "unmounted volume");
        Ok(self.store)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Runtime configuration
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Underlying block store
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Transaction service
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// COW engine
    pub fn cow(&self) -> &CowEngine {
        &self.cow
    }

    /// The active snapshot, if any
    pub fn active_snapshot(&self) -> Option<ActiveSnapshot> {
        self.cow.active()
    }

    /// COW counters of every stopped handle
    pub fn metrics(&self) -> CowStats {
        *self.metrics.lock()
    }

    /// In-memory copy of the superblock
    pub fn superblock(&self) -> Superblock {
        self.state.lock().superblock.clone()
    }

    /// Listed snapshots, newest first
    pub fn snapshots(&self) -> Vec<SnapshotInfo> {
        let state = self.state.lock();
        state
            .list
            .iter()
            .map(|e| e.info(self.reader_count(e.ino)))
            .collect()
    }

    /// Exclusive access to the snapshot lifecycle
    ///
    /// Blocks while another lifecycle operation is running.
    pub fn lock_snapshots(&self) -> SnapshotControl<'_> {
        SnapshotControl::new(self, self.state.lock())
    }

    pub(crate) fn list_strategy(&self) -> &dyn SnapshotListStrategy {
        &*self.list_strategy
    }

    pub(crate) fn state(&self) -> &Mutex<SnapshotState> {
        &self.state
    }

    // ========================================================================
    // Readers
    // ========================================================================

    /// Open an enabled snapshot for reading
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `ino` is not a taken snapshot, `PermissionDenied`
    /// if it is not enabled.
    pub fn open_snapshot(&self, ino: InodeNo) -> Result<SnapshotReader<'_>> {
        let state = self.state.lock();
        let idx = state
            .list
            .position(ino)
            .ok_or_else(|| Error::invalid_argument(format!("inode {} is not a snapshot", ino)))?;
        let entry = &state.list.entries()[idx];
        if !entry.flags.contains(SnapshotFlags::ENABLED) {
            return Err(Error::permission_denied(format!(
                "snapshot {} is not enabled",
                entry.id
            )));
        }
        if state.list.chain_from(idx).is_none() {
            return Err(Error::invalid_argument(format!(
                "snapshot {} was never taken",
                entry.id
            )));
        }
        *self.readers.entry(ino).or_insert(0) += 1;
        debug!(target: "cowsnap::lifecycle", ino = ino.0, id = entry.id.0, "snapshot opened");
        Ok(SnapshotReader::new(self, ino, entry.id, entry.size_blocks))
    }

    /// Number of open readers of `ino`
    pub fn reader_count(&self, ino: InodeNo) -> u32 {
        self.readers.get(&ino).map(|n| *n).unwrap_or(0)
    }

    pub(crate) fn release_reader(&self, ino: InodeNo) {
        if let Some(mut n) = self.readers.get_mut(&ino) {
            *n = n.saturating_sub(1);
        }
        self.readers.remove_if(&ino, |_, n| *n == 0);
    }

    /// Log every block of a snapshot at debug level
    pub fn dump_snapshot(&self, ino: InodeNo) -> Result<u64> {
        let mut count = 0u64;
        for (addr, physical) in self.store.mappings(ino)? {
            debug!(target: "cowsnap::lifecycle", ino = ino.0, addr, physical, "snapshot block");
            count += 1;
        }
        debug!(target: "cowsnap::lifecycle", ino = ino.0, count, "snapshot dump complete");
        Ok(count)
    }

    pub(crate) fn buffer_lock(&self, block: BlockNr) -> &Mutex<()> {
        &self.buffer_locks[(block % BUFFER_LOCK_STRIPES as u64) as usize]
    }

    // ========================================================================
    // Handles and access hooks
    // ========================================================================

    /// Start a handle able to modify `nblocks` blocks
    pub fn start(&self, nblocks: u32) -> Result<Handle> {
        if self.config.read_only {
            return Err(Error::permission_denied("volume is mounted read-only"));
        }
        self.journal.start(nblocks)
    }

    /// Stop a handle, folding its COW counters into the volume metrics
    pub fn stop(&self, handle: Handle) -> Result<()> {
        if let Some(stats) = handle.stats() {
            self.metrics.lock().merge(stats);
        }
        self.journal.stop(handle)
    }

    /// Make `block` writable in this transaction, backing it up first if the
    /// active snapshot needs its current contents
    pub fn get_write_access(
        &self,
        handle: &mut Handle,
        owner: Option<&Owner>,
        block: BlockNr,
    ) -> Result<()> {
        self.cow.test_and_cow(handle, owner, block, None, true)?;
        handle.access(block)
    }

    /// Write access that also keeps the committed image of `block`
    ///
    /// Used for allocation bitmaps, whose committed image is what the COW
    /// bitmap is built from.
    pub fn get_undo_access(
        &self,
        handle: &mut Handle,
        owner: Option<&Owner>,
        block: BlockNr,
    ) -> Result<()> {
        handle.check_active()?;
        self.journal
            .save_committed(block, || self.store.read_block(block))?;
        self.get_write_access(handle, owner, block)
    }

    /// Access to a block that was just allocated and must not need a backup
    pub fn get_create_access(
        &self,
        handle: &mut Handle,
        owner: Option<&Owner>,
        block: BlockNr,
    ) -> Result<()> {
        self.cow.test_and_cow(handle, owner, block, None, false)?;
        handle.access(block)
    }

    /// Record a modification of a block previously accessed on `handle`
    pub fn mark_dirty(&self, handle: &mut Handle, block: BlockNr) -> Result<()> {
        handle.dirty(block)
    }

    /// Overwrite `block` in place
    pub fn write_block(
        &self,
        handle: &mut Handle,
        owner: Option<&Owner>,
        block: BlockNr,
        data: &[u8],
    ) -> Result<()> {
        let _guard = self.buffer_lock(block).lock();
        self.get_write_access(handle, owner, block)?;
        self.store.write_block(block, data)?;
        self.mark_dirty(handle, block)
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Create a regular file
    pub fn create_file(&self, ino: InodeNo, excluded: bool) -> Result<Owner> {
        self.store.create_file(ino, excluded)?;
        Ok(Owner { ino, excluded })
    }

    /// Owner descriptor of an existing file
    pub fn owner(&self, ino: InodeNo) -> Result<Owner> {
        let info = self.store.file_info(ino)?;
        Ok(Owner {
            ino,
            excluded: info.excluded,
        })
    }

    /// Physical block behind `logical` in a regular file
    pub fn file_block(&self, ino: InodeNo, logical: u64) -> Result<Option<BlockNr>> {
        self.store.lookup(ino, logical as i64)
    }

    /// Allocate a block for `logical` in `owner`, preferring `goal`'s group
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `logical` is already mapped, `NoSpace` if every
    /// group is full.
    pub fn allocate_file_block(
        &self,
        handle: &mut Handle,
        owner: &Owner,
        logical: u64,
        goal: Option<BlockNr>,
    ) -> Result<BlockNr> {
        if self.store.lookup(owner.ino, logical as i64)?.is_some() {
            return Err(Error::invalid_argument(format!(
                "block {} of inode {} is already mapped",
                logical, owner.ino
            )));
        }
        let geometry = *self.store.geometry();
        let groups = geometry.group_count();
        let start = goal
            .filter(|b| geometry.contains(*b))
            .map(|b| geometry.group_of(b))
            .unwrap_or(0);

        for i in 0..groups {
            let group = (start + i) % groups;
            let bitmap_nr = geometry.bitmap_block(group);
            let allocated = {
                let _guard = self.buffer_lock(bitmap_nr).lock();
                self.get_undo_access(handle, None, bitmap_nr)?;
                let block = self.store.allocate_in_group(group, goal)?;
                if block.is_some() {
                    self.mark_dirty(handle, bitmap_nr)?;
                }
                block
            };
            let Some(block) = allocated else {
                continue;
            };

            {
                let _guard = self.buffer_lock(block).lock();
                self.get_create_access(handle, Some(owner), block)?;
            }
            if owner.excluded {
                self.store.set_excluded(block, 1)?;
            }
            self.store.set_mapping(owner.ino, logical as i64, block)?;
            self.store.charge_blocks(owner.ino, 1)?;
            return Ok(block);
        }
        Err(Error::NoSpace(format!(
            "no free block for inode {}",
            owner.ino
        )))
    }

    /// Write `data` to `logical` in `owner`, allocating on first write
    ///
    /// If the current block must be preserved for the active snapshot it is
    /// moved there and the data lands in a newly allocated block
    /// (move-on-write). Returns the physical block written.
    pub fn write_file_block(
        &self,
        handle: &mut Handle,
        owner: &Owner,
        logical: u64,
        data: &[u8],
    ) -> Result<BlockNr> {
        let Some(physical) = self.store.lookup(owner.ino, logical as i64)? else {
            let block = self.allocate_file_block(handle, owner, logical, None)?;
            self.write_block(handle, Some(owner), block, data)?;
            return Ok(block);
        };

        {
            let _guard = self.buffer_lock(physical).lock();
            let moved = self
                .cow
                .test_and_move(handle, Some(owner), physical, 1, true)?;
            if moved == 0 {
                self.get_write_access(handle, Some(owner), physical)?;
                self.store.write_block(physical, data)?;
                self.mark_dirty(handle, physical)?;
                return Ok(physical);
            }
            self.store.clear_mapping(owner.ino, logical as i64)?;
            self.store.charge_blocks(owner.ino, -1)?;
        }

        let block = self.allocate_file_block(handle, owner, logical, Some(physical))?;
        self.write_block(handle, Some(owner), block, data)?;
        debug!(
            target: "cowsnap::cow",
            ino = owner.ino.0,
            logical,
            from = physical,
            to = block,
            "moved on write"
        );
        Ok(block)
    }

    /// Release `logical` from `owner`
    ///
    /// The block goes to the active snapshot instead of the free pool when
    /// the snapshot needs it. Returns true if it was moved.
    pub fn free_file_block(&self, handle: &mut Handle, owner: &Owner, logical: u64) -> Result<bool> {
        let physical = self
            .store
            .lookup(owner.ino, logical as i64)?
            .ok_or_else(|| {
                Error::not_found(format!("block {} of inode {}", logical, owner.ino))
            })?;

        let moved = {
            let _guard = self.buffer_lock(physical).lock();
            self.cow
                .test_and_move(handle, Some(owner), physical, 1, true)?
        };
        self.store.clear_mapping(owner.ino, logical as i64)?;
        self.store.charge_blocks(owner.ino, -1)?;
        if moved > 0 {
            return Ok(true);
        }

        let bitmap_nr = self
            .store
            .geometry()
            .bitmap_block(self.store.geometry().group_of(physical));
        let _guard = self.buffer_lock(bitmap_nr).lock();
        self.get_undo_access(handle, None, bitmap_nr)?;
        self.store.free_block(physical)?;
        self.mark_dirty(handle, bitmap_nr)?;
        Ok(false)
    }
}
