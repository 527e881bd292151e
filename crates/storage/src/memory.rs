//! In-memory block store
//!
//! `MemBlockStore` implements [`BlockStore`] over a sparse map of blocks.
//! Unwritten blocks read as zeros. Group block bitmaps and exclude bitmaps
//! live in ordinary device blocks at the locations given by [`Geometry`], so
//! the snapshot engine can read them like any other block.
//!
//! # Thread Safety
//!
//! Blocks and files are kept in `DashMap`s. Bitmap read-modify-write cycles
//! run under the map entry lock of the bitmap block. File maps are updated
//! under the entry lock of the file, which makes `map_snapshot_blocks`
//! atomic per snapshot: of two racing allocations for the same address,
//! exactly one reports `allocated`.
//!
//! Lock order is always `files` entry, then `blocks` entry.

use crate::bitmap;
use cowsnap_core::{
    BlockBuf, BlockNr, BlockStore, Error, FileInfo, Geometry, GroupNumber, InodeNo, MapMode,
    MapOutcome, Result, SnapBlock,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// I/O counters
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    writes: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl StoreStats {
    /// Blocks read
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Blocks written
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Blocks allocated
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Blocks freed
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct FileState {
    linked: bool,
    excluded: bool,
    charged: u64,
    map: BTreeMap<SnapBlock, BlockNr>,
}

/// Sparse in-memory block device with allocator and file maps
pub struct MemBlockStore {
    geometry: Geometry,
    blocks: DashMap<BlockNr, Box<[u8]>>,
    files: DashMap<InodeNo, FileState>,
    read_faults: Mutex<FxHashSet<BlockNr>>,
    write_faults: Mutex<FxHashSet<BlockNr>>,
    stats: StoreStats,
}

impl MemBlockStore {
    /// Create a store with every group bitmap initialized
    ///
    /// Superblock, bitmap and exclude blocks are marked allocated, as are
    /// the padding bits past the end of a short last group.
    pub fn new(geometry: Geometry) -> Self {
        let store = MemBlockStore {
            geometry,
            blocks: DashMap::new(),
            files: DashMap::new(),
            read_faults: Mutex::new(FxHashSet::default()),
            write_faults: Mutex::new(FxHashSet::default()),
            stats: StoreStats::default(),
        };

        let bits = geometry.blocks_per_group() as u32;
        for group in 0..geometry.group_count() {
            let mut bm = vec![0u8; geometry.block_size()];
            let first = geometry.group_first_block(group);
            for block in first..geometry.first_data_block(group) {
                bitmap::set_bit(&mut bm, geometry.offset_in_group(block));
            }
            for idx in geometry.group_len(group)..bits {
                bitmap::set_bit(&mut bm, idx);
            }
            store
                .blocks
                .insert(geometry.bitmap_block(group), bm.into_boxed_slice());
        }
        debug!(
            target: "cowsnap::store",
            blocks = geometry.blocks_count(),
            groups = geometry.group_count(),
            "initialized in-memory block store"
        );
        store
    }

    /// I/O counters
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Make every subsequent read of `block` fail with an I/O error
    pub fn fail_reads(&self, block: BlockNr) {
        self.read_faults.lock().insert(block);
    }

    /// Make every subsequent write of `block` fail with an I/O error
    pub fn fail_writes(&self, block: BlockNr) {
        self.write_faults.lock().insert(block);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.read_faults.lock().clear();
        self.write_faults.lock().clear();
    }

    /// Run `f` on the bitmap block of `group` under its entry lock
    fn update_bitmap<R>(&self, block: BlockNr, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let size = self.geometry.block_size();
        let mut entry = self
            .blocks
            .entry(block)
            .or_insert_with(|| vec![0u8; size].into_boxed_slice());
        f(&mut entry)
    }

    fn test_bitmap(&self, block: BlockNr, idx: u32) -> bool {
        self.blocks
            .get(&block)
            .map(|bm| bitmap::test_bit(&bm, idx))
            .unwrap_or(false)
    }

    fn is_group_metadata(&self, block: BlockNr) -> bool {
        let group = self.geometry.group_of(block);
        block < self.geometry.first_data_block(group)
    }

    fn file_mut(&self, ino: InodeNo) -> Result<dashmap::mapref::one::RefMut<'_, InodeNo, FileState>> {
        self.files
            .get_mut(&ino)
            .ok_or_else(|| Error::not_found(format!("inode {}", ino)))
    }

    /// Allocate one block, preferring the group of `goal`
    fn allocate_near(&self, goal: Option<BlockNr>) -> Result<BlockNr> {
        let groups = self.geometry.group_count();
        let start = goal
            .filter(|b| self.geometry.contains(*b))
            .map(|b| self.geometry.group_of(b))
            .unwrap_or(0);
        for i in 0..groups {
            let group = (start + i) % groups;
            if let Some(block) = self.allocate_in_group(group, goal)? {
                return Ok(block);
            }
        }
        Err(Error::NoSpace(format!(
            "no free blocks on a volume of {} blocks",
            self.geometry.blocks_count()
        )))
    }
}

impl BlockStore for MemBlockStore {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_block(&self, block: BlockNr) -> Result<BlockBuf> {
        self.geometry.check_block(block)?;
        if self.read_faults.lock().contains(&block) {
            warn!(target: "cowsnap::store", block, "injected read fault");
            return Err(Error::io(format!("read error on block {}", block)));
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(match self.blocks.get(&block) {
            Some(data) => BlockBuf::new(data.to_vec()),
            None => BlockBuf::zeroed(self.geometry.block_size()),
        })
    }

    fn write_block(&self, block: BlockNr, data: &[u8]) -> Result<()> {
        self.geometry.check_block(block)?;
        if data.len() != self.geometry.block_size() {
            return Err(Error::invalid_argument(format!(
                "write of {} bytes to block {} (block size {})",
                data.len(),
                block,
                self.geometry.block_size()
            )));
        }
        if self.write_faults.lock().contains(&block) {
            warn!(target: "cowsnap::store", block, "injected write fault");
            return Err(Error::io(format!("write error on block {}", block)));
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.insert(block, data.to_vec().into_boxed_slice());
        Ok(())
    }

    fn allocate_in_group(&self, group: GroupNumber, goal: Option<BlockNr>) -> Result<Option<BlockNr>> {
        if group >= self.geometry.group_count() {
            return Err(Error::invalid_argument(format!("no group {}", group)));
        }
        let first = self.geometry.group_first_block(group);
        let len = self.geometry.group_len(group);
        let start = goal
            .filter(|b| self.geometry.group_of(*b) == group)
            .map(|b| self.geometry.offset_in_group(b))
            .unwrap_or(0);

        let found = self.update_bitmap(self.geometry.bitmap_block(group), |bm| {
            let idx = bitmap::find_free(bm, len, start)?;
            bitmap::set_bit(bm, idx);
            Some(idx)
        });
        Ok(found.map(|idx| {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            let block = first + idx as u64;
            trace!(target: "cowsnap::store", block, "allocated");
            block
        }))
    }

    fn free_block(&self, block: BlockNr) -> Result<()> {
        self.geometry.check_block(block)?;
        if self.is_group_metadata(block) {
            return Err(Error::invalid_argument(format!(
                "block {} is group metadata",
                block
            )));
        }
        let group = self.geometry.group_of(block);
        let idx = self.geometry.offset_in_group(block);
        let was = self.update_bitmap(self.geometry.bitmap_block(group), |bm| {
            bitmap::clear_bit(bm, idx)
        });
        if !was {
            return Err(Error::Corruption(format!("double free of block {}", block)));
        }
        self.update_bitmap(self.geometry.exclude_block(group), |bm| {
            bitmap::clear_bit(bm, idx)
        });
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        trace!(target: "cowsnap::store", block, "freed");
        Ok(())
    }

    fn is_allocated(&self, block: BlockNr) -> Result<bool> {
        self.geometry.check_block(block)?;
        let group = self.geometry.group_of(block);
        Ok(self.test_bitmap(
            self.geometry.bitmap_block(group),
            self.geometry.offset_in_group(block),
        ))
    }

    fn free_blocks_count(&self) -> Result<u64> {
        let mut free = 0u64;
        for group in 0..self.geometry.group_count() {
            let len = self.geometry.group_len(group);
            let bm = self.read_block(self.geometry.bitmap_block(group))?;
            free += bitmap::count_free(bm.as_slice(), len) as u64;
        }
        Ok(free)
    }

    fn set_excluded(&self, block: BlockNr, count: u32) -> Result<()> {
        for b in block..block + count as u64 {
            self.geometry.check_block(b)?;
            let group = self.geometry.group_of(b);
            let idx = self.geometry.offset_in_group(b);
            self.update_bitmap(self.geometry.exclude_block(group), |bm| {
                bitmap::set_bit(bm, idx)
            });
        }
        Ok(())
    }

    fn is_excluded(&self, block: BlockNr) -> Result<bool> {
        self.geometry.check_block(block)?;
        let group = self.geometry.group_of(block);
        Ok(self.test_bitmap(
            self.geometry.exclude_block(group),
            self.geometry.offset_in_group(block),
        ))
    }

    fn create_file(&self, ino: InodeNo, excluded: bool) -> Result<()> {
        match self.files.entry(ino) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::AlreadyExists(format!("inode {}", ino)))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(FileState {
                    linked: true,
                    excluded,
                    ..FileState::default()
                });
                Ok(())
            }
        }
    }

    fn file_info(&self, ino: InodeNo) -> Result<FileInfo> {
        let file = self
            .files
            .get(&ino)
            .ok_or_else(|| Error::not_found(format!("inode {}", ino)))?;
        Ok(FileInfo {
            ino,
            linked: file.linked,
            excluded: file.excluded,
            mapped_blocks: file.map.len() as u64,
            charged_blocks: file.charged,
        })
    }

    fn unlink_file(&self, ino: InodeNo) -> Result<()> {
        self.file_mut(ino)?.linked = false;
        Ok(())
    }

    fn charge_blocks(&self, ino: InodeNo, delta: i64) -> Result<()> {
        let mut file = self.file_mut(ino)?;
        let charged = file.charged as i64 + delta;
        if charged < 0 {
            warn!(
                target: "cowsnap::store",
                ino = ino.0,
                charged = file.charged,
                delta,
                "quota charge would go negative"
            );
        }
        file.charged = charged.max(0) as u64;
        Ok(())
    }

    fn lookup(&self, ino: InodeNo, addr: SnapBlock) -> Result<Option<BlockNr>> {
        let file = self
            .files
            .get(&ino)
            .ok_or_else(|| Error::not_found(format!("inode {}", ino)))?;
        Ok(file.map.get(&addr).copied())
    }

    fn set_mapping(&self, ino: InodeNo, addr: SnapBlock, physical: BlockNr) -> Result<Option<BlockNr>> {
        self.geometry.check_block(physical)?;
        Ok(self.file_mut(ino)?.map.insert(addr, physical))
    }

    fn clear_mapping(&self, ino: InodeNo, addr: SnapBlock) -> Result<Option<BlockNr>> {
        Ok(self.file_mut(ino)?.map.remove(&addr))
    }

    fn map_snapshot_blocks(
        &self,
        snapshot: InodeNo,
        addr: SnapBlock,
        count: u32,
        mode: MapMode,
    ) -> Result<MapOutcome> {
        if count == 0 {
            return Ok(MapOutcome::unmapped());
        }
        let mut file = self.file_mut(snapshot)?;

        match mode {
            MapMode::Read => {
                let Some(&first) = file.map.get(&addr) else {
                    return Ok(MapOutcome::unmapped());
                };
                let mut n = 1;
                while n < count && file.map.get(&(addr + n as i64)) == Some(&(first + n as u64)) {
                    n += 1;
                }
                Ok(MapOutcome::found(first, n))
            }
            MapMode::Write | MapMode::Cow | MapMode::Bitmap => {
                if let Some(&physical) = file.map.get(&addr) {
                    return Ok(MapOutcome::found(physical, 1));
                }
                let goal = u64::try_from(addr).ok();
                let physical = self.allocate_near(goal)?;
                self.set_excluded(physical, 1)?;
                file.map.insert(addr, physical);
                file.charged += 1;
                trace!(
                    target: "cowsnap::store",
                    snapshot = snapshot.0,
                    addr,
                    physical,
                    ?mode,
                    "mapped snapshot block"
                );
                Ok(MapOutcome::created(physical, 1))
            }
            MapMode::Move => {
                let first = u64::try_from(addr).map_err(|_| {
                    Error::invalid_argument(format!("cannot move into metadata address {}", addr))
                })?;
                let mut moved = 0u32;
                while moved < count {
                    let a = addr + moved as i64;
                    let physical = first + moved as u64;
                    if file.map.contains_key(&a) {
                        break;
                    }
                    if !self.is_allocated(physical)? {
                        return Err(Error::Corruption(format!(
                            "moving unallocated block {}",
                            physical
                        )));
                    }
                    self.set_excluded(physical, 1)?;
                    file.map.insert(a, physical);
                    moved += 1;
                }
                file.charged += moved as u64;
                if moved == 0 {
                    Ok(MapOutcome::unmapped())
                } else {
                    Ok(MapOutcome::created(first, moved))
                }
            }
        }
    }

    fn mappings(&self, ino: InodeNo) -> Result<Vec<(SnapBlock, BlockNr)>> {
        let file = self
            .files
            .get(&ino)
            .ok_or_else(|| Error::not_found(format!("inode {}", ino)))?;
        Ok(file.map.iter().map(|(a, p)| (*a, *p)).collect())
    }

    fn truncate(&self, ino: InodeNo) -> Result<u64> {
        let mut file = self.file_mut(ino)?;
        let map = std::mem::take(&mut file.map);
        file.charged = 0;
        let mut freed = 0u64;
        for physical in map.into_values() {
            self.free_block(physical)?;
            freed += 1;
        }
        debug!(target: "cowsnap::store", ino = ino.0, freed, "truncated file");
        Ok(freed)
    }
}
