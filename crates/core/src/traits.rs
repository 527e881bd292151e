//! Collaborator interface consumed by the snapshot engine
//!
//! The engine never touches the device or the allocator directly; it goes
//! through [`BlockStore`]. Files (regular and snapshot) are block maps keyed
//! by logical address. Regular files use non-negative addresses only.

use crate::error::Result;
use crate::types::{BlockBuf, BlockNr, Geometry, GroupNumber, InodeNo, MapMode, MapOutcome, SnapBlock};

/// Summary of a file known to the block store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Inode number
    pub ino: InodeNo,
    /// False once the last directory link is gone
    pub linked: bool,
    /// Blocks of this file are never backed up
    pub excluded: bool,
    /// Number of mapped blocks
    pub mapped_blocks: u64,
    /// Blocks charged against this file's quota
    pub charged_blocks: u64,
}

impl FileInfo {
    /// True if the file maps no blocks
    pub fn is_empty(&self) -> bool {
        self.mapped_blocks == 0
    }
}

/// Block device, allocator and block-mapping service
///
/// Implementations must be safe to call from many writer threads at once.
/// Allocation through [`BlockStore::map_snapshot_blocks`] must be atomic per
/// address: when two callers race to map the same address, exactly one
/// observes `allocated == true`.
pub trait BlockStore: Send + Sync {
    /// Volume geometry
    fn geometry(&self) -> &Geometry;

    // ========================================================================
    // Device
    // ========================================================================

    /// Read one block synchronously
    fn read_block(&self, block: BlockNr) -> Result<BlockBuf>;

    /// Write one block synchronously
    fn write_block(&self, block: BlockNr, data: &[u8]) -> Result<()>;

    // ========================================================================
    // Allocator
    // ========================================================================

    /// Allocate one free block in `group`, or `None` if the group is full
    fn allocate_in_group(&self, group: GroupNumber, goal: Option<BlockNr>) -> Result<Option<BlockNr>>;

    /// Return a block to the free pool
    fn free_block(&self, block: BlockNr) -> Result<()>;

    /// True if the block is allocated in the live bitmap
    fn is_allocated(&self, block: BlockNr) -> Result<bool>;

    /// Number of free blocks on the volume
    fn free_blocks_count(&self) -> Result<u64>;

    /// Mark blocks as owned by snapshot or excluded files
    fn set_excluded(&self, block: BlockNr, count: u32) -> Result<()>;

    /// True if the block is marked in the exclude bitmap
    fn is_excluded(&self, block: BlockNr) -> Result<bool>;

    // ========================================================================
    // Files
    // ========================================================================

    /// Register a new, empty, linked file
    fn create_file(&self, ino: InodeNo, excluded: bool) -> Result<()>;

    /// Look up a file
    fn file_info(&self, ino: InodeNo) -> Result<FileInfo>;

    /// Drop the last link of a file
    fn unlink_file(&self, ino: InodeNo) -> Result<()>;

    /// Adjust the quota charge of a file by `delta` blocks
    fn charge_blocks(&self, ino: InodeNo, delta: i64) -> Result<()>;

    /// Physical block at `addr` in `ino`, if mapped
    fn lookup(&self, ino: InodeNo, addr: SnapBlock) -> Result<Option<BlockNr>>;

    /// Map `addr` in `ino` to an already-allocated physical block
    ///
    /// Returns the previous mapping, if any.
    fn set_mapping(&self, ino: InodeNo, addr: SnapBlock, physical: BlockNr) -> Result<Option<BlockNr>>;

    /// Remove the mapping at `addr` without freeing the physical block
    fn clear_mapping(&self, ino: InodeNo, addr: SnapBlock) -> Result<Option<BlockNr>>;

    /// Resolve or allocate `count` snapshot addresses starting at `addr`
    ///
    /// `MapMode::Move` never allocates: the physical blocks at the same
    /// addresses become the snapshot's blocks and are marked excluded. The
    /// run stops at the first address that is already mapped.
    fn map_snapshot_blocks(
        &self,
        snapshot: InodeNo,
        addr: SnapBlock,
        count: u32,
        mode: MapMode,
    ) -> Result<MapOutcome>;

    /// All mappings of a file, ordered by address
    fn mappings(&self, ino: InodeNo) -> Result<Vec<(SnapBlock, BlockNr)>>;

    /// Free every block of a file; returns the number of blocks freed
    fn truncate(&self, ino: InodeNo) -> Result<u64>;
}
