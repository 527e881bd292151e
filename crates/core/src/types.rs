//! Core address and identity types
//!
//! Physical filesystem blocks are addressed by [`BlockNr`]. A snapshot has its
//! own logical address space addressed by [`SnapBlock`]: non-negative
//! addresses mirror the filesystem block they back up, negative addresses
//! hold the snapshot's reserved metadata region.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical filesystem block number
pub type BlockNr = u64;

/// Logical block address inside a snapshot image (negative = metadata region)
pub type SnapBlock = i64;

/// Block group index
pub type GroupNumber = u32;

/// Journal transaction id
pub type Tid = u64;

// ============================================================================
// Identity
// ============================================================================

/// Inode number of a file (regular file or snapshot file)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeNo(pub u64);

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot generation identifier
///
/// Assigned monotonically at creation and never reused. Zero is reserved
/// as "invalid"; the successor of `u32::MAX` wraps to 1, never to 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SnapshotId(pub u32);

impl SnapshotId {
    /// The reserved invalid id
    pub const INVALID: SnapshotId = SnapshotId(0);

    /// True unless this is the reserved zero id
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Next id in sequence, skipping zero on wrap-around
    pub fn next(self) -> SnapshotId {
        match self.0.wrapping_add(1) {
            0 => SnapshotId(1),
            n => SnapshotId(n),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Volume geometry
///
/// Every group holds `block_size * 8` blocks so that one bitmap block covers
/// exactly one group. Group layout:
///
/// ```text
/// group 0:  [superblock][block bitmap][exclude bitmap][data ...]
/// group n:  [block bitmap][exclude bitmap][data ...]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    block_size: usize,
    blocks_count: u64,
    blocks_per_group_bits: u32,
}

impl Geometry {
    /// Build a geometry for `blocks_count` blocks of `block_size` bytes
    ///
    /// A last group too short to hold its bitmaps and at least one data
    /// block is cut off, so `blocks_count()` may be smaller than requested.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the block size is not a power of two within
    /// the supported range, or the volume cannot hold its own metadata.
    pub fn new(block_size: usize, blocks_count: u64) -> Result<Self> {
        if !block_size.is_power_of_two()
            || block_size < crate::limits::MIN_BLOCK_SIZE
            || block_size > crate::limits::MAX_BLOCK_SIZE
        {
            return Err(Error::invalid_argument(format!(
                "unsupported block size {}",
                block_size
            )));
        }
        let blocks_per_group_bits = (block_size * 8).trailing_zeros();
        let mut geometry = Geometry {
            block_size,
            blocks_count,
            blocks_per_group_bits,
        };
        // a trailing group with no room for data past its bitmaps is dropped
        let last = geometry.group_of(blocks_count.saturating_sub(1));
        if last > 0 && blocks_count <= geometry.first_data_block(last) {
            geometry.blocks_count = geometry.group_first_block(last);
        }
        if blocks_count <= geometry.first_data_block(0) {
            return Err(Error::invalid_argument(format!(
                "volume of {} blocks is too small",
                blocks_count
            )));
        }
        Ok(geometry)
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks on the volume
    pub fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    /// log2 of the group size
    pub fn blocks_per_group_bits(&self) -> u32 {
        self.blocks_per_group_bits
    }

    /// Number of blocks in a full group
    pub fn blocks_per_group(&self) -> u64 {
        1u64 << self.blocks_per_group_bits
    }

    /// Number of groups (the last one may be short)
    pub fn group_count(&self) -> u32 {
        let bpg = self.blocks_per_group();
        ((self.blocks_count + bpg - 1) / bpg) as u32
    }

    /// Group that holds `block`
    pub fn group_of(&self, block: BlockNr) -> GroupNumber {
        (block >> self.blocks_per_group_bits) as GroupNumber
    }

    /// Bit offset of `block` within its group
    pub fn offset_in_group(&self, block: BlockNr) -> u32 {
        (block & (self.blocks_per_group() - 1)) as u32
    }

    /// First block of `group`
    pub fn group_first_block(&self, group: GroupNumber) -> BlockNr {
        (group as u64) << self.blocks_per_group_bits
    }

    /// Number of usable blocks in `group`
    pub fn group_len(&self, group: GroupNumber) -> u32 {
        let first = self.group_first_block(group);
        (self.blocks_count - first).min(self.blocks_per_group()) as u32
    }

    /// Location of the block allocation bitmap for `group`
    pub fn bitmap_block(&self, group: GroupNumber) -> BlockNr {
        let first = self.group_first_block(group);
        if group == 0 {
            first + 1
        } else {
            first
        }
    }

    /// Location of the exclude bitmap for `group`
    pub fn exclude_block(&self, group: GroupNumber) -> BlockNr {
        self.bitmap_block(group) + 1
    }

    /// First block of `group` available for allocation
    pub fn first_data_block(&self, group: GroupNumber) -> BlockNr {
        self.exclude_block(group) + 1
    }

    /// True if `block` lies inside the volume
    pub fn contains(&self, block: BlockNr) -> bool {
        block < self.blocks_count
    }

    /// Validate that `block` lies inside the volume
    pub fn check_block(&self, block: BlockNr) -> Result<()> {
        if self.contains(block) {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "block {} beyond end of volume ({} blocks)",
                block, self.blocks_count
            )))
        }
    }
}

// ============================================================================
// Buffers
// ============================================================================

/// Owned block-sized buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    /// Wrap existing bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Zero-filled buffer of `size` bytes
    pub fn zeroed(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    /// Immutable view of the contents
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable view of the contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length buffer
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Ownership and mapping
// ============================================================================

/// The file that owns a block being modified
///
/// `None` in place of an owner means filesystem-global metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Owning inode
    pub ino: InodeNo,
    /// Blocks of excluded files are never backed up
    pub excluded: bool,
}

impl Owner {
    /// Owner whose blocks are protected by snapshots
    pub fn file(ino: InodeNo) -> Self {
        Self {
            ino,
            excluded: false,
        }
    }

    /// Owner whose blocks are ignored by snapshots
    pub fn excluded(ino: InodeNo) -> Self {
        Self {
            ino,
            excluded: true,
        }
    }
}

/// How a snapshot address should be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Lookup only
    Read,
    /// Allocate if unmapped (snapshot metadata pre-allocation)
    Write,
    /// Allocate a destination for a backup copy
    Cow,
    /// Allocate a destination for a synthesized COW bitmap
    Bitmap,
    /// Take ownership of the physical blocks at the same address
    Move,
}

impl MapMode {
    /// True for modes that may change the mapping
    pub fn allocates(self) -> bool {
        !matches!(self, MapMode::Read)
    }
}

/// Result of a snapshot address lookup or allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOutcome {
    /// Physical address of the first block, if mapped
    pub physical: Option<BlockNr>,
    /// Number of blocks mapped (or moved, for `MapMode::Move`)
    pub count: u32,
    /// True if this call created the mapping
    pub allocated: bool,
}

impl MapOutcome {
    /// Lookup miss
    pub fn unmapped() -> Self {
        Self {
            physical: None,
            count: 0,
            allocated: false,
        }
    }

    /// Existing mapping found
    pub fn found(physical: BlockNr, count: u32) -> Self {
        Self {
            physical: Some(physical),
            count,
            allocated: false,
        }
    }

    /// Mapping created by this call
    pub fn created(physical: BlockNr, count: u32) -> Self {
        Self {
            physical: Some(physical),
            count,
            allocated: true,
        }
    }

    /// True if any block is mapped
    pub fn is_mapped(&self) -> bool {
        self.physical.is_some()
    }
}
