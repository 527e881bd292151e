//! Journal credit budgets and snapshot layout constants
//!
//! ## Credits
//!
//! A transaction handle carries two budgets. Buffer credits are consumed for
//! every block the transaction dirties, including blocks dirtied by backup
//! copies. User credits count only the blocks the caller itself modifies.
//! Every user credit is backed by enough buffer credits to pay for the
//! worst-case COW work it can trigger:
//!
//! ```text
//! trans_blocks(n)       = n * (WRITE_CREDITS + COW_CREDITS) + SNAPSHOT_CREDITS
//! start_trans_blocks(n) = n * (WRITE_CREDITS + COW_CREDITS) + 2 * SNAPSHOT_CREDITS
//! ```
//!
//! Both return `None` when the result does not fit in a `u32`; no handle can
//! ever hold that many credits.

use crate::types::{BlockNr, SnapBlock};

/// Credits for modifying one block
pub const WRITE_CREDITS: u32 = 1;

/// Credits for allocating one block (bitmap + group descriptor + superblock)
pub const ALLOC_CREDITS: u32 = 3;

/// Credits for synthesizing one COW bitmap
///
/// Snapshot inode, three indirect levels, allocation, and the bitmap block.
pub const COW_BITMAP_CREDITS: u32 = 3 * WRITE_CREDITS + ALLOC_CREDITS + 3;

/// Credits for one backup copy
pub const COW_BLOCK_CREDITS: u32 = 2 * WRITE_CREDITS + ALLOC_CREDITS + 3;

/// Worst case credits a single user-modified block can trigger
pub const COW_CREDITS: u32 = COW_BITMAP_CREDITS + COW_BLOCK_CREDITS;

/// Credits for snapshot list bookkeeping (inode, superblock, list neighbour)
pub const SNAPSHOT_CREDITS: u32 = 3;

/// Minimum size of a transaction extension
pub const MAX_TRANS_DATA: u32 = 64;

/// Default upper bound of buffer credits a single handle may hold
pub const DEFAULT_MAX_TRANSACTION_CREDITS: u32 = 8192;

const fn credits_for(n: u32, overhead: u32) -> Option<u32> {
    match n.checked_mul(WRITE_CREDITS + COW_CREDITS) {
        Some(per_block) => per_block.checked_add(overhead),
        None => None,
    }
}

/// Buffer credits needed to modify `n` blocks with COW
pub const fn trans_blocks(n: u32) -> Option<u32> {
    credits_for(n, SNAPSHOT_CREDITS)
}

/// Buffer credits granted when starting a handle for `n` blocks
pub const fn start_trans_blocks(n: u32) -> Option<u32> {
    credits_for(n, 2 * SNAPSHOT_CREDITS)
}

// ============================================================================
// Layout
// ============================================================================

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Largest supported block size
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Location of the filesystem superblock
pub const SUPERBLOCK_NR: BlockNr = 0;

/// Size of the reserved snapshot metadata region (addresses `-N..0`)
pub const SNAPSHOT_META_BLOCKS: i64 = 16;

/// Snapshot address of the snapshot's own record
pub const SNAPSHOT_RECORD_BLOCK: SnapBlock = -1;
