//! Persisted records
//!
//! The superblock lives at block 0 of the volume. Each snapshot keeps its own
//! record inside its reserved metadata region. The snapshot list is a chain
//! of `next` links starting at `Superblock::snapshot_list_head` (newest) and
//! ending at the oldest snapshot.

use crate::flags::SnapshotFlags;
use crate::types::{InodeNo, SnapshotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Filesystem-global state relevant to snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Superblock {
    /// Volume identity
    pub uuid: Uuid,
    /// Block size in bytes
    pub block_size: u32,
    /// Total number of blocks
    pub blocks_count: u64,
    /// Snapshot feature flag; snapshot fields are ignored while clear
    pub has_snapshot: bool,
    /// Set on superblock copies stored inside a snapshot image
    pub is_snapshot: bool,
    /// Last snapshot id handed out
    pub last_snapshot_id: SnapshotId,
    /// Inode of the active snapshot
    pub active_snapshot: Option<InodeNo>,
    /// Inode of the newest listed snapshot
    pub snapshot_list_head: Option<InodeNo>,
}

impl Superblock {
    /// Fresh superblock for a newly formatted volume
    pub fn new(block_size: u32, blocks_count: u64, last_snapshot_id: SnapshotId) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            block_size,
            blocks_count,
            has_snapshot: false,
            is_snapshot: false,
            last_snapshot_id,
            active_snapshot: None,
            snapshot_list_head: None,
        }
    }

    /// Copy of this superblock as stored inside a snapshot image
    ///
    /// A snapshot image is a read-only filesystem without snapshots of its own.
    pub fn snapshot_image(&self) -> Superblock {
        Superblock {
            has_snapshot: false,
            is_snapshot: true,
            active_snapshot: None,
            snapshot_list_head: None,
            ..self.clone()
        }
    }
}

/// Per-snapshot persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Generation id
    pub id: SnapshotId,
    /// Filesystem size at creation, in blocks
    pub size_blocks: u64,
    /// Persistent flag bits
    pub flags: u32,
    /// Next-older snapshot on the list
    pub next: Option<InodeNo>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Decoded persistent flags
    pub fn flags(&self) -> SnapshotFlags {
        SnapshotFlags::from_persisted(self.flags)
    }
}
