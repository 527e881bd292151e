//! Snapshot lifecycle
//!
//! Snapshots live on a list ordered newest first. The head is the most
//! recently created snapshot; the active snapshot is the most recently taken
//! one and is either the head or, after a failed take, the entry right
//! behind the failed ones.
//!
//! ```text
//! NONE --create--> LIST --take--> LIST|ACTIVE --(newer take)--> LIST
//!                   |                                            |
//!                   +--enable/disable (any time on the list)-----+
//!                   +--delete (disabled only)--> DELETED --remove--> gone
//! ```
//!
//! Every transition goes through [`SnapshotControl`], obtained from
//! [`crate::Volume::lock_snapshots`].

mod control;

pub use control::{RemoveOutcome, SnapshotControl};

use chrono::{DateTime, Utc};
use cowsnap_core::{Error, InodeNo, Result, SnapshotFlags, SnapshotId, SnapshotRecord, Superblock};
use smallvec::SmallVec;

/// In-memory state of one listed snapshot
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SnapshotEntry {
    pub(crate) ino: InodeNo,
    pub(crate) id: SnapshotId,
    pub(crate) flags: SnapshotFlags,
    pub(crate) size_blocks: u64,
    pub(crate) created_at: DateTime<Utc>,
}

impl SnapshotEntry {
    pub(crate) fn from_record(ino: InodeNo, record: &SnapshotRecord) -> Self {
        SnapshotEntry {
            ino,
            id: record.id,
            flags: record.flags(),
            size_blocks: record.size_blocks,
            created_at: record.created_at,
        }
    }

    pub(crate) fn to_record(&self, next: Option<InodeNo>) -> SnapshotRecord {
        SnapshotRecord {
            id: self.id,
            size_blocks: self.size_blocks,
            flags: self.flags.persistent().bits(),
            next,
            created_at: self.created_at,
        }
    }

    pub(crate) fn info(&self, readers: u32) -> SnapshotInfo {
        let mut flags = self.flags;
        flags.set(SnapshotFlags::OPEN, readers > 0);
        SnapshotInfo {
            ino: self.ino,
            id: self.id,
            flags,
            size_blocks: if flags.contains(SnapshotFlags::ENABLED) {
                self.size_blocks
            } else {
                0
            },
            created_at: self.created_at,
            readers,
        }
    }
}

/// Public view of a listed snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Snapshot file
    pub ino: InodeNo,
    /// Generation id
    pub id: SnapshotId,
    /// Current status, `OPEN` included
    pub flags: SnapshotFlags,
    /// Logical size in blocks; zero while not enabled
    pub size_blocks: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Open readers
    pub readers: u32,
}

/// The snapshot list, newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SnapshotList {
    entries: Vec<SnapshotEntry>,
}

impl SnapshotList {
    pub(crate) fn from_entries(entries: Vec<SnapshotEntry>) -> Self {
        SnapshotList { entries }
    }

    pub(crate) fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &SnapshotEntry> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn head(&self) -> Option<&SnapshotEntry> {
        self.entries.first()
    }

    pub(crate) fn position(&self, ino: InodeNo) -> Option<usize> {
        self.entries.iter().position(|e| e.ino == ino)
    }

    pub(crate) fn get(&self, ino: InodeNo) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.ino == ino)
    }

    pub(crate) fn get_mut(&mut self, ino: InodeNo) -> Option<&mut SnapshotEntry> {
        self.entries.iter_mut().find(|e| e.ino == ino)
    }

    pub(crate) fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut SnapshotEntry> {
        self.entries.iter_mut()
    }

    /// Index of the entry carrying `ACTIVE`
    pub(crate) fn active_position(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.flags.contains(SnapshotFlags::ACTIVE))
    }

    /// Inode of the entry older than the one at `idx`
    pub(crate) fn older_than(&self, idx: usize) -> Option<InodeNo> {
        self.entries.get(idx + 1).map(|e| e.ino)
    }

    pub(crate) fn push_head(&mut self, entry: SnapshotEntry) {
        self.entries.insert(0, entry);
    }

    pub(crate) fn remove(&mut self, idx: usize) -> SnapshotEntry {
        self.entries.remove(idx)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Snapshots a read of the entry at `idx` resolves through, from that
    /// entry towards newer ones, ending at the active snapshot
    ///
    /// `None` if the entry is newer than the active snapshot (never taken).
    pub(crate) fn chain_from(&self, idx: usize) -> Option<SmallVec<[InodeNo; 8]>> {
        let active = self.active_position()?;
        if idx < active || idx >= self.entries.len() {
            return None;
        }
        Some((active..=idx).rev().map(|i| self.entries[i].ino).collect())
    }
}

/// Lifecycle state guarded by the volume's snapshot lock
#[derive(Debug)]
pub(crate) struct SnapshotState {
    pub(crate) list: SnapshotList,
    pub(crate) superblock: Superblock,
}

impl SnapshotState {
    pub(crate) fn new(superblock: Superblock) -> Self {
        SnapshotState {
            list: SnapshotList::default(),
            superblock,
        }
    }
}

/// Rule deciding when a new snapshot may be created
pub trait SnapshotListStrategy: Send + Sync {
    /// Fail if a snapshot cannot be created next to the listed ones
    ///
    /// `heads` holds the listed snapshots newest first with their flags.
    fn check_create(&self, heads: &[(InodeNo, SnapshotFlags)], active: Option<InodeNo>) -> Result<()>;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

/// Many snapshots; a new one may only follow a taken head
#[derive(Debug, Default, Clone, Copy)]
pub struct ListStrategy;

impl SnapshotListStrategy for ListStrategy {
    fn check_create(&self, heads: &[(InodeNo, SnapshotFlags)], active: Option<InodeNo>) -> Result<()> {
        match heads.first() {
            Some((head, _)) if Some(*head) != active => Err(Error::invalid_argument(format!(
                "snapshot {} was created but not taken",
                head
            ))),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "list"
    }
}

/// At most one snapshot at a time
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleSlotStrategy;

impl SnapshotListStrategy for SingleSlotStrategy {
    fn check_create(&self, heads: &[(InodeNo, SnapshotFlags)], active: Option<InodeNo>) -> Result<()> {
        if let Some(ino) = active.or_else(|| heads.first().map(|(ino, _)| *ino)) {
            return Err(Error::invalid_argument(format!(
                "snapshot {} already occupies the only slot",
                ino
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "single_slot"
    }
}
