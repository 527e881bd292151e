//! Snapshot status flags

use bitflags::bitflags;

bitflags! {
    /// Status bits of a snapshot
    ///
    /// `LIST`, `ENABLED` and `DELETED` are persisted in the snapshot record.
    /// `ACTIVE`, `INUSE` and `OPEN` are recomputed at runtime and never stored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SnapshotFlags: u32 {
        /// On the snapshot chain
        const LIST = 1 << 0;
        /// Currently protecting live blocks
        const ACTIVE = 1 << 1;
        /// Readable
        const ENABLED = 1 << 2;
        /// Pending removal; never cleared once set
        const DELETED = 1 << 3;
        /// Still depended upon by a newer enabled snapshot
        const INUSE = 1 << 4;
        /// Held open by at least one reader
        const OPEN = 1 << 5;
    }
}

impl SnapshotFlags {
    /// Bits stored on disk
    pub const PERSISTENT: SnapshotFlags = SnapshotFlags::LIST
        .union(SnapshotFlags::ENABLED)
        .union(SnapshotFlags::DELETED);

    /// Bits recomputed at runtime
    pub const DYNAMIC: SnapshotFlags = SnapshotFlags::ACTIVE
        .union(SnapshotFlags::INUSE)
        .union(SnapshotFlags::OPEN);

    /// Only the bits that belong on disk
    pub fn persistent(self) -> SnapshotFlags {
        self & Self::PERSISTENT
    }

    /// Decode persisted bits, dropping anything that is not persistent
    pub fn from_persisted(bits: u32) -> SnapshotFlags {
        SnapshotFlags::from_bits_truncate(bits).persistent()
    }
}
