//! Read access to a snapshot image
//!
//! A snapshot only stores the blocks that changed after it was taken. A
//! read of block `b` resolves through the snapshot itself, then every newer
//! snapshot up to the active one, and finally the live volume. The first
//! snapshot holding a copy of `b` has the contents `b` had when the older
//! snapshot was taken.

use crate::volume::Volume;
use cowsnap_core::limits::SNAPSHOT_META_BLOCKS;
use cowsnap_core::{BlockBuf, BlockNr, Error, InodeNo, Result, SnapBlock, SnapshotId};
use tracing::trace;

/// An open, enabled snapshot
///
/// Keeps the snapshot open (`OPEN`, refusing `disable`) until dropped.
pub struct SnapshotReader<'a> {
    volume: &'a Volume,
    ino: InodeNo,
    id: SnapshotId,
    size_blocks: u64,
}

impl<'a> SnapshotReader<'a> {
    pub(crate) fn new(volume: &'a Volume, ino: InodeNo, id: SnapshotId, size_blocks: u64) -> Self {
        SnapshotReader {
            volume,
            ino,
            id,
            size_blocks,
        }
    }

    /// Snapshot file
    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// Generation id
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Size of the image in blocks
    pub fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    /// Contents of `block` as of the time the snapshot was taken
    ///
    /// # Errors
    ///
    /// `InvalidArgument` past the end of the image or once the snapshot has
    /// left the list.
    pub fn read_block(&self, block: BlockNr) -> Result<BlockBuf> {
        if block >= self.size_blocks {
            return Err(Error::invalid_argument(format!(
                "block {} beyond snapshot of {} blocks",
                block, self.size_blocks
            )));
        }

        // resolve the chain before taking the buffer lock
        let chain = {
            let state = self.volume.state().lock();
            state
                .list
                .position(self.ino)
                .and_then(|idx| state.list.chain_from(idx))
                .ok_or_else(|| {
                    Error::invalid_argument(format!("snapshot {} is no longer readable", self.id))
                })?
        };

        let store = self.volume.store();
        let _guard = self.volume.buffer_lock(block).lock();
        for ino in chain {
            if let Some(physical) = store.lookup(ino, block as SnapBlock)? {
                trace!(
                    target: "cowsnap::reader",
                    snapshot = self.ino.0,
                    block,
                    via = ino.0,
                    physical,
                    "snapshot block resolved"
                );
                return store.read_block(physical);
            }
        }
        store.read_block(block)
    }

    /// Blocks stored in this snapshot's own file, by volume address
    ///
    /// The snapshot's metadata region is not part of the image and is left
    /// out.
    ///
    /// # Errors
    ///
    /// `Corruption` for a mapping below the metadata region.
    pub fn blocks(&self) -> Result<SnapshotBlocks> {
        let mut mappings = Vec::new();
        for (addr, physical) in self.volume.store().mappings(self.ino)? {
            match u64::try_from(addr) {
                Ok(block) => mappings.push((block, physical)),
                Err(_) if addr >= -SNAPSHOT_META_BLOCKS => {}
                Err(_) => {
                    return Err(Error::Corruption(format!(
                        "snapshot {} maps invalid address {} to block {}",
                        self.id, addr, physical
                    )))
                }
            }
        }
        Ok(SnapshotBlocks {
            inner: mappings.into_iter(),
        })
    }
}

impl Drop for SnapshotReader<'_> {
    fn drop(&mut self) {
        self.volume.release_reader(self.ino);
    }
}

/// Iterator over `(volume block, physical block)` pairs held by a snapshot
pub struct SnapshotBlocks {
    inner: std::vec::IntoIter<(BlockNr, BlockNr)>,
}

impl Iterator for SnapshotBlocks {
    type Item = (BlockNr, BlockNr);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SnapshotBlocks {}
