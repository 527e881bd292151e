//! Per-transaction COW records
//!
//! Records "block B was already handled in transaction T". A record is only
//! valid for the transaction that wrote it: once the journal commits, the
//! running tid changes and every older record stops matching.

use cowsnap_core::{BlockNr, Tid};
use dashmap::DashMap;

/// Records dropped once the table grows past this size
const PRUNE_THRESHOLD: usize = 16 * 1024;

/// Strategy for remembering handled blocks within one transaction
pub trait TransactionCowCacheStrategy: Send + Sync {
    /// True if `block` was handled in transaction `tid`
    fn contains(&self, tid: Tid, block: BlockNr) -> bool;

    /// Remember that `block` was handled in transaction `tid`
    fn insert(&self, tid: Tid, block: BlockNr);

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

/// Tags each block with the tid of the last transaction that handled it
#[derive(Debug, Default)]
pub struct TidTaggedCowCache {
    tags: DashMap<BlockNr, Tid>,
}

impl TidTaggedCowCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tags held, stale or not
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// True if no tags are held
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl TransactionCowCacheStrategy for TidTaggedCowCache {
    fn contains(&self, tid: Tid, block: BlockNr) -> bool {
        self.tags.get(&block).map(|t| *t == tid).unwrap_or(false)
    }

    fn insert(&self, tid: Tid, block: BlockNr) {
        if self.tags.len() >= PRUNE_THRESHOLD {
            self.tags.retain(|_, t| *t == tid);
        }
        self.tags.insert(block, tid);
    }

    fn name(&self) -> &'static str {
        "tid"
    }
}

/// Remembers nothing; every check goes to the bitmap and snapshot map
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCowCache;

impl TransactionCowCacheStrategy for NoCowCache {
    fn contains(&self, _tid: Tid, _block: BlockNr) -> bool {
        false
    }

    fn insert(&self, _tid: Tid, _block: BlockNr) {}

    fn name(&self) -> &'static str {
        "disabled"
    }
}
