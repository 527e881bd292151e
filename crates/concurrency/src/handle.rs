//! Transaction handle
//!
//! A `Handle` is the per-operation context every block access carries. It is
//! owned by exactly one writer thread and passed by `&mut` through the call
//! chain, so none of its state needs synchronization.
//!
//! ## Credits
//!
//! Buffer credits pay for every distinct block the transaction touches,
//! including blocks touched by backup copies. User credits count blocks the
//! caller dirties outside of a backup. See `cowsnap_core::limits`.
//!
//! ## COWing
//!
//! While a backup is in progress the handle is "COWing": block accesses made
//! by the backup itself must not trigger further backups. The flag is only
//! set through [`Handle::enter_cow`], whose guard clears it on every exit path.

use cowsnap_core::limits::trans_blocks;
use cowsnap_core::{BlockNr, Error, Result, Tid};
use rustc_hash::FxHashMap;
use std::ops::{Deref, DerefMut};
use tracing::warn;

/// Per-handle COW counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CowStats {
    /// Blocks copied into the snapshot
    pub copied: u64,
    /// Blocks moved into the snapshot
    pub moved: u64,
    /// Checks answered by the per-transaction cache
    pub ok_jh: u64,
    /// Checks answered by a clear COW bitmap bit
    pub ok_bitmap: u64,
    /// Checks answered by an existing snapshot mapping
    pub ok_mapped: u64,
    /// COW bitmaps synthesized
    pub bitmaps: u64,
    /// Checks skipped for excluded owners
    pub excluded: u64,
}

impl CowStats {
    /// Add `other` into `self`
    pub fn merge(&mut self, other: &CowStats) {
        self.copied += other.copied;
        self.moved += other.moved;
        self.ok_jh += other.ok_jh;
        self.ok_bitmap += other.ok_bitmap;
        self.ok_mapped += other.ok_mapped;
        self.bitmaps += other.bitmaps;
        self.excluded += other.excluded;
    }
}

/// Transaction handle
#[derive(Debug)]
pub struct Handle {
    tid: Tid,
    buffer_credits: u32,
    user_credits: u32,
    base_credits: u32,
    refs: u32,
    cowing: bool,
    aborted: bool,
    stats: Option<CowStats>,
    /// Blocks accessed in this transaction; value is true once a user credit was charged
    accessed: FxHashMap<BlockNr, bool>,
}

impl Handle {
    pub(crate) fn new(tid: Tid, buffer_credits: u32, user_credits: u32, with_stats: bool) -> Self {
        Handle {
            tid,
            buffer_credits,
            user_credits,
            base_credits: user_credits,
            refs: 1,
            cowing: false,
            aborted: false,
            stats: with_stats.then(CowStats::default),
            accessed: FxHashMap::default(),
        }
    }

    /// Re-attach to a new transaction with fresh credits
    pub(crate) fn reset(&mut self, tid: Tid, buffer_credits: u32, user_credits: u32) {
        self.tid = tid;
        self.buffer_credits = buffer_credits;
        self.user_credits = user_credits;
        self.base_credits = user_credits;
        self.accessed.clear();
    }

    pub(crate) fn grant(&mut self, buffer_credits: u32, user_credits: u32) {
        self.buffer_credits += buffer_credits;
        self.user_credits += user_credits;
        self.base_credits += user_credits;
    }

    /// Id of the transaction this handle belongs to
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Remaining buffer credits
    pub fn buffer_credits(&self) -> u32 {
        self.buffer_credits
    }

    /// Remaining user credits
    pub fn user_credits(&self) -> u32 {
        self.user_credits
    }

    /// User credits requested at start plus extensions
    pub fn base_credits(&self) -> u32 {
        self.base_credits
    }

    /// Nesting depth
    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// True while a backup is in progress
    pub fn is_cowing(&self) -> bool {
        self.cowing
    }

    /// True once the handle has been aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// COW counters, if enabled
    pub fn stats(&self) -> Option<&CowStats> {
        self.stats.as_ref()
    }

    /// Apply `f` to the COW counters, if enabled
    pub fn record(&mut self, f: impl FnOnce(&mut CowStats)) {
        if let Some(stats) = self.stats.as_mut() {
            f(stats);
        }
    }

    /// True if the handle can modify `n` more blocks with worst-case COW
    pub fn has_trans_blocks(&self, n: u32) -> bool {
        trans_blocks(n).is_some_and(|needed| self.buffer_credits >= needed)
            && self.user_credits >= n
    }

    /// Fail unless at least `needed` buffer credits remain
    pub fn reserve(&self, needed: u32) -> Result<()> {
        if self.buffer_credits < needed {
            return Err(Error::InsufficientCredits {
                needed,
                available: self.buffer_credits,
            });
        }
        Ok(())
    }

    /// Consume `n` buffer credits
    pub fn consume(&mut self, n: u32) -> Result<()> {
        self.reserve(n)?;
        self.buffer_credits -= n;
        Ok(())
    }

    /// Fail if the handle was aborted
    pub fn check_active(&self) -> Result<()> {
        if self.aborted {
            Err(Error::TransactionAborted(self.tid))
        } else {
            Ok(())
        }
    }

    /// Abort the handle; every further access fails
    pub fn abort(&mut self) {
        if !self.aborted {
            warn!(target: "cowsnap::journal", tid = self.tid, "aborting transaction handle");
        }
        self.aborted = true;
    }

    /// Join `block` to the transaction, paying one buffer credit the first time
    pub fn access(&mut self, block: BlockNr) -> Result<()> {
        self.check_active()?;
        if !self.accessed.contains_key(&block) {
            self.consume(1)?;
            self.accessed.insert(block, false);
        }
        Ok(())
    }

    /// Record a modification of `block`
    ///
    /// The first modification outside of a backup uses up one user credit.
    pub fn dirty(&mut self, block: BlockNr) -> Result<()> {
        self.check_active()?;
        let cowing = self.cowing;
        let charged = self.accessed.get_mut(&block).ok_or_else(|| {
            Error::invalid_argument(format!("block {} dirtied without write access", block))
        })?;
        if !cowing && !*charged {
            *charged = true;
            if self.user_credits == 0 {
                warn!(
                    target: "cowsnap::journal",
                    tid = self.tid,
                    block,
                    "user credits exhausted"
                );
            }
            self.user_credits = self.user_credits.saturating_sub(1);
        }
        Ok(())
    }

    fn nest(&mut self) {
        self.refs += 1;
    }

    fn unnest(&mut self) {
        self.refs = self.refs.saturating_sub(1).max(1);
    }

    /// Enter COWing mode until the returned guard is dropped
    ///
    /// The backup runs as a nested use of the handle: `refs()` is one
    /// higher while the guard lives.
    pub fn enter_cow(&mut self) -> CowingHandle<'_> {
        debug_assert!(!self.cowing, "nested COW on the same handle");
        self.cowing = true;
        self.nest();
        CowingHandle { handle: self }
    }
}

/// A handle in COWing mode
///
/// Dereferences to the underlying [`Handle`]. Dropping the guard leaves
/// COWing mode.
pub struct CowingHandle<'a> {
    handle: &'a mut Handle,
}

impl Deref for CowingHandle<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        self.handle
    }
}

impl DerefMut for CowingHandle<'_> {
    fn deref_mut(&mut self) -> &mut Handle {
        self.handle
    }
}

impl Drop for CowingHandle<'_> {
    fn drop(&mut self) {
        self.handle.cowing = false;
        self.handle.unnest();
    }
}
