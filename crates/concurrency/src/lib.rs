//! Concurrency layer for cowsnap
//!
//! This crate implements the transaction side of the snapshot engine:
//! - Handle: per-operation transaction context (credits, COWing flag, stats)
//! - Journal: handle admission, credit extension, commit and freeze
//! - TransactionCowCacheStrategy: "already backed up in this transaction" records

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cow_cache;
pub mod handle;
pub mod journal;

pub use cow_cache::{NoCowCache, TidTaggedCowCache, TransactionCowCacheStrategy};
pub use handle::{CowStats, CowingHandle, Handle};
pub use journal::{FreezeGuard, Journal};
