//! Properties that hold for every snapshot

use crate::common::*;
use cowsnap::{BitmapCacheMode, Error, FormatOptions, VolumeConfig};

#[test]
fn repeated_access_in_one_transaction_copies_once() {
    let v = volume(VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 10, 1);
    snapshot(&v, S1);

    let mut h = v.start(1).unwrap();
    v.get_write_access(&mut h, Some(&owner), 10).unwrap();
    v.get_write_access(&mut h, Some(&owner), 10).unwrap();
    v.stop(h).unwrap();

    let m = v.metrics();
    assert_eq!(m.copied, 1);
    assert_eq!(m.ok_jh, 1);
}

#[test]
fn active_snapshot_blocks_cannot_be_modified() {
    let v = volume(VolumeConfig::for_testing());
    snapshot(&v, S1);
    let snap = v.owner(S1).unwrap();
    let record = v.store().lookup(S1, -1).unwrap().unwrap();

    let mut h = v.start(1).unwrap();
    let err = v.get_write_access(&mut h, Some(&snap), record).unwrap_err();
    assert_eq!(err.code().errno(), 1);
    let err = v.free_file_block(&mut h, &snap, 0).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(!h.is_aborted());
    v.stop(h).unwrap();
}

#[test]
fn blocks_allocated_after_take_are_not_backed_up() {
    // group 1 is big enough to need its own COW bitmap
    let v = volume_with(FormatOptions::new(BLOCK_SIZE, 9000), VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 8200, 1);
    snapshot(&v, S1);

    // the group 1 COW bitmap is built by the allocation itself, before the
    // new block is marked in use
    let mut h = v.start(3).unwrap();
    let fresh = v.allocate_file_block(&mut h, &owner, 1, Some(8300)).unwrap();
    v.write_block(&mut h, Some(&owner), fresh, &fill(5)).unwrap();
    v.write_block(&mut h, Some(&owner), 8200, &fill(6)).unwrap();
    v.stop(h).unwrap();

    assert_eq!(v.store().lookup(S1, fresh as i64).unwrap(), None);
    assert!(v.store().lookup(S1, 8200).unwrap().is_some());
    assert_eq!(v.metrics().copied, 1);
}

fn bitmap_built_once_per_epoch(mode: BitmapCacheMode) {
    let v = volume_with(
        FormatOptions::new(BLOCK_SIZE, 20_000),
        VolumeConfig::for_testing().with_bitmap_cache(mode),
    );
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 8200, 1);
    place(&v, &owner, 1, 8201, 1);
    place(&v, &owner, 2, 16_400, 1);

    snapshot(&v, S1);
    for _ in 0..3 {
        for b in [8200, 8201, 16_400] {
            overwrite(&v, Some(&owner), b, 2);
            v.journal().commit();
        }
    }
    // groups 1 and 2; group 0 was copied at take
    assert_eq!(v.cow().bitmap_builds(), 2);

    snapshot(&v, S2);
    assert_eq!(v.cow().bitmap_builds(), 0);
    overwrite(&v, Some(&owner), 8200, 3);
    assert_eq!(v.cow().bitmap_builds(), 1);
    assert_eq!(v.metrics().bitmaps, 3);
}

#[test]
fn bitmap_built_once_per_epoch_cached() {
    bitmap_built_once_per_epoch(BitmapCacheMode::Cached);
}

#[test]
fn bitmap_built_once_per_epoch_uncached() {
    bitmap_built_once_per_epoch(BitmapCacheMode::Uncached);
}

#[test]
fn credit_exhaustion_fails_access_without_aborting() {
    let v = volume(VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 10, 1);
    snapshot(&v, S1);

    let mut h = v.start(1).unwrap();
    let credits = h.buffer_credits();
    h.consume(credits - 2).unwrap();
    let err = v.write_block(&mut h, Some(&owner), 10, &fill(2)).unwrap_err();
    assert!(matches!(err, Error::InsufficientCredits { .. }));
    assert!(!h.is_cowing());
    assert!(!h.is_aborted());
    assert_eq!(v.store().read_block(10).unwrap().as_slice(), fill(1).as_slice());

    assert!(v.journal().extend(&mut h, 1).unwrap());
    v.write_block(&mut h, Some(&owner), 10, &fill(2)).unwrap();
    v.stop(h).unwrap();
    assert_eq!(v.metrics().copied, 1);
}

#[test]
fn lifecycle_is_refused_on_read_only_volume() {
    let v = volume(VolumeConfig::for_testing().with_read_only(true));
    let mut ctl = v.lock_snapshots();
    assert!(matches!(ctl.create(S1), Err(Error::PermissionDenied(_))));
    assert!(matches!(ctl.update(true, true), Err(Error::InvalidArgument(_))));
}
