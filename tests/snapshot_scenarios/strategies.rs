//! The configurable strategies change bookkeeping, never snapshot contents

use crate::common::*;
use cowsnap::{BitmapCacheMode, CowCacheMode, FormatOptions, SnapshotListMode, VolumeConfig};

#[test]
fn single_slot_is_freed_by_removal() {
    let v = volume(VolumeConfig::for_testing().with_snapshot_list(SnapshotListMode::SingleSlot));
    snapshot(&v, S1);

    let err = v.lock_snapshots().create(S2).unwrap_err();
    assert_eq!(err.code().errno(), 22);

    {
        let mut ctl = v.lock_snapshots();
        ctl.delete(S1).unwrap();
        ctl.update(true, false).unwrap();
    }
    assert!(listed(&v).is_empty());

    snapshot(&v, S2);
    assert_eq!(listed(&v), vec![S2]);
}

#[test]
fn list_mode_waits_for_head_to_be_taken() {
    let v = volume(VolumeConfig::for_testing());
    let mut ctl = v.lock_snapshots();
    ctl.create(S1).unwrap();
    assert_eq!(ctl.create(S2).unwrap_err().code().errno(), 22);

    ctl.take(S1).unwrap();
    ctl.create(S2).unwrap();
    ctl.take(S2).unwrap();
    drop(ctl);
    assert_eq!(listed(&v), vec![S2, S1]);
}

/// Same workload under one strategy combination; returns what the snapshot
/// reads for each file block and the copy count
fn run_workload(bitmaps: BitmapCacheMode, cow_cache: CowCacheMode) -> (Vec<Vec<u8>>, u64) {
    let v = volume_with(
        FormatOptions::new(BLOCK_SIZE, 9000),
        VolumeConfig::for_testing()
            .with_bitmap_cache(bitmaps)
            .with_cow_cache(cow_cache),
    );
    let owner = v.create_file(FILE, false).unwrap();
    let blocks = [10, 11, 8200, 8201];
    for (i, &b) in blocks.iter().enumerate() {
        place(&v, &owner, i as u64, b, i as u8 + 1);
    }
    snapshot(&v, S1);

    let mut h = v.start(8).unwrap();
    for round in 0..2u8 {
        for &b in &blocks {
            v.write_block(&mut h, Some(&owner), b, &fill(50 + round)).unwrap();
        }
    }
    v.stop(h).unwrap();
    v.journal().commit();
    overwrite(&v, Some(&owner), 10, 60);

    {
        let mut ctl = v.lock_snapshots();
        ctl.enable(S1).unwrap();
    }
    let reader = v.open_snapshot(S1).unwrap();
    let image = blocks
        .iter()
        .map(|&b| reader.read_block(b).unwrap().as_slice().to_vec())
        .collect();
    (image, v.metrics().copied)
}

#[test]
fn every_strategy_combination_preserves_the_same_image() {
    let expected: Vec<Vec<u8>> = (1..=4).map(fill).collect();
    for bitmaps in [BitmapCacheMode::Cached, BitmapCacheMode::Uncached] {
        for cow_cache in [CowCacheMode::Tid, CowCacheMode::Disabled] {
            let (image, copied) = run_workload(bitmaps, cow_cache);
            assert_eq!(image, expected, "{:?}/{:?}", bitmaps, cow_cache);
            assert_eq!(copied, 4, "{:?}/{:?}", bitmaps, cow_cache);
        }
    }
}

#[test]
fn disabled_cow_cache_answers_from_the_snapshot_map() {
    let v = volume(VolumeConfig::for_testing().with_cow_cache(CowCacheMode::Disabled));
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 10, 1);
    snapshot(&v, S1);

    let mut h = v.start(1).unwrap();
    for byte in 2..5 {
        v.write_block(&mut h, Some(&owner), 10, &fill(byte)).unwrap();
    }
    v.stop(h).unwrap();

    let m = v.metrics();
    assert_eq!(m.copied, 1);
    assert_eq!(m.ok_jh, 0);
    assert_eq!(m.ok_mapped, 2);
}
