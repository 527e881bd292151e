//! Take a snapshot, overwrite, read both views

use crate::common::*;
use cowsnap::{FormatOptions, SnapshotFlags, SnapshotId, VolumeConfig};

#[test]
fn overwrite_after_take_is_preserved() {
    let v = volume_with(
        FormatOptions::new(BLOCK_SIZE, 100).with_last_snapshot_id(SnapshotId(6)),
        VolumeConfig::for_testing(),
    );
    let owner = v.create_file(FILE, false).unwrap();
    for (logical, block) in [10u64, 20, 30].into_iter().enumerate() {
        place(&v, &owner, logical as u64, block, block as u8);
    }

    let id = snapshot(&v, S1);
    assert_eq!(id, SnapshotId(7));
    assert_eq!(v.store().lookup(S1, 10).unwrap(), None);

    overwrite(&v, Some(&owner), 10, 0xAA);

    // copied into the snapshot's own address space
    let copy = v.store().lookup(S1, 10).unwrap().unwrap();
    assert_ne!(copy, 10);
    assert_eq!(v.store().read_block(copy).unwrap().as_slice(), fill(10).as_slice());

    v.lock_snapshots().enable(S1).unwrap();
    let image = v.open_snapshot(S1).unwrap();
    assert_eq!(image.read_block(10).unwrap().as_slice(), fill(10).as_slice());
    assert_eq!(v.store().read_block(10).unwrap().as_slice(), fill(0xAA).as_slice());

    // untouched blocks read through to the live volume
    assert_eq!(image.read_block(20).unwrap().as_slice(), fill(20).as_slice());
    assert_eq!(v.store().lookup(S1, 20).unwrap(), None);
    assert!(flags(&v, S1).contains(SnapshotFlags::OPEN));
}

#[test]
fn data_rewrite_moves_instead_of_copying() {
    let v = volume(VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 30, 3);
    snapshot(&v, S1);

    let mut h = v.start(1).unwrap();
    let new = v.write_file_block(&mut h, &owner, 0, &fill(4)).unwrap();
    v.stop(h).unwrap();

    assert_ne!(new, 30);
    assert_eq!(v.store().lookup(S1, 30).unwrap(), Some(30));
    assert_eq!(v.metrics().moved, 1);
    assert_eq!(v.metrics().copied, 0);
    // quota moves with the block
    assert_eq!(v.store().file_info(FILE).unwrap().charged_blocks, 1);
    assert_eq!(v.store().file_info(S1).unwrap().charged_blocks, 4);
}

#[test]
fn snapshot_dump_lists_blocks() {
    let v = volume(VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 10, 1);
    snapshot(&v, S1);
    overwrite(&v, Some(&owner), 10, 2);

    // record, superblock copy, bitmap copy, one backup
    assert_eq!(v.dump_snapshot(S1).unwrap(), 4);
    v.lock_snapshots().enable(S1).unwrap();
    let image = v.open_snapshot(S1).unwrap();
    let blocks: Vec<_> = image.blocks().unwrap().map(|(addr, _)| addr).collect();
    assert_eq!(blocks, vec![0, 1, 10]);
}
