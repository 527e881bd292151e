//! Ignored files are never backed up

use crate::common::*;
use cowsnap::VolumeConfig;

#[test]
fn ignored_file_overwrite_makes_no_copy() {
    let v = volume(VolumeConfig::for_testing());
    let ignored = v.create_file(IGNORED, true).unwrap();
    place(&v, &ignored, 0, 40, 1);
    snapshot(&v, S1);

    overwrite(&v, Some(&ignored), 40, 2);

    assert_eq!(v.store().lookup(S1, 40).unwrap(), None);
    assert_eq!(v.metrics().copied, 0);
    assert_eq!(v.store().read_block(40).unwrap().as_slice(), fill(2).as_slice());
}

#[test]
fn ignored_file_rewrite_and_free_are_not_moved() {
    let v = volume(VolumeConfig::for_testing());
    let ignored = v.create_file(IGNORED, true).unwrap();
    place(&v, &ignored, 0, 40, 1);
    place(&v, &ignored, 1, 41, 1);
    snapshot(&v, S1);

    let mut h = v.start(2).unwrap();
    assert_eq!(v.write_file_block(&mut h, &ignored, 0, &fill(2)).unwrap(), 40);
    assert!(!v.free_file_block(&mut h, &ignored, 1).unwrap());
    v.stop(h).unwrap();

    assert_eq!(v.metrics().moved, 0);
    assert!(!v.store().is_allocated(41).unwrap());
}

#[test]
fn blocks_marked_excluded_before_take_are_not_protected() {
    let v = volume(VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 50, 1);
    v.store().set_excluded(50, 1).unwrap();
    snapshot(&v, S1);

    overwrite(&v, Some(&owner), 50, 2);
    assert_eq!(v.metrics().copied, 0);
    assert_eq!(v.metrics().ok_bitmap, 1);
}
