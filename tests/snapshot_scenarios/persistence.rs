//! State that must survive an unmount, and config loaded from disk

use crate::common::*;
use cowsnap::{
    BitmapCacheMode, SnapshotFlags, SnapshotListMode, Volume, VolumeConfig,
};
use tempfile::TempDir;

#[test]
fn deferred_deletion_survives_remount() {
    let v = volume(VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 10, 1);
    snapshot(&v, S1);
    overwrite(&v, Some(&owner), 10, 2);
    snapshot(&v, S2);
    {
        let mut ctl = v.lock_snapshots();
        ctl.enable(S2).unwrap();
        ctl.delete(S1).unwrap();
        ctl.update(true, false).unwrap();
    }
    assert_eq!(listed(&v), vec![S2, S1]);

    let store = v.unmount().unwrap();
    let v = Volume::mount(store, VolumeConfig::for_testing()).unwrap();
    assert_eq!(listed(&v), vec![S2, S1]);
    assert_eq!(v.active_snapshot().map(|a| a.ino), Some(S2));
    assert_eq!(
        flags(&v, S1),
        SnapshotFlags::LIST | SnapshotFlags::DELETED | SnapshotFlags::INUSE
    );

    {
        let mut ctl = v.lock_snapshots();
        ctl.disable(S2).unwrap();
        ctl.update(true, false).unwrap();
    }
    assert_eq!(listed(&v), vec![S2]);
    assert_eq!(v.superblock().snapshot_list_head, Some(S2));
}

#[test]
fn moved_blocks_stay_readable_after_remount() {
    let v = volume(VolumeConfig::for_testing());
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 10, 1);
    snapshot(&v, S1);

    let mut h = v.start(1).unwrap();
    let fresh = v.write_file_block(&mut h, &owner, 0, &fill(2)).unwrap();
    v.stop(h).unwrap();
    assert_ne!(fresh, 10);

    let store = v.unmount().unwrap();
    let v = Volume::mount(store, VolumeConfig::for_testing()).unwrap();
    v.lock_snapshots().enable(S1).unwrap();
    let reader = v.open_snapshot(S1).unwrap();
    assert_eq!(reader.read_block(10).unwrap().as_slice(), fill(1).as_slice());
    assert_eq!(v.file_block(FILE, 0).unwrap(), Some(fresh));
}

#[test]
fn config_file_selects_strategies() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cowsnap.toml");
    VolumeConfig::for_testing()
        .with_snapshot_list(SnapshotListMode::SingleSlot)
        .with_bitmap_cache(BitmapCacheMode::Uncached)
        .write_to_file(&path)
        .unwrap();

    let config = VolumeConfig::from_file(&path).unwrap();
    assert_eq!(config.snapshot_list, SnapshotListMode::SingleSlot);
    assert_eq!(config.bitmap_cache, BitmapCacheMode::Uncached);

    let v = volume(config);
    snapshot(&v, S1);
    assert_eq!(v.lock_snapshots().create(S2).unwrap_err().code().errno(), 22);
}

#[test]
fn default_config_file_parses_to_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cowsnap.toml");
    VolumeConfig::write_default_if_missing(&path).unwrap();
    assert_eq!(VolumeConfig::from_file(&path).unwrap(), VolumeConfig::default());

    std::fs::write(&path, "bitmap_cache = \"sometimes\"\n").unwrap();
    let err = VolumeConfig::from_file(&path).unwrap_err();
    assert_eq!(err.code().errno(), 22);
}
