//! Delete, deferred removal and reaping

use crate::common::*;
use cowsnap::{RemoveOutcome, SnapshotFlags, VolumeConfig};

#[test]
fn older_deleted_snapshot_waits_for_newer_enabled_one() {
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
    let f1 = flags(&v, S1);
    assert!(f1.contains(SnapshotFlags::DELETED | SnapshotFlags::INUSE));
    assert!(!f1.contains(SnapshotFlags::ENABLED));

    {
        let mut ctl = v.lock_snapshots();
        ctl.disable(S2).unwrap();
        ctl.delete(S2).unwrap();
        ctl.update(true, false).unwrap();
    }
    assert!(listed(&v).is_empty());
    assert!(v.active_snapshot().is_none());
    assert_eq!(v.superblock().snapshot_list_head, None);

    // both keep a tombstone and cannot be reused as snapshots
    assert_eq!(flags(&v, S1), SnapshotFlags::DELETED);
    assert_eq!(flags(&v, S2), SnapshotFlags::DELETED);
    assert!(v.lock_snapshots().create(S1).is_err());
}

#[test]
fn remove_defers_while_flags_block_it() {
    let v = volume(VolumeConfig::for_testing());
    snapshot(&v, S1);
    let mut ctl = v.lock_snapshots();

    // active
    assert_eq!(ctl.remove(S1).unwrap(), RemoveOutcome::Deferred);

    drop(ctl);
    snapshot(&v, S2);
    let mut ctl = v.lock_snapshots();
    // enabled
    ctl.enable(S1).unwrap();
    assert_eq!(ctl.remove(S1).unwrap(), RemoveOutcome::Deferred);
    ctl.disable(S1).unwrap();

    // in use by the enabled S2
    ctl.enable(S2).unwrap();
    ctl.update(false, false).unwrap();
    assert_eq!(ctl.remove(S1).unwrap(), RemoveOutcome::Deferred);

    ctl.disable(S2).unwrap();
    ctl.update(false, false).unwrap();
    assert_eq!(ctl.remove(S1).unwrap(), RemoveOutcome::Removed);
    drop(ctl);
    assert_eq!(listed(&v), vec![S2]);
    // never deleted: nothing retained, file is empty again
    assert_eq!(v.store().file_info(S1).unwrap().mapped_blocks, 0);
}

#[test]
fn failed_take_is_reaped_by_update() {
    let v = volume(VolumeConfig::for_testing());
    snapshot(&v, S1);
    v.lock_snapshots().create(S2).unwrap();
    v.store().clear_mapping(S2, 0).unwrap();

    let mut ctl = v.lock_snapshots();
    assert!(ctl.take(S2).unwrap_err().is_fatal());
    assert_eq!(v.active_snapshot().map(|a| a.ino), Some(S1));
    ctl.update(false, false).unwrap();
    drop(ctl);
    assert_eq!(listed(&v), vec![S1]);
}
