//! Lifecycle transitions and failures leave a trail in the logs

use crate::common::*;
use cowsnap::{FormatOptions, MemBlockStore, RemoveOutcome, Volume, VolumeConfig};
use std::sync::Arc;

#[test]
fn lifecycle_transitions_are_logged() {
    let v = volume(VolumeConfig::for_testing());
    let ((), logs) = with_captured_logs(|| {
        snapshot(&v, S1);
        let mut ctl = v.lock_snapshots();
        ctl.enable(S1).unwrap();
        ctl.disable(S1).unwrap();
        ctl.delete(S1).unwrap();
        ctl.update(true, false).unwrap();
    });

    for message in [
        "snapshot created",
        "snapshot taken",
        "snapshot enabled",
        "snapshot disabled",
        "snapshot deleted",
        "active snapshot deactivated",
        "snapshot removed",
    ] {
        assert!(logs.contains(message), "missing {:?} in:\n{}", message, logs);
    }
    assert!(logs.contains("ino=21"));
}

#[test]
fn deferred_removal_is_logged() {
    let v = volume(VolumeConfig::for_testing());
    snapshot(&v, S1);
    let (outcome, logs) = with_captured_logs(|| v.lock_snapshots().remove(S1).unwrap());
    assert_eq!(outcome, RemoveOutcome::Deferred);
    assert!(logs.contains("snapshot removal deferred"));
}

#[test]
fn aborted_backup_is_logged() {
    let options = FormatOptions::new(BLOCK_SIZE, 100);
    let store = Arc::new(MemBlockStore::new(options.geometry().unwrap()));
    Volume::format(&*store, options).unwrap();
    let v = Volume::mount(store.clone(), VolumeConfig::for_testing()).unwrap();
    v.create_file(S1, false).unwrap();
    let owner = v.create_file(FILE, false).unwrap();
    place(&v, &owner, 0, 10, 1);
    snapshot(&v, S1);

    store.fail_reads(10);
    let (result, logs) = with_captured_logs(|| {
        let mut h = v.start(1).unwrap();
        let result = v.write_block(&mut h, Some(&owner), 10, &fill(2));
        assert!(h.is_aborted());
        let _ = v.stop(h);
        result
    });
    assert!(result.is_err());
    assert!(logs.contains("aborting transaction handle"));
}

#[test]
fn discarded_untaken_snapshot_is_logged() {
    let v = volume(VolumeConfig::for_testing());
    snapshot(&v, S1);
    v.lock_snapshots().create(S2).unwrap();
    let store = v.unmount().unwrap();

    let (v, logs) = with_captured_logs(|| Volume::mount(store, VolumeConfig::for_testing()).unwrap());
    assert_eq!(listed(&v), vec![S1]);
    assert!(logs.contains("removing snapshot that was never taken"));
    assert!(logs.contains("snapshot list loaded"));
}
