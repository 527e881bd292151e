//! Shared helpers for the scenario suites

#![allow(dead_code)]

use cowsnap::{BlockNr, FormatOptions, InodeNo, Owner, SnapshotFlags, SnapshotId, Volume, VolumeConfig};
use std::io::Write;
use std::sync::{Arc, Mutex};

pub const FILE: InodeNo = InodeNo(12);
pub const IGNORED: InodeNo = InodeNo(13);
pub const S1: InodeNo = InodeNo(21);
pub const S2: InodeNo = InodeNo(22);
pub const S3: InodeNo = InodeNo(23);

pub const BLOCK_SIZE: usize = 1024;

/// Block-sized buffer filled with `byte`
pub fn fill(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

/// 100-block volume with snapshot files S1..S3 ready to use
pub fn volume(config: VolumeConfig) -> Volume {
    volume_with(FormatOptions::new(BLOCK_SIZE, 100), config)
}

pub fn volume_with(options: FormatOptions, config: VolumeConfig) -> Volume {
    let v = Volume::in_memory(options, config).unwrap();
    for ino in [S1, S2, S3] {
        v.create_file(ino, false).unwrap();
    }
    v
}

/// Allocate `logical` in `owner` at exactly `block` and fill it
pub fn place(v: &Volume, owner: &Owner, logical: u64, block: BlockNr, byte: u8) {
    let mut h = v.start(1).unwrap();
    let got = v.allocate_file_block(&mut h, owner, logical, Some(block)).unwrap();
    assert_eq!(got, block);
    v.write_block(&mut h, Some(owner), block, &fill(byte)).unwrap();
    v.stop(h).unwrap();
}

/// Overwrite `block` in place in its own transaction
pub fn overwrite(v: &Volume, owner: Option<&Owner>, block: BlockNr, byte: u8) {
    let mut h = v.start(1).unwrap();
    v.write_block(&mut h, owner, block, &fill(byte)).unwrap();
    v.stop(h).unwrap();
}

/// Create and take `ino`; returns its id
pub fn snapshot(v: &Volume, ino: InodeNo) -> SnapshotId {
    let mut ctl = v.lock_snapshots();
    ctl.create(ino).unwrap();
    ctl.take(ino).unwrap();
    v.active_snapshot().map(|a| a.id).unwrap()
}

pub fn flags(v: &Volume, ino: InodeNo) -> SnapshotFlags {
    v.lock_snapshots().get_flags(ino).unwrap()
}

pub fn listed(v: &Volume) -> Vec<InodeNo> {
    v.snapshots().into_iter().map(|s| s.ino).collect()
}

// ============================================================================
// Log capture
// ============================================================================

#[derive(Clone)]
struct BufMakeWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for BufMakeWriter {
    type Writer = BufWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BufWriter(Arc::clone(&self.0))
    }
}

struct BufWriter(Arc<Mutex<Vec<u8>>>);

impl Write for BufWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `f` with every event at debug level and above captured
pub fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(BufMakeWriter(Arc::clone(&buf)))
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let bytes = buf.lock().unwrap().clone();
    (result, String::from_utf8_lossy(&bytes).to_string())
}
