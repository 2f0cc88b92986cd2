//! A single-file, thinly-provisioned block store with copy-on-write
//! snapshots and clones.
//!
//! Every call here opens the device fresh, does its work, and closes it
//! again; there is no long-lived daemon or cache. `Device` and
//! `VolumeSession` in [`device`] are the lower-level handles these
//! wrappers are built from, for callers who want to batch several calls
//! under one open (and one advisory lock) instead of paying an open/close
//! per call.

pub mod allocator;
pub mod block_io;
pub mod blockmap;
pub mod catalog;
pub mod device;
pub mod error;
pub mod layout;

use std::path::Path;

pub use device::{DeviceInfo, OpenMode, SnapshotInfo, VolumeInfo};
pub use error::{is_graceful, DbsError, Result};
pub use layout::SECTOR_SIZE;

use device::Device;

/// Formats a new device file at `path`. The path must not already exist;
/// `device_size_bytes` must be a positive multiple of the sector size.
pub fn init_device<P: AsRef<Path>>(path: P, device_size_bytes: u64) -> Result<()> {
    Device::init(path, device_size_bytes)
}

/// Rebuilds the extent bitmap from the live snapshot chains. Always safe
/// to run; never required for correctness.
pub fn vacuum_device<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut dev = Device::open(path, OpenMode::ReadWrite)?;
    dev.vacuum()
}

pub fn get_device_info<P: AsRef<Path>>(path: P) -> Result<DeviceInfo> {
    let dev = Device::open(path, OpenMode::ReadOnly)?;
    Ok(dev.get_device_info())
}

pub fn get_volume_info<P: AsRef<Path>>(path: P) -> Result<Vec<VolumeInfo>> {
    let dev = Device::open(path, OpenMode::ReadOnly)?;
    Ok(dev.get_volume_info())
}

pub fn get_snapshot_info<P: AsRef<Path>>(path: P, volume_name: &str) -> Result<Vec<SnapshotInfo>> {
    let dev = Device::open(path, OpenMode::ReadOnly)?;
    dev.get_snapshot_info(volume_name)
}

pub fn create_volume<P: AsRef<Path>>(path: P, name: &str, size_bytes: u64) -> Result<bool> {
    let mut dev = Device::open(path, OpenMode::ReadWrite)?;
    dev.create_volume(name, size_bytes)
}

pub fn rename_volume<P: AsRef<Path>>(path: P, name: &str, new_name: &str) -> Result<bool> {
    let mut dev = Device::open(path, OpenMode::ReadWrite)?;
    dev.rename_volume(name, new_name)
}

pub fn delete_volume<P: AsRef<Path>>(path: P, name: &str) -> Result<bool> {
    let mut dev = Device::open(path, OpenMode::ReadWrite)?;
    dev.delete_volume(name)
}

pub fn create_snapshot<P: AsRef<Path>>(path: P, volume_name: &str) -> Result<bool> {
    let mut dev = Device::open(path, OpenMode::ReadWrite)?;
    dev.create_snapshot(volume_name)
}

pub fn delete_snapshot<P: AsRef<Path>>(path: P, snapshot_id: u64) -> Result<bool> {
    let mut dev = Device::open(path, OpenMode::ReadWrite)?;
    dev.delete_snapshot(snapshot_id)
}

pub fn clone_snapshot<P: AsRef<Path>>(
    path: P,
    new_volume_name: &str,
    snapshot_id: u64,
) -> Result<bool> {
    let mut dev = Device::open(path, OpenMode::ReadWrite)?;
    dev.clone_snapshot(new_volume_name, snapshot_id)
}

pub fn read_block<P: AsRef<Path>>(
    path: P,
    volume_name: &str,
    lbi: u64,
    out: &mut [u8; SECTOR_SIZE as usize],
) -> Result<()> {
    let dev = Device::open(path, OpenMode::ReadOnly)?;
    let session = dev.into_volume_session(volume_name)?;
    session.read_block(lbi, out)
}

pub fn write_block<P: AsRef<Path>>(
    path: P,
    volume_name: &str,
    lbi: u64,
    data: &[u8; SECTOR_SIZE as usize],
) -> Result<()> {
    let dev = Device::open(path, OpenMode::ReadWrite)?;
    let mut session = dev.into_volume_session(volume_name)?;
    session.write_block(lbi, data)
}

pub fn unmap_block<P: AsRef<Path>>(path: P, volume_name: &str, lbi: u64) -> Result<()> {
    let dev = Device::open(path, OpenMode::ReadWrite)?;
    let mut session = dev.into_volume_session(volume_name)?;
    session.unmap_block(lbi)
}

/// Opens a long-lived session over one volume's writable head, for
/// callers doing many reads/writes under a single open rather than
/// paying the open/lock/load cost per call.
pub fn open_volume<P: AsRef<Path>>(
    path: P,
    volume_name: &str,
    mode: OpenMode,
) -> Result<device::VolumeSession> {
    let dev = Device::open(path, mode)?;
    dev.into_volume_session(volume_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("dbs-test-{tag}-{}-{n}", std::process::id()))
    }

    #[test]
    fn init_then_info_roundtrip() {
        let path = temp_path("init");
        init_device(&path, 8 * 1024 * 1024).unwrap();
        let info = get_device_info(&path).unwrap();
        assert_eq!(info.volume_count, 0);
        assert!(info.total_device_extents > 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn create_volume_then_write_read() {
        let path = temp_path("rw");
        init_device(&path, 8 * 1024 * 1024).unwrap();
        assert!(create_volume(&path, "vol0", 64 * 1024).unwrap());
        assert!(!create_volume(&path, "vol0", 64 * 1024).unwrap());

        let data = [0xABu8; SECTOR_SIZE as usize];
        write_block(&path, "vol0", 3, &data).unwrap();

        let mut out = [0u8; SECTOR_SIZE as usize];
        read_block(&path, "vol0", 3, &mut out).unwrap();
        assert_eq!(out, data);

        read_block(&path, "vol0", 4, &mut out).unwrap();
        assert_eq!(out, [0u8; SECTOR_SIZE as usize]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn snapshot_then_overwrite_preserves_parent() {
        let path = temp_path("snap");
        init_device(&path, 8 * 1024 * 1024).unwrap();
        create_volume(&path, "vol0", 64 * 1024).unwrap();

        let a = [0x11u8; SECTOR_SIZE as usize];
        write_block(&path, "vol0", 0, &a).unwrap();

        let infos = get_snapshot_info(&path, "vol0").unwrap();
        let parent_id = infos[0].snapshot_id;
        assert!(create_snapshot(&path, "vol0").unwrap());

        let b = [0x22u8; SECTOR_SIZE as usize];
        write_block(&path, "vol0", 0, &b).unwrap();

        let mut out = [0u8; SECTOR_SIZE as usize];
        read_block(&path, "vol0", 0, &mut out).unwrap();
        assert_eq!(out, b);

        assert!(clone_snapshot(&path, "clone0", parent_id).unwrap());
        read_block(&path, "clone0", 0, &mut out).unwrap();
        assert_eq!(out, a);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn unmap_reads_back_zero() {
        let path = temp_path("unmap");
        init_device(&path, 8 * 1024 * 1024).unwrap();
        create_volume(&path, "vol0", 64 * 1024).unwrap();
        let data = [0x7u8; SECTOR_SIZE as usize];
        write_block(&path, "vol0", 5, &data).unwrap();
        unmap_block(&path, "vol0", 5).unwrap();
        let mut out = [0xFFu8; SECTOR_SIZE as usize];
        read_block(&path, "vol0", 5, &mut out).unwrap();
        assert_eq!(out, [0u8; SECTOR_SIZE as usize]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn out_of_range_lbi_is_invalid_argument() {
        let path = temp_path("range");
        init_device(&path, 8 * 1024 * 1024).unwrap();
        create_volume(&path, "vol0", 512).unwrap();
        let data = [0u8; SECTOR_SIZE as usize];
        let err = write_block(&path, "vol0", 1, &data).unwrap_err();
        assert!(matches!(err, DbsError::InvalidArgument(_)));
        std::fs::remove_file(&path).unwrap();
    }
}
