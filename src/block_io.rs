//! Positioned sector I/O and advisory whole-file locking on the backing
//! device, the way this lineage's disk tools open a device file and poke
//! it with `ioctl`/raw-fd calls rather than going through a cursor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{DbsError, Result};
use crate::layout::SECTOR_SIZE;

/// Positioned read/write of fixed-size sectors on the backing file.
pub struct BlockDevice {
    file: File,
}

impl BlockDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn create_new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn size_sectors(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / SECTOR_SIZE)
    }

    /// Reads exactly one 512-byte sector at absolute sector address `lba`.
    pub fn read_sector(&self, lba: u64) -> Result<[u8; SECTOR_SIZE as usize]> {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        self.file.read_exact_at(&mut buf, lba * SECTOR_SIZE)?;
        Ok(buf)
    }

    /// Writes exactly one 512-byte sector at absolute sector address `lba`.
    pub fn write_sector(&self, lba: u64, data: &[u8; SECTOR_SIZE as usize]) -> Result<()> {
        self.file.write_all_at(data, lba * SECTOR_SIZE)?;
        Ok(())
    }

    /// Reads `count` consecutive sectors starting at `lba`.
    pub fn read_sectors(&self, lba: u64, count: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (count * SECTOR_SIZE) as usize];
        self.file.read_exact_at(&mut buf, lba * SECTOR_SIZE)?;
        Ok(buf)
    }

    /// Writes `data` (a whole number of sectors) starting at `lba`.
    pub fn write_sectors(&self, lba: u64, data: &[u8]) -> Result<()> {
        if data.len() as u64 % SECTOR_SIZE != 0 {
            return Err(DbsError::InvalidArgument(
                "partial sector write".into(),
            ));
        }
        self.file.write_all_at(data, lba * SECTOR_SIZE)?;
        Ok(())
    }

    /// Flushes all prior writes to stable storage. Writes issued before a
    /// `flush` are not acknowledged as durable until it returns.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Takes an advisory exclusive lock on the whole file, non-blocking.
    /// Used for the lifetime of a mutating open; fails with `Busy` if
    /// another open already holds it.
    pub fn lock_exclusive(&self) -> Result<()> {
        flock(&self.file, libc::LOCK_EX | libc::LOCK_NB)
    }

    /// Takes an advisory shared lock, used for read-only opens
    /// (`get_device_info`, `get_volume_info`, `get_snapshot_info`).
    pub fn lock_shared(&self) -> Result<()> {
        flock(&self.file, libc::LOCK_SH | libc::LOCK_NB)
    }

    pub fn unlock(&self) {
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

fn flock(file: &File, op: i32) -> Result<()> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Err(DbsError::Busy);
        }
        return Err(DbsError::Io(err));
    }
    Ok(())
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        self.unlock();
    }
}
