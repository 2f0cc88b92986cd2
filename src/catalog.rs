//! Volume and snapshot tables: fixed arrays of slots read and written as a
//! whole, the way the rest of this device's metadata is small enough to
//! page in wholesale for every operation.

use crate::block_io::BlockDevice;
use crate::error::Result;
use crate::layout::{
    Superblock, VolumeRecord, MAX_SNAPSHOTS, MAX_VOLUMES, SNAPSHOT_RECORD_SIZE,
    SnapshotRecord, VOLUME_RECORD_SIZE,
};

pub struct VolumeTable {
    pub slots: Vec<VolumeRecord>,
}

impl VolumeTable {
    pub fn load(dev: &BlockDevice, sb: &Superblock) -> Result<Self> {
        let bytes = dev.read_sectors(sb.volume_table_offset, sb.volume_table_size_sectors)?;
        let mut slots = Vec::with_capacity(MAX_VOLUMES);
        for i in 0..MAX_VOLUMES {
            let off = i * VOLUME_RECORD_SIZE as usize;
            slots.push(VolumeRecord::from_bytes(
                &bytes[off..off + VOLUME_RECORD_SIZE as usize],
            )?);
        }
        Ok(Self { slots })
    }

    pub fn store(&self, dev: &BlockDevice, sb: &Superblock) -> Result<()> {
        let mut bytes =
            vec![0u8; (sb.volume_table_size_sectors * crate::layout::SECTOR_SIZE) as usize];
        for (i, rec) in self.slots.iter().enumerate() {
            let off = i * VOLUME_RECORD_SIZE as usize;
            bytes[off..off + VOLUME_RECORD_SIZE as usize].copy_from_slice(&rec.to_bytes());
        }
        dev.write_sectors(sb.volume_table_offset, &bytes)
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|r| r.in_use && r.name == name)
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|r| !r.in_use)
    }
}

pub struct SnapshotTable {
    pub slots: Vec<SnapshotRecord>,
}

impl SnapshotTable {
    pub fn load(dev: &BlockDevice, sb: &Superblock) -> Result<Self> {
        let bytes = dev.read_sectors(sb.snapshot_table_offset, sb.snapshot_table_size_sectors)?;
        let mut slots = Vec::with_capacity(MAX_SNAPSHOTS);
        for i in 0..MAX_SNAPSHOTS {
            let off = i * SNAPSHOT_RECORD_SIZE as usize;
            slots.push(SnapshotRecord::from_bytes(
                &bytes[off..off + SNAPSHOT_RECORD_SIZE as usize],
            )?);
        }
        Ok(Self { slots })
    }

    pub fn store(&self, dev: &BlockDevice, sb: &Superblock) -> Result<()> {
        let mut bytes =
            vec![0u8; (sb.snapshot_table_size_sectors * crate::layout::SECTOR_SIZE) as usize];
        for (i, rec) in self.slots.iter().enumerate() {
            let off = i * SNAPSHOT_RECORD_SIZE as usize;
            bytes[off..off + SNAPSHOT_RECORD_SIZE as usize].copy_from_slice(&rec.to_bytes());
        }
        dev.write_sectors(sb.snapshot_table_offset, &bytes)
    }

    pub fn find_by_id(&self, id: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|r| r.in_use && r.snapshot_id == id)
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|r| !r.in_use)
    }

    /// Walks the chain starting at `head_id` (inclusive) following
    /// `parent_snapshot_id`, returning slot indices head-first. Bounded by
    /// the table size so a corrupt cycle cannot loop forever.
    pub fn chain_from(&self, head_id: u64) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        let mut cur = self.find_by_id(head_id);
        let mut hops = 0usize;
        while let Some(idx) = cur {
            out.push(idx);
            hops += 1;
            if hops > MAX_SNAPSHOTS {
                return Err(crate::error::DbsError::Corrupt(
                    "snapshot chain longer than table size, likely cyclic".into(),
                ));
            }
            cur = self.slots[idx]
                .parent_snapshot_id
                .and_then(|pid| self.find_by_id(pid));
        }
        Ok(out)
    }

    /// Like [`chain_from`](Self::chain_from), but stops right after
    /// including a node marked `is_clone_root`: a clone's reported chain
    /// covers only what that volume's own lineage created, not the
    /// borrowed ancestry it was cloned from. Used by the info-reporting
    /// calls only; block-map resolution and refcount cascades need the
    /// full, untruncated chain and keep calling `chain_from` directly.
    pub fn reporting_chain_from(&self, head_id: u64) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        let mut cur = self.find_by_id(head_id);
        let mut hops = 0usize;
        while let Some(idx) = cur {
            out.push(idx);
            hops += 1;
            if hops > MAX_SNAPSHOTS {
                return Err(crate::error::DbsError::Corrupt(
                    "snapshot chain longer than table size, likely cyclic".into(),
                ));
            }
            if self.slots[idx].is_clone_root {
                break;
            }
            cur = self.slots[idx]
                .parent_snapshot_id
                .and_then(|pid| self.find_by_id(pid));
        }
        Ok(out)
    }

    pub fn children_of(&self, id: u64) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.in_use && r.parent_snapshot_id == Some(id))
            .map(|(i, _)| i)
            .collect()
    }
}
