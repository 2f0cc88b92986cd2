//! The open device: superblock, catalog, allocator and locking bound
//! together into the one handle every operation works through.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::allocator::ExtentAllocator;
use crate::block_io::BlockDevice;
use crate::blockmap::{self, Lookup};
use crate::catalog::{SnapshotTable, VolumeTable};
use crate::error::{DbsError, Result};
use crate::layout::{
    Layout, SnapshotRecord, Superblock, VolumeRecord, EXTENT_SECTORS, SECTOR_SIZE, VOLUME_NAME_MAX,
};

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > VOLUME_NAME_MAX || !name.is_ascii() {
        return Err(DbsError::InvalidArgument(format!(
            "volume name {name:?} must be 1-{VOLUME_NAME_MAX} ASCII bytes"
        )));
    }
    Ok(())
}

fn extent_of(phys_sector: u64, sb: &Superblock) -> u64 {
    (phys_sector - sb.extent0_offset()) / EXTENT_SECTORS
}

#[derive(Debug, Clone, Copy)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub format_version: u32,
    pub device_size_bytes: u64,
    pub total_device_extents: u64,
    pub allocated_device_extents: u64,
    pub volume_count: u32,
}

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub size_bytes: u64,
    pub created_at: u64,
    pub current_snapshot_id: u64,
    pub snapshot_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotInfo {
    pub snapshot_id: u64,
    pub parent_snapshot_id: Option<u64>,
    pub created_at: u64,
    pub refcount: u32,
}

/// An open device. Holds its own copy of every table in memory, kept
/// in sync with the backing file across every mutating call.
pub struct Device {
    dev: BlockDevice,
    sb: Superblock,
    volumes: VolumeTable,
    snapshots: SnapshotTable,
    alloc: ExtentAllocator,
    /// Live-sector count per data extent. Several logical writes from the
    /// same snapshot pack into one extent as it fills, so an extent can
    /// only be returned to the allocator once nothing in it is still
    /// referenced. Recomputed at open time by scanning every in-use
    /// snapshot's map; kept accurate afterwards incrementally.
    data_extent_refs: HashMap<u64, u32>,
}

impl Device {
    /// Formats a new, empty device at `path`, which must not already exist.
    pub fn init<P: AsRef<Path>>(path: P, device_size_bytes: u64) -> Result<()> {
        if device_size_bytes % SECTOR_SIZE != 0 {
            return Err(DbsError::InvalidArgument(
                "device size must be a whole number of sectors".into(),
            ));
        }
        let dev = BlockDevice::create_new(&path)?;
        dev.lock_exclusive()?;
        let f = std::fs::OpenOptions::new().write(true).open(path.as_ref())?;
        f.set_len(device_size_bytes)?;
        drop(f);

        let layout = Layout::compute(device_size_bytes / SECTOR_SIZE)?;
        let sb = Superblock::new(&layout);

        let zero_bitmap = vec![0u8; (layout.bitmap_size_sectors * SECTOR_SIZE) as usize];
        dev.write_sectors(layout.bitmap_offset, &zero_bitmap)?;

        let empty_vol = VolumeRecord::empty();
        let mut vol_bytes =
            vec![0u8; (layout.volume_table_size_sectors * SECTOR_SIZE) as usize];
        for chunk in vol_bytes.chunks_mut(crate::layout::VOLUME_RECORD_SIZE as usize) {
            chunk.copy_from_slice(&empty_vol.to_bytes());
        }
        dev.write_sectors(layout.volume_table_offset, &vol_bytes)?;

        let empty_snap = SnapshotRecord::empty();
        let mut snap_bytes =
            vec![0u8; (layout.snapshot_table_size_sectors * SECTOR_SIZE) as usize];
        for chunk in snap_bytes.chunks_mut(crate::layout::SNAPSHOT_RECORD_SIZE as usize) {
            chunk.copy_from_slice(&empty_snap.to_bytes());
        }
        dev.write_sectors(layout.snapshot_table_offset, &snap_bytes)?;

        dev.write_sector(0, &sb.to_bytes())?;
        dev.flush()?;
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let dev = BlockDevice::open(path)?;
        match mode {
            OpenMode::ReadOnly => dev.lock_shared()?,
            OpenMode::ReadWrite => dev.lock_exclusive()?,
        }
        let sector0 = dev.read_sector(0)?;
        let sb = Superblock::from_bytes(&sector0)?;
        let volumes = VolumeTable::load(&dev, &sb)?;
        let snapshots = SnapshotTable::load(&dev, &sb)?;
        let alloc = ExtentAllocator::load(&dev, &sb)?;

        let mut data_extent_refs = HashMap::new();
        for snap in snapshots.slots.iter().filter(|s| s.in_use) {
            for entry in blockmap::iter_live(&dev, &sb, snap.root_map_extent)? {
                if !entry.unmapped {
                    let extent = extent_of(entry.phys, &sb);
                    *data_extent_refs.entry(extent).or_insert(0) += 1;
                }
            }
        }

        Ok(Self {
            dev,
            sb,
            volumes,
            snapshots,
            alloc,
            data_extent_refs,
        })
    }

    fn persist_catalog(&mut self) -> Result<()> {
        self.sb.allocated_device_extents = self.alloc.count_used();
        self.sb.alloc_cursor = self.alloc.cursor();
        self.volumes.store(&self.dev, &self.sb)?;
        self.snapshots.store(&self.dev, &self.sb)?;
        self.dev.write_sector(0, &self.sb.to_bytes())?;
        self.dev.flush()
    }

    fn persist_bitmap(&mut self) -> Result<()> {
        self.alloc.store(&self.dev, &self.sb)?;
        self.sb.allocated_device_extents = self.alloc.count_used();
        self.sb.alloc_cursor = self.alloc.cursor();
        self.dev.write_sector(0, &self.sb.to_bytes())?;
        self.dev.flush()
    }

    fn free_extent_if_unreferenced(&mut self, extent: u64) -> bool {
        let refs = self.data_extent_refs.get(&extent).copied().unwrap_or(0);
        if refs == 0 {
            self.data_extent_refs.remove(&extent);
            self.alloc.free(extent);
            true
        } else {
            false
        }
    }

    /// Drops one live reference to the data extent backing `phys`. Returns
    /// the extent if this was its last reference and it was actually
    /// returned to the allocator, so a caller holding a `cur_data_extent`
    /// cursor into that same extent can clear it before the bitmap bit
    /// gets handed to someone else.
    fn release_data_ref(&mut self, phys: u64) -> Option<u64> {
        let extent = extent_of(phys, &self.sb);
        if let Some(r) = self.data_extent_refs.get_mut(&extent) {
            *r = r.saturating_sub(1);
            let r = *r;
            if r == 0 && self.free_extent_if_unreferenced(extent) {
                return Some(extent);
            }
        }
        None
    }

    pub fn get_device_info(&self) -> DeviceInfo {
        DeviceInfo {
            format_version: self.sb.version,
            device_size_bytes: self.sb.device_size_sectors * SECTOR_SIZE,
            total_device_extents: self.sb.total_device_extents,
            allocated_device_extents: self.sb.allocated_device_extents,
            volume_count: self.sb.volume_count,
        }
    }

    pub fn get_volume_info(&self) -> Vec<VolumeInfo> {
        self.volumes
            .slots
            .iter()
            .filter(|v| v.in_use)
            .map(|v| VolumeInfo {
                name: v.name.clone(),
                size_bytes: v.size_bytes,
                created_at: v.created_at,
                current_snapshot_id: v.current_snapshot_id,
                snapshot_count: self
                    .snapshots
                    .reporting_chain_from(v.current_snapshot_id)
                    .map(|c| c.len())
                    .unwrap_or(0),
            })
            .collect()
    }

    pub fn get_snapshot_info(&self, volume_name: &str) -> Result<Vec<SnapshotInfo>> {
        let slot = self
            .volumes
            .find_by_name(volume_name)
            .ok_or(DbsError::NotFound)?;
        let head = self.volumes.slots[slot].current_snapshot_id;
        let chain = self.snapshots.reporting_chain_from(head)?;
        Ok(chain
            .into_iter()
            .map(|idx| {
                let s = &self.snapshots.slots[idx];
                SnapshotInfo {
                    snapshot_id: s.snapshot_id,
                    parent_snapshot_id: s.parent_snapshot_id,
                    created_at: s.created_at,
                    refcount: s.refcount,
                }
            })
            .collect())
    }

    pub fn create_volume(&mut self, name: &str, size_bytes: u64) -> Result<bool> {
        check_name(name)?;
        if size_bytes == 0 || size_bytes % SECTOR_SIZE != 0 {
            return Err(DbsError::InvalidArgument(
                "volume size must be a positive whole number of sectors".into(),
            ));
        }
        if self.volumes.find_by_name(name).is_some() {
            return Ok(false);
        }
        let vslot = match self.volumes.first_free_slot() {
            Some(s) => s,
            None => return Ok(false),
        };
        let sslot = match self.snapshots.first_free_slot() {
            Some(s) => s,
            None => return Ok(false),
        };

        let snapshot_id = self.sb.next_snapshot_id;
        self.sb.next_snapshot_id += 1;
        let when = now();

        self.snapshots.slots[sslot] = SnapshotRecord {
            in_use: true,
            snapshot_id,
            parent_snapshot_id: None,
            created_at: when,
            volume_slot: Some(vslot as u32),
            refcount: 1,
            root_map_extent: None,
            cur_data_extent: None,
            cur_data_offset: 0,
            is_clone_root: false,
        };
        self.volumes.slots[vslot] = VolumeRecord {
            in_use: true,
            name: name.to_string(),
            size_bytes,
            created_at: when,
            current_snapshot_id: snapshot_id,
        };
        self.sb.volume_count += 1;
        self.persist_catalog()?;
        Ok(true)
    }

    pub fn rename_volume(&mut self, name: &str, new_name: &str) -> Result<bool> {
        check_name(new_name)?;
        let slot = match self.volumes.find_by_name(name) {
            Some(s) => s,
            None => return Ok(false),
        };
        if let Some(existing) = self.volumes.find_by_name(new_name) {
            if existing != slot {
                return Ok(false);
            }
        }
        self.volumes.slots[slot].name = new_name.to_string();
        self.persist_catalog()?;
        Ok(true)
    }

    /// Deletes a volume and every snapshot in its chain that becomes
    /// unreferenced, freeing their data and metadata extents. Refuses a
    /// volume with snapshots retained by a clone (refcount would leave
    /// an ancestor with other referents still live after the walk, which
    /// is fine and expected) but a snapshot held open by another session
    /// is the caller's concern, not this one's: `Device::open` already
    /// serializes mutating access device-wide.
    pub fn delete_volume(&mut self, name: &str) -> Result<bool> {
        let vslot = match self.volumes.find_by_name(name) {
            Some(s) => s,
            None => return Ok(false),
        };
        let head = self.volumes.slots[vslot].current_snapshot_id;
        self.volumes.slots[vslot] = VolumeRecord::empty();
        self.sb.volume_count -= 1;

        self.dec_ref_and_maybe_free(head)?;
        self.persist_catalog()?;
        self.persist_bitmap()?;
        Ok(true)
    }

    /// Decrements a snapshot's refcount by one; if that was its last
    /// reference, frees it and cascades up through its ancestors.
    fn dec_ref_and_maybe_free(&mut self, snapshot_id: u64) -> Result<()> {
        let idx = self.snapshots.find_by_id(snapshot_id).ok_or(DbsError::Corrupt(
            "reference to missing snapshot".into(),
        ))?;
        self.snapshots.slots[idx].refcount = self.snapshots.slots[idx].refcount.saturating_sub(1);
        if self.snapshots.slots[idx].refcount == 0 {
            self.free_and_cascade(snapshot_id)?;
        }
        Ok(())
    }

    /// Frees a snapshot whose refcount has already reached zero: its own
    /// data and metadata extents, then walks up through its parent,
    /// decrementing and repeating for as long as each ancestor's
    /// refcount also reaches zero.
    fn free_and_cascade(&mut self, snapshot_id: u64) -> Result<()> {
        let mut cur = Some(snapshot_id);
        while let Some(id) = cur {
            let idx = self.snapshots.find_by_id(id).ok_or(DbsError::Corrupt(
                "snapshot chain points at a missing record".into(),
            ))?;
            let parent = self.snapshots.slots[idx].parent_snapshot_id;
            let root = self.snapshots.slots[idx].root_map_extent;
            for entry in blockmap::iter_live(&self.dev, &self.sb, root)? {
                if !entry.unmapped {
                    self.release_data_ref(entry.phys);
                }
            }
            blockmap::free_chain(&self.dev, &self.sb, &mut self.alloc, root)?;
            self.snapshots.slots[idx] = SnapshotRecord::empty();
            cur = match parent {
                Some(pid) => {
                    let pidx = self.snapshots.find_by_id(pid).ok_or(DbsError::Corrupt(
                        "snapshot chain points at a missing record".into(),
                    ))?;
                    self.snapshots.slots[pidx].refcount =
                        self.snapshots.slots[pidx].refcount.saturating_sub(1);
                    if self.snapshots.slots[pidx].refcount == 0 {
                        Some(pid)
                    } else {
                        None
                    }
                }
                None => None,
            };
        }
        Ok(())
    }

    pub fn create_snapshot(&mut self, volume_name: &str) -> Result<bool> {
        let vslot = match self.volumes.find_by_name(volume_name) {
            Some(s) => s,
            None => return Ok(false),
        };
        let sslot = match self.snapshots.first_free_slot() {
            Some(s) => s,
            None => return Ok(false),
        };
        let old_head = self.volumes.slots[vslot].current_snapshot_id;
        let old_idx = self.snapshots.find_by_id(old_head).ok_or(DbsError::Corrupt(
            "volume points at a missing snapshot record".into(),
        ))?;

        let new_id = self.sb.next_snapshot_id;
        self.sb.next_snapshot_id += 1;
        self.snapshots.slots[sslot] = SnapshotRecord {
            in_use: true,
            snapshot_id: new_id,
            parent_snapshot_id: Some(old_head),
            created_at: now(),
            volume_slot: Some(vslot as u32),
            refcount: 1,
            root_map_extent: None,
            cur_data_extent: None,
            cur_data_offset: 0,
            is_clone_root: false,
        };
        // The old head stops being the writable head; its one remaining
        // reference is now the new head's parent pointer, not the volume.
        self.snapshots.slots[old_idx].volume_slot = None;
        self.volumes.slots[vslot].current_snapshot_id = new_id;
        self.persist_catalog()?;
        Ok(true)
    }

    /// Deletes a non-head snapshot, re-parenting its children and folding
    /// entries it holds that none of its children shadow into the parent,
    /// exactly as read back out by `resolve_read` afterwards.
    pub fn delete_snapshot(&mut self, snapshot_id: u64) -> Result<bool> {
        let idx = match self.snapshots.find_by_id(snapshot_id) {
            Some(i) => i,
            None => return Ok(false),
        };
        if self.snapshots.slots[idx].volume_slot.is_some() {
            // Current head of some volume: refuse gracefully.
            return Ok(false);
        }
        let parent = self.snapshots.slots[idx].parent_snapshot_id;
        let children = self.snapshots.children_of(snapshot_id);
        let own_root = self.snapshots.slots[idx].root_map_extent;
        let own_entries = blockmap::iter_live(&self.dev, &self.sb, own_root)?;

        for entry in &own_entries {
            let shadowed_by_all = !children.is_empty()
                && children.iter().all(|&cidx| {
                    let croot = self.snapshots.slots[cidx].root_map_extent;
                    matches!(
                        blockmap::lookup(&self.dev, &self.sb, croot, entry.lbi)
                            .unwrap_or(Lookup::Absent),
                        Lookup::Mapped(_) | Lookup::Unmapped
                    )
                });
            if shadowed_by_all {
                if !entry.unmapped {
                    self.release_data_ref(entry.phys);
                }
                continue;
            }
            // Not shadowed by every child (or there are no children):
            // transfer to the parent unless the parent already has its
            // own present entry there, in which case this one is simply
            // stale and can be freed.
            match parent {
                Some(pid) => {
                    let pidx = self.snapshots.find_by_id(pid).ok_or(DbsError::Corrupt(
                        "parent pointer does not resolve".into(),
                    ))?;
                    let already = matches!(
                        blockmap::lookup(
                            &self.dev,
                            &self.sb,
                            self.snapshots.slots[pidx].root_map_extent,
                            entry.lbi
                        )?,
                        Lookup::Mapped(_) | Lookup::Unmapped
                    );
                    if already {
                        if !entry.unmapped {
                            self.release_data_ref(entry.phys);
                        }
                    } else {
                        let mut proot = self.snapshots.slots[pidx].root_map_extent;
                        if entry.unmapped {
                            blockmap::set_unmapped(
                                &self.dev,
                                &self.sb,
                                &mut self.alloc,
                                &mut proot,
                                entry.lbi,
                            )?;
                        } else {
                            blockmap::set_mapped(
                                &self.dev,
                                &self.sb,
                                &mut self.alloc,
                                &mut proot,
                                entry.lbi,
                                entry.phys,
                            )?;
                        }
                        self.snapshots.slots[pidx].root_map_extent = proot;
                    }
                }
                None => {
                    // No parent to fold into: this was a root snapshot.
                    // Any child that doesn't already shadow this entry is
                    // about to be reparented to `None` itself and becomes
                    // a root of its own, so it needs its own copy rather
                    // than losing the entry outright.
                    let mut copies = 0u32;
                    for &cidx in &children {
                        let croot = self.snapshots.slots[cidx].root_map_extent;
                        let already = matches!(
                            blockmap::lookup(&self.dev, &self.sb, croot, entry.lbi)
                                .unwrap_or(Lookup::Absent),
                            Lookup::Mapped(_) | Lookup::Unmapped
                        );
                        if already {
                            continue;
                        }
                        let mut croot = croot;
                        if entry.unmapped {
                            blockmap::set_unmapped(
                                &self.dev,
                                &self.sb,
                                &mut self.alloc,
                                &mut croot,
                                entry.lbi,
                            )?;
                        } else {
                            blockmap::set_mapped(
                                &self.dev,
                                &self.sb,
                                &mut self.alloc,
                                &mut croot,
                                entry.lbi,
                                entry.phys,
                            )?;
                        }
                        self.snapshots.slots[cidx].root_map_extent = croot;
                        copies += 1;
                    }
                    if !entry.unmapped {
                        if copies == 0 {
                            self.release_data_ref(entry.phys);
                        } else if copies > 1 {
                            // The first copy inherits the reference this
                            // entry already held; every further duplicate
                            // adds a new live reference into the same
                            // data extent.
                            let extent = extent_of(entry.phys, &self.sb);
                            *self.data_extent_refs.entry(extent).or_insert(0) += copies - 1;
                        }
                    }
                }
            }
        }

        // Re-parent every child onto this snapshot's parent. If the
        // deleted snapshot was itself a clone's boundary marker, each
        // child inherits that marker: it becomes the new earliest node of
        // its own reported chain, since the borrowed ancestry above it
        // must stay out of that clone's count either way.
        let was_clone_root = self.snapshots.slots[idx].is_clone_root;
        for &cidx in &children {
            self.snapshots.slots[cidx].parent_snapshot_id = parent;
            if was_clone_root {
                self.snapshots.slots[cidx].is_clone_root = true;
            }
        }
        if let Some(pid) = parent {
            let pidx = self.snapshots.find_by_id(pid).ok_or(DbsError::Corrupt(
                "parent pointer does not resolve".into(),
            ))?;
            // The parent now has `children.len()` more direct referents
            // and loses exactly the one reference this snapshot held.
            self.snapshots.slots[pidx].refcount =
                self.snapshots.slots[pidx].refcount + children.len() as u32;
            self.dec_ref_and_maybe_free(pid)?;
        }

        blockmap::free_chain(&self.dev, &self.sb, &mut self.alloc, own_root)?;
        self.snapshots.slots[idx] = SnapshotRecord::empty();

        self.persist_catalog()?;
        self.persist_bitmap()?;
        Ok(true)
    }

    pub fn clone_snapshot(&mut self, new_volume_name: &str, snapshot_id: u64) -> Result<bool> {
        check_name(new_volume_name)?;
        if self.volumes.find_by_name(new_volume_name).is_some() {
            return Ok(false);
        }
        let sidx = match self.snapshots.find_by_id(snapshot_id) {
            Some(i) => i,
            None => return Ok(false),
        };
        let vslot = match self.volumes.first_free_slot() {
            Some(s) => s,
            None => return Ok(false),
        };
        let new_sslot = match self.snapshots.first_free_slot() {
            Some(s) => s,
            None => return Ok(false),
        };

        let size_bytes = self
            .snapshots
            .slots[sidx]
            .volume_slot
            .and_then(|vs| self.volumes.slots.get(vs as usize))
            .map(|v| v.size_bytes)
            .or_else(|| {
                // The source is no longer a volume head; inherit size from
                // whichever volume's chain still contains it.
                self.volumes
                    .slots
                    .iter()
                    .find(|v| {
                        v.in_use
                            && self
                                .snapshots
                                .chain_from(v.current_snapshot_id)
                                .map(|c| c.iter().any(|&i| self.snapshots.slots[i].snapshot_id == snapshot_id))
                                .unwrap_or(false)
                    })
                    .map(|v| v.size_bytes)
            })
            .ok_or(DbsError::NotFound)?;

        // The clone gets its own writable head, parented on the source
        // snapshot, rather than aliasing the source's map directly: two
        // volumes must never share one snapshot's map, or a write through
        // either one would corrupt the other's view.
        let new_id = self.sb.next_snapshot_id;
        self.sb.next_snapshot_id += 1;
        self.snapshots.slots[sidx].refcount += 1;
        self.snapshots.slots[new_sslot] = SnapshotRecord {
            in_use: true,
            snapshot_id: new_id,
            parent_snapshot_id: Some(snapshot_id),
            created_at: now(),
            volume_slot: Some(vslot as u32),
            refcount: 1,
            root_map_extent: None,
            cur_data_extent: None,
            cur_data_offset: 0,
            is_clone_root: true,
        };
        self.volumes.slots[vslot] = VolumeRecord {
            in_use: true,
            name: new_volume_name.to_string(),
            size_bytes,
            created_at: now(),
            current_snapshot_id: new_id,
        };
        self.sb.volume_count += 1;
        self.persist_catalog()?;
        Ok(true)
    }

    /// Rebuilds the extent bitmap from scratch by walking every in-use
    /// snapshot's chain and map. Defensive reconciliation, not required
    /// for correctness of any operation above.
    pub fn vacuum(&mut self) -> Result<()> {
        let mut reachable: HashSet<u64> = HashSet::new();
        let mut refs: HashMap<u64, u32> = HashMap::new();
        for snap in self.snapshots.slots.iter().filter(|s| s.in_use) {
            for extent in blockmap::chain_extents(&self.dev, &self.sb, snap.root_map_extent)? {
                reachable.insert(extent);
            }
            for entry in blockmap::iter_live(&self.dev, &self.sb, snap.root_map_extent)? {
                if !entry.unmapped {
                    let extent = extent_of(entry.phys, &self.sb);
                    reachable.insert(extent);
                    *refs.entry(extent).or_insert(0) += 1;
                }
            }
        }
        self.alloc.rebuild(&reachable);
        self.data_extent_refs = refs;
        self.persist_bitmap()?;
        Ok(())
    }

    pub fn into_volume_session(self, volume_name: &str) -> Result<VolumeSession> {
        let vslot = self
            .volumes
            .find_by_name(volume_name)
            .ok_or(DbsError::NotFound)?;
        Ok(VolumeSession {
            device: self,
            vslot,
        })
    }
}

/// A handle to one volume's writable head, for the read/write/unmap path.
pub struct VolumeSession {
    device: Device,
    vslot: usize,
}

impl VolumeSession {
    fn volume_size_sectors(&self) -> u64 {
        self.device.volumes.slots[self.vslot].size_bytes / SECTOR_SIZE
    }

    fn check_lbi(&self, lbi: u64) -> Result<()> {
        if lbi >= self.volume_size_sectors() {
            return Err(DbsError::InvalidArgument(format!(
                "logical block index {lbi} out of range"
            )));
        }
        Ok(())
    }

    fn head_chain(&self) -> Result<Vec<usize>> {
        let head = self.device.volumes.slots[self.vslot].current_snapshot_id;
        self.device.snapshots.chain_from(head)
    }

    /// Reads one sector by resolving it against the head snapshot and
    /// walking up through parents until a present or unmapped entry (or
    /// the end of the chain) answers the question.
    pub fn read_block(&self, lbi: u64, out: &mut [u8; SECTOR_SIZE as usize]) -> Result<()> {
        self.check_lbi(lbi)?;
        for idx in self.head_chain()? {
            let root = self.device.snapshots.slots[idx].root_map_extent;
            match blockmap::lookup(&self.device.dev, &self.device.sb, root, lbi)? {
                Lookup::Mapped(phys) => {
                    *out = self.device.dev.read_sector(phys)?;
                    return Ok(());
                }
                Lookup::Unmapped => {
                    out.fill(0);
                    return Ok(());
                }
                Lookup::Absent => continue,
            }
        }
        out.fill(0);
        Ok(())
    }

    pub fn write_block(&mut self, lbi: u64, data: &[u8; SECTOR_SIZE as usize]) -> Result<()> {
        self.check_lbi(lbi)?;
        let head_id = self.device.volumes.slots[self.vslot].current_snapshot_id;
        let hidx = self
            .device
            .snapshots
            .find_by_id(head_id)
            .ok_or(DbsError::Corrupt("volume points at missing head".into()))?;
        let root = self.device.snapshots.slots[hidx].root_map_extent;

        if let Lookup::Mapped(phys) =
            blockmap::lookup(&self.device.dev, &self.device.sb, root, lbi)?
        {
            self.device.dev.write_sector(phys, data)?;
            self.device.dev.flush()?;
            return Ok(());
        }

        let mut cur_extent = self.device.snapshots.slots[hidx].cur_data_extent;
        let mut cur_offset = self.device.snapshots.slots[hidx].cur_data_offset as u64;
        if cur_extent.is_none() || cur_offset >= EXTENT_SECTORS {
            let new_extent = self.device.alloc.allocate()?;
            self.device.persist_bitmap()?;
            cur_extent = Some(new_extent);
            cur_offset = 0;
        }
        let extent = cur_extent.unwrap();
        let phys = self.device.sb.extent_to_sector(extent) + cur_offset;

        self.device.dev.write_sector(phys, data)?;
        self.device.dev.flush()?;

        let mut root = self.device.snapshots.slots[hidx].root_map_extent;
        blockmap::set_mapped(
            &self.device.dev,
            &self.device.sb,
            &mut self.device.alloc,
            &mut root,
            lbi,
            phys,
        )?;
        self.device.snapshots.slots[hidx].root_map_extent = root;
        self.device.snapshots.slots[hidx].cur_data_extent = Some(extent);
        self.device.snapshots.slots[hidx].cur_data_offset = (cur_offset + 1) as u32;
        *self.device.data_extent_refs.entry(extent).or_insert(0) += 1;

        self.device.persist_catalog()
    }

    pub fn unmap_block(&mut self, lbi: u64) -> Result<()> {
        self.check_lbi(lbi)?;
        let head_id = self.device.volumes.slots[self.vslot].current_snapshot_id;
        let hidx = self
            .device
            .snapshots
            .find_by_id(head_id)
            .ok_or(DbsError::Corrupt("volume points at missing head".into()))?;
        let mut root = self.device.snapshots.slots[hidx].root_map_extent;
        let prev = blockmap::set_unmapped(
            &self.device.dev,
            &self.device.sb,
            &mut self.device.alloc,
            &mut root,
            lbi,
        )?;
        self.device.snapshots.slots[hidx].root_map_extent = root;
        if let Some(phys) = prev {
            if let Some(freed_extent) = self.device.release_data_ref(phys) {
                // The extent backing the snapshot's current write cursor
                // was just handed back to the allocator; a cursor still
                // pointing into it would let the next write land in a
                // freed (and possibly reallocated) extent.
                if self.device.snapshots.slots[hidx].cur_data_extent == Some(freed_extent) {
                    self.device.snapshots.slots[hidx].cur_data_extent = None;
                    self.device.snapshots.slots[hidx].cur_data_offset = 0;
                }
            }
        }
        self.device.persist_catalog()?;
        self.device.persist_bitmap()
    }

    pub fn into_device(self) -> Device {
        self.device
    }
}
