//! On-disk geometry and fixed-size record layouts.
//!
//! All integers are little-endian. Offsets and sizes are in sectors unless
//! noted otherwise.

use crate::error::{DbsError, Result};

/// Size of one sector, the unit of addressing and of logical blocks.
pub const SECTOR_SIZE: u64 = 512;
/// Size of one extent, the unit of allocation.
pub const EXTENT_SECTORS: u64 = 64;
pub const EXTENT_SIZE_BYTES: u64 = EXTENT_SECTORS * SECTOR_SIZE;

/// Sentinel meaning "no extent" / "no snapshot" / "no slot" in a u64/u32
/// field, matching an optional value that has no on-disk `None` tag.
pub const NONE_U64: u64 = u64::MAX;
pub const NONE_U32: u32 = u32::MAX;

pub const MAGIC: &[u8; 8] = b"DBSFMT01";
pub const FORMAT_VERSION: u32 = 1;

pub const MAX_VOLUMES: usize = 256;
pub const MAX_SNAPSHOTS: usize = 4096;

pub const VOLUME_NAME_MAX: usize = 63;
/// 63 bytes of name plus a NUL terminator.
pub const VOLUME_NAME_FIELD: usize = VOLUME_NAME_MAX + 1;

pub const VOLUME_RECORD_SIZE: u64 = 96;
pub const SNAPSHOT_RECORD_SIZE: u64 = 80;

/// Fixed-size slot header for a metadata (block-map) extent: every such
/// extent is a flat array of [`MapEntry`] records plus a trailing chain
/// pointer to the next metadata extent owned by the same snapshot.
pub const MAP_ENTRY_SIZE: u64 = 24;
pub const MAP_CHAIN_PTR_SIZE: u64 = 8;
pub const MAP_ENTRIES_PER_EXTENT: u64 =
    (EXTENT_SIZE_BYTES - MAP_CHAIN_PTR_SIZE) / MAP_ENTRY_SIZE;

pub fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Computed on-disk regions for a device of a given size, fixed at
/// `init_device` time and then carried unchanged in the superblock.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub device_size_sectors: u64,
    pub bitmap_offset: u64,
    pub bitmap_size_sectors: u64,
    pub bitmap_bits: u64,
    pub volume_table_offset: u64,
    pub volume_table_size_sectors: u64,
    pub snapshot_table_offset: u64,
    pub snapshot_table_size_sectors: u64,
    pub extent0_offset: u64,
    pub total_device_extents: u64,
}

impl Layout {
    /// Derives the fixed on-disk layout for a device with `device_size_sectors`
    /// total sectors.
    ///
    /// The bitmap is sized as if the whole device (ignoring the reserved
    /// metadata region) were carved into extents; this is always an upper
    /// bound on `total_device_extents`; trailing bits beyond that count are
    /// left zero and never consulted.
    pub fn compute(device_size_sectors: u64) -> Result<Self> {
        let bitmap_bits = div_ceil(device_size_sectors, EXTENT_SECTORS).max(1);
        let bitmap_bytes = div_ceil(bitmap_bits, 8);
        let bitmap_size_sectors = div_ceil(bitmap_bytes, SECTOR_SIZE).max(1);

        let volume_table_bytes = MAX_VOLUMES as u64 * VOLUME_RECORD_SIZE;
        let volume_table_size_sectors = div_ceil(volume_table_bytes, SECTOR_SIZE);

        let snapshot_table_bytes = MAX_SNAPSHOTS as u64 * SNAPSHOT_RECORD_SIZE;
        let snapshot_table_size_sectors = div_ceil(snapshot_table_bytes, SECTOR_SIZE);

        // sector 0: superblock
        let bitmap_offset = 1;
        let volume_table_offset = bitmap_offset + bitmap_size_sectors;
        let snapshot_table_offset = volume_table_offset + volume_table_size_sectors;
        let reserved_end = snapshot_table_offset + snapshot_table_size_sectors;
        // Extents start at the next extent-aligned sector so extent
        // arithmetic never needs to account for a partial first extent.
        let extent0_offset = div_ceil(reserved_end, EXTENT_SECTORS) * EXTENT_SECTORS;

        if device_size_sectors <= extent0_offset {
            return Err(DbsError::InvalidArgument(
                "device too small to hold metadata and any extents".into(),
            ));
        }
        let total_device_extents = (device_size_sectors - extent0_offset) / EXTENT_SECTORS;

        Ok(Self {
            device_size_sectors,
            bitmap_offset,
            bitmap_size_sectors,
            bitmap_bits,
            volume_table_offset,
            volume_table_size_sectors,
            snapshot_table_offset,
            snapshot_table_size_sectors,
            extent0_offset,
            total_device_extents,
        })
    }

    pub fn extent_to_sector(&self, extent: u64) -> u64 {
        self.extent0_offset + extent * EXTENT_SECTORS
    }
}

/// The fixed-offset device header.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub version: u32,
    pub device_size_sectors: u64,
    pub total_device_extents: u64,
    pub allocated_device_extents: u64,
    pub next_snapshot_id: u64,
    pub volume_count: u32,
    pub alloc_cursor: u64,
    pub bitmap_offset: u64,
    pub bitmap_size_sectors: u64,
    pub volume_table_offset: u64,
    pub volume_table_size_sectors: u64,
    pub snapshot_table_offset: u64,
    pub snapshot_table_size_sectors: u64,
}

impl Superblock {
    pub fn new(layout: &Layout) -> Self {
        Self {
            version: FORMAT_VERSION,
            device_size_sectors: layout.device_size_sectors,
            total_device_extents: layout.total_device_extents,
            allocated_device_extents: 0,
            next_snapshot_id: 1,
            volume_count: 0,
            alloc_cursor: 0,
            bitmap_offset: layout.bitmap_offset,
            bitmap_size_sectors: layout.bitmap_size_sectors,
            volume_table_offset: layout.volume_table_offset,
            volume_table_size_sectors: layout.volume_table_size_sectors,
            snapshot_table_offset: layout.snapshot_table_offset,
            snapshot_table_size_sectors: layout.snapshot_table_size_sectors,
        }
    }

    pub fn extent0_offset(&self) -> u64 {
        let reserved_end = self.snapshot_table_offset + self.snapshot_table_size_sectors;
        div_ceil(reserved_end, EXTENT_SECTORS) * EXTENT_SECTORS
    }

    pub fn extent_to_sector(&self, extent: u64) -> u64 {
        self.extent0_offset() + extent * EXTENT_SECTORS
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&(SECTOR_SIZE as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&(EXTENT_SECTORS as u32).to_le_bytes());
        buf[24..32].copy_from_slice(&self.device_size_sectors.to_le_bytes());
        buf[32..40].copy_from_slice(&self.total_device_extents.to_le_bytes());
        buf[40..48].copy_from_slice(&self.allocated_device_extents.to_le_bytes());
        buf[48..56].copy_from_slice(&self.next_snapshot_id.to_le_bytes());
        buf[56..60].copy_from_slice(&self.volume_count.to_le_bytes());
        buf[64..72].copy_from_slice(&self.bitmap_offset.to_le_bytes());
        buf[72..80].copy_from_slice(&self.bitmap_size_sectors.to_le_bytes());
        buf[80..88].copy_from_slice(&self.volume_table_offset.to_le_bytes());
        buf[88..96].copy_from_slice(&self.volume_table_size_sectors.to_le_bytes());
        buf[96..104].copy_from_slice(&self.snapshot_table_offset.to_le_bytes());
        buf[104..112].copy_from_slice(&self.snapshot_table_size_sectors.to_le_bytes());
        buf[112..120].copy_from_slice(&self.alloc_cursor.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR_SIZE as usize {
            return Err(DbsError::Corrupt("superblock sector truncated".into()));
        }
        if &buf[0..8] != MAGIC {
            return Err(DbsError::Corrupt("bad magic".into()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(DbsError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        let block_size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        if block_size as u64 != SECTOR_SIZE {
            return Err(DbsError::Corrupt("unexpected block size".into()));
        }
        Ok(Self {
            version,
            device_size_sectors: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            total_device_extents: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            allocated_device_extents: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            next_snapshot_id: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            volume_count: u32::from_le_bytes(buf[56..60].try_into().unwrap()),
            bitmap_offset: u64::from_le_bytes(buf[64..72].try_into().unwrap()),
            bitmap_size_sectors: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            volume_table_offset: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
            volume_table_size_sectors: u64::from_le_bytes(buf[88..96].try_into().unwrap()),
            snapshot_table_offset: u64::from_le_bytes(buf[96..104].try_into().unwrap()),
            snapshot_table_size_sectors: u64::from_le_bytes(buf[104..112].try_into().unwrap()),
            alloc_cursor: u64::from_le_bytes(buf[112..120].try_into().unwrap()),
        })
    }
}

/// A fixed-size slot in the volume table.
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub in_use: bool,
    pub name: String,
    pub size_bytes: u64,
    pub created_at: u64,
    pub current_snapshot_id: u64,
}

impl VolumeRecord {
    pub fn empty() -> Self {
        Self {
            in_use: false,
            name: String::new(),
            size_bytes: 0,
            created_at: 0,
            current_snapshot_id: NONE_U64,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; VOLUME_RECORD_SIZE as usize];
        buf[0..8].copy_from_slice(&(self.in_use as u64).to_le_bytes());
        let name_bytes = self.name.as_bytes();
        let n = name_bytes.len().min(VOLUME_NAME_MAX);
        buf[8..8 + n].copy_from_slice(&name_bytes[..n]);
        buf[72..80].copy_from_slice(&self.size_bytes.to_le_bytes());
        buf[80..88].copy_from_slice(&self.created_at.to_le_bytes());
        buf[88..96].copy_from_slice(&self.current_snapshot_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if (buf.len() as u64) < VOLUME_RECORD_SIZE {
            return Err(DbsError::Corrupt("volume record truncated".into()));
        }
        let in_use = u64::from_le_bytes(buf[0..8].try_into().unwrap()) != 0;
        let name_raw = &buf[8..8 + VOLUME_NAME_FIELD];
        let nul = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let name = String::from_utf8_lossy(&name_raw[..nul]).into_owned();
        Ok(Self {
            in_use,
            name,
            size_bytes: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            created_at: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
            current_snapshot_id: u64::from_le_bytes(buf[88..96].try_into().unwrap()),
        })
    }
}

/// A fixed-size slot in the snapshot table.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub in_use: bool,
    pub snapshot_id: u64,
    pub parent_snapshot_id: Option<u64>,
    pub created_at: u64,
    pub volume_slot: Option<u32>,
    pub refcount: u32,
    pub root_map_extent: Option<u64>,
    pub cur_data_extent: Option<u64>,
    pub cur_data_offset: u32,
    /// Marks a snapshot created as a clone's fresh head (see
    /// `Device::clone_snapshot`). A reported chain length stops at the
    /// first node carrying this flag instead of continuing into the
    /// borrowed ancestry the clone was taken from; functional chain walks
    /// (CoW read resolution, refcount cascades) ignore it and keep
    /// following `parent_snapshot_id` all the way up.
    pub is_clone_root: bool,
}

impl SnapshotRecord {
    pub fn empty() -> Self {
        Self {
            in_use: false,
            snapshot_id: 0,
            parent_snapshot_id: None,
            created_at: 0,
            volume_slot: None,
            refcount: 0,
            root_map_extent: None,
            cur_data_extent: None,
            cur_data_offset: 0,
            is_clone_root: false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SNAPSHOT_RECORD_SIZE as usize];
        buf[0..8].copy_from_slice(&(self.in_use as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&self.snapshot_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.parent_snapshot_id.unwrap_or(NONE_U64).to_le_bytes());
        buf[24..32].copy_from_slice(&self.created_at.to_le_bytes());
        buf[32..40].copy_from_slice(&(self.volume_slot.unwrap_or(NONE_U32) as u64).to_le_bytes());
        buf[40..48].copy_from_slice(&(self.refcount as u64).to_le_bytes());
        buf[48..56].copy_from_slice(&self.root_map_extent.unwrap_or(NONE_U64).to_le_bytes());
        buf[56..64].copy_from_slice(&self.cur_data_extent.unwrap_or(NONE_U64).to_le_bytes());
        buf[64..72].copy_from_slice(&(self.cur_data_offset as u64).to_le_bytes());
        buf[72..80].copy_from_slice(&(self.is_clone_root as u64).to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if (buf.len() as u64) < SNAPSHOT_RECORD_SIZE {
            return Err(DbsError::Corrupt("snapshot record truncated".into()));
        }
        let opt_u64 = |v: u64| if v == NONE_U64 { None } else { Some(v) };
        let volume_slot_raw = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        Ok(Self {
            in_use: u64::from_le_bytes(buf[0..8].try_into().unwrap()) != 0,
            snapshot_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            parent_snapshot_id: opt_u64(u64::from_le_bytes(buf[16..24].try_into().unwrap())),
            created_at: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            volume_slot: if volume_slot_raw == NONE_U32 as u64 {
                None
            } else {
                Some(volume_slot_raw as u32)
            },
            refcount: u64::from_le_bytes(buf[40..48].try_into().unwrap()) as u32,
            root_map_extent: opt_u64(u64::from_le_bytes(buf[48..56].try_into().unwrap())),
            cur_data_extent: opt_u64(u64::from_le_bytes(buf[56..64].try_into().unwrap())),
            cur_data_offset: u64::from_le_bytes(buf[64..72].try_into().unwrap()) as u32,
            is_clone_root: u64::from_le_bytes(buf[72..80].try_into().unwrap()) != 0,
        })
    }
}

/// A single slot inside a metadata (block-map) extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Present,
    Unmapped,
    Tombstone,
}

impl EntryState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Present,
            2 => Self::Unmapped,
            3 => Self::Tombstone,
            _ => Self::Empty,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Present => 1,
            Self::Unmapped => 2,
            Self::Tombstone => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    pub state: EntryState,
    pub lbi: u64,
    pub phys: u64,
}

impl MapEntry {
    pub fn empty() -> Self {
        Self {
            state: EntryState::Empty,
            lbi: 0,
            phys: 0,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.state.to_u8();
        buf[8..16].copy_from_slice(&self.lbi.to_le_bytes());
        buf[16..24].copy_from_slice(&self.phys.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            state: EntryState::from_u8(buf[0]),
            lbi: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            phys: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}
