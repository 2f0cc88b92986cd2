//! Per-snapshot logical-block-index -> physical-sector map.
//!
//! Stored as a chain of metadata extents owned by the snapshot; each
//! extent holds a flat array of entries plus a pointer to the next extent
//! in the chain. This is the "hash-with-overflow" form the design allows
//! in place of a radix tree: there is a single bucket (the whole chain),
//! searched linearly, with tombstones left behind on removal so a probe
//! for one key never skips over a later key that shares no collision.

use crate::allocator::ExtentAllocator;
use crate::block_io::BlockDevice;
use crate::error::Result;
use crate::layout::{
    EntryState, MapEntry, Superblock, EXTENT_SIZE_BYTES, MAP_CHAIN_PTR_SIZE, MAP_ENTRY_SIZE,
    MAP_ENTRIES_PER_EXTENT, NONE_U64,
};

/// Outcome of looking up a single logical block index in one snapshot's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// No entry for this index; the caller should fall through to the
    /// parent snapshot.
    Absent,
    /// Mapped to a physical sector.
    Mapped(u64),
    /// Explicitly unmapped: reads return zero, the chain walk stops here.
    Unmapped,
}

struct ExtentPage {
    extent: u64,
    bytes: Vec<u8>,
}

impl ExtentPage {
    fn load(dev: &BlockDevice, sb: &Superblock, extent: u64) -> Result<Self> {
        let bytes = dev.read_sectors(sb.extent_to_sector(extent), crate::layout::EXTENT_SECTORS)?;
        Ok(Self { extent, bytes })
    }

    fn zeroed(extent: u64) -> Self {
        Self {
            extent,
            bytes: vec![0u8; EXTENT_SIZE_BYTES as usize],
        }
    }

    fn store(&self, dev: &BlockDevice, sb: &Superblock) -> Result<()> {
        dev.write_sectors(sb.extent_to_sector(self.extent), &self.bytes)
    }

    fn entry(&self, slot: u64) -> MapEntry {
        let off = (slot * MAP_ENTRY_SIZE) as usize;
        MapEntry::read_from(&self.bytes[off..off + MAP_ENTRY_SIZE as usize])
    }

    fn set_entry(&mut self, slot: u64, entry: &MapEntry) {
        let off = (slot * MAP_ENTRY_SIZE) as usize;
        entry.write_to(&mut self.bytes[off..off + MAP_ENTRY_SIZE as usize]);
    }

    fn next(&self) -> Option<u64> {
        let off = self.bytes.len() - MAP_CHAIN_PTR_SIZE as usize;
        let v = u64::from_le_bytes(self.bytes[off..off + 8].try_into().unwrap());
        if v == NONE_U64 {
            None
        } else {
            Some(v)
        }
    }

    fn set_next(&mut self, next: Option<u64>) {
        let off = self.bytes.len() - MAP_CHAIN_PTR_SIZE as usize;
        self.bytes[off..off + 8].copy_from_slice(&next.unwrap_or(NONE_U64).to_le_bytes());
    }
}

/// Looks up `lbi` in this snapshot's own map (no chain-walk to ancestors;
/// the caller drives that across snapshots).
pub fn lookup(dev: &BlockDevice, sb: &Superblock, root: Option<u64>, lbi: u64) -> Result<Lookup> {
    let mut cur = root;
    while let Some(extent) = cur {
        let page = ExtentPage::load(dev, sb, extent)?;
        for slot in 0..MAP_ENTRIES_PER_EXTENT {
            let e = page.entry(slot);
            if e.lbi == lbi {
                match e.state {
                    EntryState::Present => return Ok(Lookup::Mapped(e.phys)),
                    EntryState::Unmapped => return Ok(Lookup::Unmapped),
                    _ => {}
                }
            }
        }
        cur = page.next();
    }
    Ok(Lookup::Absent)
}

/// Inserts or overwrites the mapping for `lbi` to point at `phys`,
/// allocating a new metadata extent if no slot is free anywhere in the
/// chain. Returns the previous physical sector this snapshot owned at
/// `lbi`, if it was a present (non-unmapped) mapping.
pub fn set_mapped(
    dev: &BlockDevice,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    root: &mut Option<u64>,
    lbi: u64,
    phys: u64,
) -> Result<Option<u64>> {
    upsert(dev, sb, alloc, root, lbi, EntryState::Present, phys)
}

/// Marks `lbi` as explicitly unmapped in this snapshot's map. Returns the
/// previous physical sector if this snapshot owned a present mapping
/// there (the caller must free it), or `None` if it was already absent or
/// already unmapped.
pub fn set_unmapped(
    dev: &BlockDevice,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    root: &mut Option<u64>,
    lbi: u64,
) -> Result<Option<u64>> {
    upsert(dev, sb, alloc, root, lbi, EntryState::Unmapped, 0)
}

fn upsert(
    dev: &BlockDevice,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    root: &mut Option<u64>,
    lbi: u64,
    new_state: EntryState,
    phys: u64,
) -> Result<Option<u64>> {
    let mut cur = *root;
    let mut last_extent: Option<u64> = None;
    let mut reusable: Option<(u64, u64)> = None; // (extent, slot) of a free/tombstone slot
    while let Some(extent) = cur {
        let mut page = ExtentPage::load(dev, sb, extent)?;
        for slot in 0..MAP_ENTRIES_PER_EXTENT {
            let e = page.entry(slot);
            if e.lbi == lbi && matches!(e.state, EntryState::Present | EntryState::Unmapped) {
                let prev = if e.state == EntryState::Present {
                    Some(e.phys)
                } else {
                    None
                };
                page.set_entry(
                    slot,
                    &MapEntry {
                        state: new_state,
                        lbi,
                        phys,
                    },
                );
                page.store(dev, sb)?;
                return Ok(prev);
            }
            if reusable.is_none() && matches!(e.state, EntryState::Empty | EntryState::Tombstone) {
                reusable = Some((extent, slot));
            }
        }
        last_extent = Some(extent);
        cur = page.next();
    }

    // No existing entry for this lbi anywhere in the chain.
    if let Some((extent, slot)) = reusable {
        let mut page = ExtentPage::load(dev, sb, extent)?;
        page.set_entry(
            slot,
            &MapEntry {
                state: new_state,
                lbi,
                phys,
            },
        );
        page.store(dev, sb)?;
        return Ok(None);
    }

    // Allocate a fresh metadata extent and link it into the chain. The
    // bitmap is persisted before the extent is given any content so a
    // crash never leaves a referenced extent looking free.
    let new_extent = alloc.allocate()?;
    alloc.store(dev, sb)?;
    dev.flush()?;
    let mut page = ExtentPage::zeroed(new_extent);
    page.set_next(None);
    page.set_entry(
        0,
        &MapEntry {
            state: new_state,
            lbi,
            phys,
        },
    );
    page.store(dev, sb)?;

    match last_extent {
        Some(tail) => {
            let mut tail_page = ExtentPage::load(dev, sb, tail)?;
            tail_page.set_next(Some(new_extent));
            tail_page.store(dev, sb)?;
        }
        None => *root = Some(new_extent),
    }
    Ok(None)
}

/// Removes any entry for `lbi` from this snapshot's map entirely (neither
/// present nor unmapped afterwards), leaving a tombstone behind. Returns
/// the physical sector if it had been a present mapping.
pub fn remove(
    dev: &BlockDevice,
    sb: &Superblock,
    root: Option<u64>,
    lbi: u64,
) -> Result<Option<u64>> {
    let mut cur = root;
    while let Some(extent) = cur {
        let mut page = ExtentPage::load(dev, sb, extent)?;
        for slot in 0..MAP_ENTRIES_PER_EXTENT {
            let e = page.entry(slot);
            if e.lbi == lbi && matches!(e.state, EntryState::Present | EntryState::Unmapped) {
                let prev = if e.state == EntryState::Present {
                    Some(e.phys)
                } else {
                    None
                };
                page.set_entry(slot, &MapEntry {
                    state: EntryState::Tombstone,
                    lbi: 0,
                    phys: 0,
                });
                page.store(dev, sb)?;
                return Ok(prev);
            }
        }
        cur = page.next();
    }
    Ok(None)
}

/// A live (present or unmapped) entry read out during a full scan.
#[derive(Debug, Clone, Copy)]
pub struct LiveEntry {
    pub lbi: u64,
    pub unmapped: bool,
    pub phys: u64,
}

/// Returns every present/unmapped entry owned directly by this snapshot.
pub fn iter_live(dev: &BlockDevice, sb: &Superblock, root: Option<u64>) -> Result<Vec<LiveEntry>> {
    let mut out = Vec::new();
    let mut cur = root;
    while let Some(extent) = cur {
        let page = ExtentPage::load(dev, sb, extent)?;
        for slot in 0..MAP_ENTRIES_PER_EXTENT {
            let e = page.entry(slot);
            match e.state {
                EntryState::Present => out.push(LiveEntry {
                    lbi: e.lbi,
                    unmapped: false,
                    phys: e.phys,
                }),
                EntryState::Unmapped => out.push(LiveEntry {
                    lbi: e.lbi,
                    unmapped: true,
                    phys: 0,
                }),
                _ => {}
            }
        }
        cur = page.next();
    }
    Ok(out)
}

/// Lists the metadata extents making up this snapshot's map chain.
pub fn chain_extents(dev: &BlockDevice, sb: &Superblock, root: Option<u64>) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    let mut cur = root;
    while let Some(extent) = cur {
        out.push(extent);
        let page = ExtentPage::load(dev, sb, extent)?;
        cur = page.next();
    }
    Ok(out)
}

/// Frees every metadata extent in this snapshot's map chain.
pub fn free_chain(
    dev: &BlockDevice,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    root: Option<u64>,
) -> Result<()> {
    for extent in chain_extents(dev, sb, root)? {
        alloc.free(extent);
    }
    Ok(())
}
