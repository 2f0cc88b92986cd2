//! End-to-end scenarios against the public library API, exercising a
//! fresh device file per test.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use dbs_core::SECTOR_SIZE;

const MEGABYTE: u64 = 1024 * 1024;
const GIGABYTE: u64 = MEGABYTE * 1024;
const DEVICE_SIZE: u64 = MEGABYTE * 100;

const EMPTY_BLOCK: [u8; SECTOR_SIZE as usize] = [0u8; SECTOR_SIZE as usize];
const DUMMY_BLOCK: [u8; SECTOR_SIZE as usize] = [0xF0u8; SECTOR_SIZE as usize];

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn fresh_device() -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "dbs-scenario-{}-{n}.img",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

/// Four distinct synthetic blocks, cycled with modulo the way a source
/// file's bytes were cycled in the tool this is adapted from.
fn sample_blocks() -> Vec<[u8; SECTOR_SIZE as usize]> {
    (0..4u8)
        .map(|i| {
            let mut b = [0u8; SECTOR_SIZE as usize];
            for (j, byte) in b.iter_mut().enumerate() {
                *byte = (i.wrapping_mul(37)).wrapping_add(j as u8);
            }
            b
        })
        .collect()
}

fn block_indices() -> Vec<u64> {
    let positions = [0u64, 3, 43, 53, 92];
    let spread = 100u64;
    let repeats = 10u64;
    let mut out = Vec::new();
    for r in 0..repeats {
        for &p in &positions {
            out.push(p + r * spread);
        }
    }
    out
}

fn read_blocks_expect(
    path: &PathBuf,
    volume: &str,
    indices: &[u64],
    expected: &[[u8; SECTOR_SIZE as usize]],
) {
    let mut out = [0u8; SECTOR_SIZE as usize];
    for (i, &idx) in indices.iter().enumerate() {
        dbs_core::read_block(path, volume, idx, &mut out).unwrap();
        assert_eq!(out, expected[i % expected.len()], "block {idx} mismatch");
    }
}

fn write_blocks(path: &PathBuf, volume: &str, indices: &[u64], data: &[[u8; SECTOR_SIZE as usize]]) {
    for (i, &idx) in indices.iter().enumerate() {
        dbs_core::write_block(path, volume, idx, &data[i % data.len()]).unwrap();
    }
}

fn unmap_blocks(path: &PathBuf, volume: &str, indices: &[u64]) {
    for &idx in indices {
        dbs_core::unmap_block(path, volume, idx).unwrap();
    }
}

#[test]
fn device_lifecycle() {
    let path = fresh_device();
    dbs_core::init_device(&path, DEVICE_SIZE).unwrap();
    let info = dbs_core::get_device_info(&path).unwrap();
    assert_eq!(info.allocated_device_extents, 0);
    assert_eq!(info.volume_count, 0);
    assert!(dbs_core::get_volume_info(&path).unwrap().is_empty());
    std::fs::remove_file(&path).unwrap();
}

fn assert_volume(v: &dbs_core::VolumeInfo, name: &str, size: u64, snapshot_count: usize) {
    assert_eq!(v.name, name);
    assert_eq!(v.size_bytes, size);
    assert!(v.created_at > 0);
    assert_eq!(v.snapshot_count, snapshot_count);
}

#[test]
fn volume_catalog() {
    let path = fresh_device();
    dbs_core::init_device(&path, DEVICE_SIZE).unwrap();

    assert!(dbs_core::create_volume(&path, "vol1", GIGABYTE).unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 1);
    assert_volume(&vols[0], "vol1", GIGABYTE, 1);

    assert!(!dbs_core::create_volume(&path, "vol1", GIGABYTE).unwrap());
    assert!(dbs_core::create_volume(&path, "vol2", 2 * GIGABYTE).unwrap());
    assert!(dbs_core::create_volume(&path, "vol3", 3 * GIGABYTE).unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 3);

    assert!(dbs_core::delete_volume(&path, "vol2").unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 2);
    assert!(!dbs_core::delete_volume(&path, "vol2").unwrap());

    assert!(dbs_core::create_volume(&path, "vol2new", 2 * GIGABYTE).unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 3);

    assert!(dbs_core::rename_volume(&path, "vol2new", "vol2renamed").unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert!(vols.iter().any(|v| v.name == "vol2renamed"));

    assert!(dbs_core::delete_volume(&path, "vol2renamed").unwrap());
    assert!(dbs_core::delete_volume(&path, "vol3").unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 1);
    assert!(dbs_core::delete_volume(&path, "vol1").unwrap());
    assert!(dbs_core::get_volume_info(&path).unwrap().is_empty());

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn snapshot_chain_and_clone() {
    let path = fresh_device();
    dbs_core::init_device(&path, DEVICE_SIZE).unwrap();
    assert!(dbs_core::create_volume(&path, "vol1", GIGABYTE).unwrap());

    let snaps = dbs_core::get_snapshot_info(&path, "vol1").unwrap();
    assert_eq!(snaps.len(), 1);
    assert!(snaps[0].parent_snapshot_id.is_none());
    let initial_id = snaps[0].snapshot_id;

    assert!(dbs_core::create_snapshot(&path, "vol1").unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    let head_id = vols[0].current_snapshot_id;
    assert_ne!(head_id, initial_id);
    let snaps = dbs_core::get_snapshot_info(&path, "vol1").unwrap();
    assert_eq!(snaps.len(), 2);

    assert!(dbs_core::create_snapshot(&path, "vol1").unwrap());
    assert!(dbs_core::create_snapshot(&path, "vol1").unwrap());
    assert!(dbs_core::create_snapshot(&path, "vol1").unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    let current_id = vols[0].current_snapshot_id;
    let snaps = dbs_core::get_snapshot_info(&path, "vol1").unwrap();
    assert_eq!(snaps.len(), 5);

    // Deleting the current head fails gracefully.
    assert!(!dbs_core::delete_snapshot(&path, current_id).unwrap());
    assert_eq!(dbs_core::get_snapshot_info(&path, "vol1").unwrap().len(), 5);

    // Deleting the root ancestor succeeds and folds its entries forward.
    assert!(dbs_core::delete_snapshot(&path, initial_id).unwrap());
    assert_eq!(dbs_core::get_snapshot_info(&path, "vol1").unwrap().len(), 4);

    assert!(dbs_core::create_snapshot(&path, "vol1").unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    let new_head = vols[0].current_snapshot_id;
    assert_ne!(new_head, current_id);

    // Delete every non-head snapshot.
    for s in dbs_core::get_snapshot_info(&path, "vol1").unwrap() {
        if s.snapshot_id == new_head {
            continue;
        }
        assert!(dbs_core::delete_snapshot(&path, s.snapshot_id).unwrap());
    }
    let snaps = dbs_core::get_snapshot_info(&path, "vol1").unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].snapshot_id, new_head);
    assert!(snaps[0].parent_snapshot_id.is_none());

    // Clone the sole remaining snapshot, then discard the clone. A clone's
    // own reported chain is length 1 regardless of how deep the snapshot
    // it was cloned from sits in its source volume's history.
    assert!(dbs_core::clone_snapshot(&path, "vol2cloned", new_head).unwrap());
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 2);
    assert_volume(&vols[0], "vol1", GIGABYTE, 1);
    assert_volume(&vols[1], "vol2cloned", GIGABYTE, 1);
    assert!(dbs_core::delete_volume(&path, "vol2cloned").unwrap());
    assert_eq!(dbs_core::get_volume_info(&path).unwrap().len(), 1);

    // Snapshot again and clone every snapshot in the chain: vol1 now has
    // two of its own snapshots, and each clone still reports a length-1
    // chain of its own even though one of them was cloned off vol1's
    // non-root (most recent) snapshot.
    assert!(dbs_core::create_snapshot(&path, "vol1").unwrap());
    let snaps = dbs_core::get_snapshot_info(&path, "vol1").unwrap();
    for (i, s) in snaps.iter().enumerate() {
        assert!(dbs_core::clone_snapshot(&path, &format!("vol2clone{}", i + 1), s.snapshot_id)
            .unwrap());
    }
    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 3);
    assert_volume(&vols[0], "vol1", GIGABYTE, 2);
    assert_volume(&vols[1], "vol2clone1", GIGABYTE, 1);
    assert_volume(&vols[2], "vol2clone2", GIGABYTE, 1);

    assert!(dbs_core::delete_volume(&path, "vol1").unwrap());
    assert!(dbs_core::delete_volume(&path, "vol2clone1").unwrap());
    assert!(dbs_core::delete_volume(&path, "vol2clone2").unwrap());
    assert!(dbs_core::get_volume_info(&path).unwrap().is_empty());

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn volume_io_round_trip() {
    let path = fresh_device();
    dbs_core::init_device(&path, DEVICE_SIZE).unwrap();
    let blocks = sample_blocks();
    let indices = block_indices();

    assert!(dbs_core::create_volume(&path, "vol1", GIGABYTE).unwrap());

    read_blocks_expect(&path, "vol1", &indices, &[EMPTY_BLOCK]);

    write_blocks(&path, "vol1", &indices, &blocks);
    read_blocks_expect(&path, "vol1", &indices, &blocks);

    let mut others: Vec<u64> = indices
        .iter()
        .copied()
        .filter(|&i| i > 0)
        .map(|i| i - 1)
        .chain(indices.iter().map(|&i| i + 1))
        .collect();
    others.sort_unstable();
    others.dedup();
    // An untouched neighbor may coincide with a touched index at the
    // chain boundaries; drop those before asserting zero.
    others.retain(|i| !indices.contains(i));
    read_blocks_expect(&path, "vol1", &others, &[EMPTY_BLOCK]);

    unmap_blocks(&path, "vol1", &indices);
    read_blocks_expect(&path, "vol1", &indices, &[EMPTY_BLOCK]);

    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 1);
    assert_volume(&vols[0], "vol1", GIGABYTE, 1);
    assert!(dbs_core::delete_volume(&path, "vol1").unwrap());

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn snapshot_io_isolation() {
    let path = fresh_device();
    dbs_core::init_device(&path, DEVICE_SIZE).unwrap();
    let blocks = sample_blocks();
    let indices = block_indices();

    assert!(dbs_core::create_volume(&path, "vol1", GIGABYTE).unwrap());
    write_blocks(&path, "vol1", &indices, &blocks);

    assert!(dbs_core::create_snapshot(&path, "vol1").unwrap());
    read_blocks_expect(&path, "vol1", &indices, &blocks);

    write_blocks(&path, "vol1", &indices, &[DUMMY_BLOCK]);
    read_blocks_expect(&path, "vol1", &indices, &[DUMMY_BLOCK]);

    let snaps = dbs_core::get_snapshot_info(&path, "vol1").unwrap();
    let initial_id = snaps
        .iter()
        .find(|s| s.parent_snapshot_id.is_none())
        .unwrap()
        .snapshot_id;
    assert!(dbs_core::clone_snapshot(&path, "vol1clone", initial_id).unwrap());
    read_blocks_expect(&path, "vol1clone", &indices, &blocks);

    assert!(dbs_core::delete_snapshot(&path, initial_id).unwrap());
    read_blocks_expect(&path, "vol1", &indices, &[DUMMY_BLOCK]);

    let vols = dbs_core::get_volume_info(&path).unwrap();
    assert_eq!(vols.len(), 2);
    assert_volume(
        vols.iter().find(|v| v.name == "vol1").unwrap(),
        "vol1",
        GIGABYTE,
        1,
    );
    assert_volume(
        vols.iter().find(|v| v.name == "vol1clone").unwrap(),
        "vol1clone",
        GIGABYTE,
        1,
    );
    assert!(dbs_core::delete_volume(&path, "vol1").unwrap());
    assert!(dbs_core::delete_volume(&path, "vol1clone").unwrap());

    std::fs::remove_file(&path).unwrap();
}
