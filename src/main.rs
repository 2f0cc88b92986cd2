//! `dbsctl` is a command line front end for the block store implemented
//! by the `dbs_core` library: format a device, manage its volumes and
//! snapshots, and read or write individual logical blocks for testing.

use std::env;
use std::path::PathBuf;
use std::process::exit;

use dbs_core::{Result, SECTOR_SIZE};

fn error(subcommand: &str, msg: impl std::fmt::Display) -> ! {
    eprintln!("dbsctl: {subcommand}: {msg}");
    exit(1);
}

fn print_usage(prog: &str) {
    eprintln!("{prog}: bad usage");
    eprintln!("Try '{prog} --help' for more information.");
}

fn print_help(prog: &str) {
    println!();
    println!("Usage: {prog} <device> <subcommand> [args]");
    println!();
    println!("Subcommands:");
    println!(" init_device <size_bytes>");
    println!(" vacuum_device");
    println!(" get_device_info");
    println!(" get_volume_info");
    println!(" get_snapshot_info <volume>");
    println!(" create_volume <name> <size_bytes>");
    println!(" rename_volume <name> <new_name>");
    println!(" delete_volume <name>");
    println!(" create_snapshot <volume>");
    println!(" delete_snapshot <snapshot_id>");
    println!(" clone_snapshot <new_volume> <snapshot_id>");
    println!(" read_block <volume> <lbi>");
    println!(" write_block <volume> <lbi> <hex_byte>");
    println!(" unmap_block <volume> <lbi>");
    println!();
    println!("Options:");
    println!(" -h, --help\tPrints help.");
    println!();
}

fn parse_u64(sub: &str, field: &str, s: &str) -> u64 {
    s.parse().unwrap_or_else(|_| error(sub, format!("invalid {field}: {s:?}")))
}

fn report<T>(sub: &str, r: Result<T>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => error(sub, e),
    }
}

fn report_bool(sub: &str, r: Result<bool>) {
    match r {
        Ok(true) => {}
        Ok(false) => error(sub, "operation did not succeed"),
        Err(e) => error(sub, e),
    }
}

/// Fetches exactly `N` positional arguments for a subcommand, or prints
/// usage and exits if the count doesn't match.
fn require_args<'a, const N: usize>(args: &'a [String], prog: &str) -> [&'a str; N] {
    if args.len() != N {
        print_usage(prog);
        exit(1);
    }
    std::array::from_fn(|i| args[i].as_str())
}

fn hex(buf: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(buf.len() * 2 + 1);
    for b in buf {
        let _ = write!(s, "{b:02x}");
    }
    s.push('\n');
    s
}

fn main() {
    let mut iter = env::args();
    let prog = iter.next().unwrap_or_else(|| "dbsctl".to_owned());
    let rest: Vec<String> = iter.collect();

    if rest.iter().any(|a| a == "-h" || a == "--help") {
        print_help(&prog);
        exit(0);
    }
    if rest.len() < 2 {
        print_usage(&prog);
        exit(1);
    }

    let path = PathBuf::from(&rest[0]);
    let subcommand = rest[1].as_str();
    let args = &rest[2..];

    match subcommand {
        "init_device" => {
            let [size] = require_args(args, &prog);
            let size = parse_u64(subcommand, "size_bytes", size);
            report(subcommand, dbs_core::init_device(&path, size));
        }
        "vacuum_device" => {
            report(subcommand, dbs_core::vacuum_device(&path));
        }
        "get_device_info" => {
            let info = report(subcommand, dbs_core::get_device_info(&path));
            println!("format_version: {}", info.format_version);
            println!("device_size_bytes: {}", info.device_size_bytes);
            println!("total_device_extents: {}", info.total_device_extents);
            println!("allocated_device_extents: {}", info.allocated_device_extents);
            println!("volume_count: {}", info.volume_count);
        }
        "get_volume_info" => {
            let volumes = report(subcommand, dbs_core::get_volume_info(&path));
            for v in volumes {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    v.name, v.size_bytes, v.created_at, v.current_snapshot_id, v.snapshot_count
                );
            }
        }
        "get_snapshot_info" => {
            let [volume] = require_args(args, &prog);
            let snaps = report(subcommand, dbs_core::get_snapshot_info(&path, volume));
            for s in snaps {
                println!(
                    "{}\t{}\t{}\t{}",
                    s.snapshot_id,
                    s.parent_snapshot_id.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    s.created_at,
                    s.refcount
                );
            }
        }
        "create_volume" => {
            let [name, size] = require_args(args, &prog);
            let size = parse_u64(subcommand, "size_bytes", size);
            report_bool(subcommand, dbs_core::create_volume(&path, name, size));
        }
        "rename_volume" => {
            let [name, new_name] = require_args(args, &prog);
            report_bool(subcommand, dbs_core::rename_volume(&path, name, new_name));
        }
        "delete_volume" => {
            let [name] = require_args(args, &prog);
            report_bool(subcommand, dbs_core::delete_volume(&path, name));
        }
        "create_snapshot" => {
            let [volume] = require_args(args, &prog);
            report_bool(subcommand, dbs_core::create_snapshot(&path, volume));
        }
        "delete_snapshot" => {
            let [id] = require_args(args, &prog);
            let id = parse_u64(subcommand, "snapshot_id", id);
            report_bool(subcommand, dbs_core::delete_snapshot(&path, id));
        }
        "clone_snapshot" => {
            let [new_volume, id] = require_args(args, &prog);
            let id = parse_u64(subcommand, "snapshot_id", id);
            report_bool(subcommand, dbs_core::clone_snapshot(&path, new_volume, id));
        }
        "read_block" => {
            let [volume, lbi] = require_args(args, &prog);
            let lbi = parse_u64(subcommand, "lbi", lbi);
            let mut buf = [0u8; SECTOR_SIZE as usize];
            report(subcommand, dbs_core::read_block(&path, volume, lbi, &mut buf));
            print!("{}", hex(&buf));
        }
        "write_block" => {
            let [volume, lbi, byte] = require_args(args, &prog);
            let lbi = parse_u64(subcommand, "lbi", lbi);
            let b = u8::from_str_radix(byte.trim_start_matches("0x"), 16)
                .unwrap_or_else(|_| error(subcommand, format!("invalid byte: {byte:?}")));
            let buf = [b; SECTOR_SIZE as usize];
            report(subcommand, dbs_core::write_block(&path, volume, lbi, &buf));
        }
        "unmap_block" => {
            let [volume, lbi] = require_args(args, &prog);
            let lbi = parse_u64(subcommand, "lbi", lbi);
            report(subcommand, dbs_core::unmap_block(&path, volume, lbi));
        }
        other => error("main", format!("unknown subcommand {other:?}")),
    }
}
