//! `/proc/<pid>/maps` parsing, used to find where an executable was loaded.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};

use object::{Object, ObjectSegment};

use crate::error::LoadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub permissions: String,
    pub offset: u64,
    pub device: String,
    pub inode: u64,
    pub pathname: String,
}

pub fn parse_memory_mapping(line: &str) -> Option<MemoryMapping> {
    // Format: address perms offset dev inode pathname
    // Example: 559a9c400000-559a9c401000 r--p 00000000 103:02 2621487 /path/to/exe
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    let (start, end) = parts[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(parts[2], 16).ok()?;
    let inode = parts[4].parse::<u64>().ok()?;

    Some(MemoryMapping {
        start,
        end,
        permissions: parts[1].to_string(),
        offset,
        device: parts[3].to_string(),
        inode,
        pathname: parts[5..].join(" "),
    })
}

pub fn read_mappings(pid: i32) -> Result<Vec<MemoryMapping>, LoadError> {
    let maps_path = format!("/proc/{pid}/maps");
    let file = File::open(&maps_path).map_err(|source| LoadError::Io {
        path: maps_path.clone(),
        source,
    })?;

    let mut mappings = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| LoadError::Io {
            path: maps_path.clone(),
            source,
        })?;
        if let Some(mapping) = parse_memory_mapping(&line) {
            mappings.push(mapping);
        }
    }
    Ok(mappings)
}

/// Start of the first mapping of `executable` at file offset zero.
pub fn find_load_base(mappings: &[MemoryMapping], executable: &str) -> Option<u64> {
    mappings
        .iter()
        .find(|mapping| mapping.offset == 0 && mapping.pathname.trim_end_matches(" (deleted)") == executable)
        .map(|mapping| mapping.start)
}

/// Difference between where `pid` mapped its executable and where the
/// executable's lowest loadable segment was linked; zero for fixed-address
/// executables.
pub fn load_bias(pid: i32, executable_data: &[u8]) -> Result<u64, LoadError> {
    let exe_link = format!("/proc/{pid}/exe");
    let executable = fs::read_link(&exe_link).map_err(|source| LoadError::Io {
        path: exe_link.clone(),
        source,
    })?;
    let executable = executable.to_string_lossy();

    let mappings = read_mappings(pid)?;
    let base = find_load_base(&mappings, &executable).ok_or_else(|| LoadError::Maps {
        executable: executable.to_string(),
        maps: format!("/proc/{pid}/maps"),
    })?;

    let file = object::File::parse(executable_data)?;
    let linked = file
        .segments()
        .map(|segment| segment.address())
        .min()
        .unwrap_or(0);

    let bias = base.wrapping_sub(linked & !0xfff);
    log::debug!("{executable} mapped at {base:#x}, linked at {linked:#x}, bias {bias:#x}");
    Ok(bias)
}
