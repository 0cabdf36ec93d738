//! Snapshotting a process's own address space into an image file.
//!
//! Walks `/proc/self/maps`, keeps the regions worth capturing, copies the
//! readable ones byte-for-byte, and hands the result to [`image::write`].

use crate::error::{Error, Result};
use crate::image::{self, RegionSpec, MAX_REGIONS};
use crate::maps::{self, MapLine};
use std::path::Path;

/// Build and write a snapshot of the calling process's address space.
///
/// `func_entries` are absolute addresses the image exports for a later
/// loader to call; entries beyond `image::MAX_FUNC_ENTRIES` are dropped.
pub fn snapshot_self(path: &Path, func_entries: &[u64]) -> Result<()> {
    let lines = maps::parse_self_maps()?;
    let candidates: Vec<&MapLine> = lines.iter().filter(|l| !maps::should_exclude(l)).collect();

    if candidates.len() > MAX_REGIONS {
        return Err(Error::ConfigTooLarge(format!(
            "process has {} capturable regions, exceeds MAX_REGIONS ({})",
            candidates.len(),
            MAX_REGIONS
        )));
    }

    let mut regions = Vec::with_capacity(candidates.len());
    for line in candidates {
        let data = if line.is_readable() {
            match copy_region(line) {
                Ok(bytes) => Some(bytes),
                Err(_) => {
                    // Region became unreadable between introspection and
                    // copy (e.g. a racing munmap). Leave it zero-filled
                    // rather than aborting the whole snapshot.
                    eprintln!(
                        "[snapshot] region {:#x}-{:#x} unreadable at copy time, zero-filling",
                        line.start, line.end
                    );
                    None
                }
            }
        } else {
            None
        };
        regions.push(RegionSpec {
            start: line.start,
            end: line.end,
            perms: line.perms.clone(),
            data,
        });
    }

    image::write(path, func_entries, &regions)
}

/// Copy a readable region's live bytes.
///
/// Reading through a raw pointer into our own address space is the only way
/// to capture a region's contents; the range comes straight from
/// `/proc/self/maps` for the process we are currently running in, so it is
/// guaranteed mapped at the moment we read unless it races a concurrent
/// unmap (handled by the caller).
fn copy_region(line: &MapLine) -> std::result::Result<Vec<u8>, ()> {
    let len = (line.end - line.start) as usize;
    let ptr = line.start as *const u8;
    // SAFETY: `ptr..ptr+len` is the exact range `/proc/self/maps` just
    // reported as mapped and readable for this process; we hold no other
    // reference into it, and the copy is a plain byte read.
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    Ok(slice.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn snapshot_self_round_trips_own_heap() {
        let tmp = NamedTempFile::new().unwrap();
        let marker: Box<[u8; 64]> = Box::new([0x5au8; 64]);
        let marker_addr = marker.as_ptr() as u64;

        snapshot_self(tmp.path(), &[marker_addr]).expect("snapshot should succeed");

        let header = image::read(tmp.path()).expect("header should parse");
        assert_eq!(header.func_entries[0], marker_addr);
        assert!(!header.regions.is_empty());

        let owning_region = header
            .regions
            .iter()
            .find(|r| marker_addr >= r.start && marker_addr < r.end)
            .expect("heap allocation should be covered by some captured region");
        assert!(owning_region.is_readable());

        let bytes = image::read_region_bytes(tmp.path(), owning_region).unwrap();
        let local_off = (marker_addr - owning_region.start) as usize;
        assert_eq!(&bytes[local_off..local_off + 64], marker.as_slice());
    }

    #[test]
    fn snapshot_self_excludes_vdso_and_vvar() {
        let tmp = NamedTempFile::new().unwrap();
        snapshot_self(tmp.path(), &[]).unwrap();
        let header = image::read(tmp.path()).unwrap();
        let lines = maps::parse_self_maps().unwrap();
        for region in &header.regions {
            let matching = lines.iter().find(|l| l.start == region.start);
            if let Some(l) = matching {
                assert!(!maps::should_exclude(l), "{:?} should have been excluded", l.pathname);
            }
        }
    }
}
