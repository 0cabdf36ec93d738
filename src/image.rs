//! The on-disk image format: header, region table, per-region data.
//!
//! Binary, little-endian, host-word-sized (we always encode as `u64`, since
//! every host this crate targets is 64-bit). Layout:
//!
//! ```text
//! [ func_entries: u64 x MAX_FUNC_ENTRIES ]
//! [ num_regions: u64 ]
//! [ regions: RegionEntry x MAX_REGIONS ]  <- padded to a page boundary
//! [ region[0] bytes, page-padded ]
//! [ region[1] bytes, page-padded ]
//! ...
//! ```
//!
//! The header always reserves the full `MAX_REGIONS`-sized table so that
//! `file_offset` values for the data sections are stable regardless of how
//! many regions a particular image actually populates.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Maximum number of exported function-entry addresses per image.
pub const MAX_FUNC_ENTRIES: usize = 16;
/// Maximum number of captured regions per image.
pub const MAX_REGIONS: usize = 1024;

const REGION_ENTRY_BYTES: usize = 32; // start(8) + end(8) + file_offset(8) + perms(5) + pad(3)

fn page_size() -> u64 {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions and always succeeds
    // on a sane host.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// One captured memory region, as recorded in the image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEntry {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub perms: String,
}

impl RegionEntry {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn is_readable(&self) -> bool {
        self.perms.as_bytes().first() == Some(&b'r')
    }

    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }
}

fn encode_region(entry: &RegionEntry, out: &mut [u8]) {
    debug_assert_eq!(out.len(), REGION_ENTRY_BYTES);
    out[0..8].copy_from_slice(&entry.start.to_le_bytes());
    out[8..16].copy_from_slice(&entry.end.to_le_bytes());
    out[16..24].copy_from_slice(&entry.file_offset.to_le_bytes());
    let perm_bytes = entry.perms.as_bytes();
    let n = perm_bytes.len().min(4);
    out[24..24 + n].copy_from_slice(&perm_bytes[..n]);
    // out[24+n..32] stays zero: NUL padding + reserved tail.
}

fn decode_region(buf: &[u8]) -> RegionEntry {
    let start = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let end = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let file_offset = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let perm_end = buf[24..29].iter().position(|&b| b == 0).unwrap_or(4);
    let perms = String::from_utf8_lossy(&buf[24..24 + perm_end]).into_owned();
    RegionEntry {
        start,
        end,
        file_offset,
        perms,
    }
}

/// A region queued for inclusion in a new image: its metadata plus, if
/// readable, its live bytes. Non-readable regions get a zero-filled slot.
pub struct RegionSpec {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub data: Option<Vec<u8>>,
}

/// Parsed image header: the exported function-entry table and the region
/// table (only the populated prefix, i.e. `num_regions` entries).
#[derive(Debug, Clone)]
pub struct ImageHeader {
    pub func_entries: [u64; MAX_FUNC_ENTRIES],
    pub regions: Vec<RegionEntry>,
}

impl ImageHeader {
    /// Resolve a function-entry index to an address, verifying it is
    /// non-null and lies within some executable region of this header.
    pub fn resolve_func(&self, index: usize) -> Option<u64> {
        let addr = *self.func_entries.get(index)?;
        if addr == 0 {
            return None;
        }
        let in_exec_region = self
            .regions
            .iter()
            .any(|r| r.is_executable() && addr >= r.start && addr < r.end);
        in_exec_region.then_some(addr)
    }
}

fn header_table_size() -> u64 {
    (MAX_FUNC_ENTRIES as u64) * 8 + 8 + (MAX_REGIONS as u64) * (REGION_ENTRY_BYTES as u64)
}

fn header_section_size() -> u64 {
    round_up(header_table_size(), page_size())
}

/// Write a new image file: header, region table, and per-region bytes
/// (zero-filled for non-readable regions).
pub fn write(path: &Path, func_entries: &[u64], regions: &[RegionSpec]) -> Result<()> {
    if regions.len() > MAX_REGIONS {
        return Err(Error::ConfigTooLarge(format!(
            "region count {} exceeds MAX_REGIONS ({})",
            regions.len(),
            MAX_REGIONS
        )));
    }
    let page = page_size();
    let header_size = header_section_size();

    let mut offsets = Vec::with_capacity(regions.len());
    let mut cursor = header_size;
    for region in regions {
        if region.end <= region.start {
            return Err(Error::ConfigTooLarge(format!(
                "region {:#x}-{:#x} is empty or inverted",
                region.start, region.end
            )));
        }
        offsets.push(cursor);
        cursor += round_up(region.end - region.start, page);
    }
    let total_size = cursor;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(total_size)?;

    // SAFETY: `file` is open for read+write for the duration of the mapping,
    // and we unmap before the function returns.
    let map = unsafe {
        nix::sys::mman::mmap(
            None,
            std::num::NonZeroUsize::new(total_size as usize).unwrap(),
            nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
            nix::sys::mman::MapFlags::MAP_SHARED,
            &file,
            0,
        )
    }
    .map_err(|e| Error::MapFailed {
        range: crate::error::AddrRange { start: 0, end: total_size },
        source: e,
    })?;

    let buf = unsafe { std::slice::from_raw_parts_mut(map.as_ptr() as *mut u8, total_size as usize) };
    buf.fill(0);

    let mut truncated_funcs = [0u64; MAX_FUNC_ENTRIES];
    for (i, &addr) in func_entries.iter().take(MAX_FUNC_ENTRIES).enumerate() {
        truncated_funcs[i] = addr;
    }
    for (i, addr) in truncated_funcs.iter().enumerate() {
        buf[i * 8..i * 8 + 8].copy_from_slice(&addr.to_le_bytes());
    }
    let num_regions_off = MAX_FUNC_ENTRIES * 8;
    buf[num_regions_off..num_regions_off + 8].copy_from_slice(&(regions.len() as u64).to_le_bytes());

    let table_off = num_regions_off + 8;
    for (i, (region, file_offset)) in regions.iter().zip(offsets.iter()).enumerate() {
        let entry = RegionEntry {
            start: region.start,
            end: region.end,
            file_offset: *file_offset,
            perms: region.perms.clone(),
        };
        let entry_off = table_off + i * REGION_ENTRY_BYTES;
        encode_region(&entry, &mut buf[entry_off..entry_off + REGION_ENTRY_BYTES]);

        if region.is_readable_spec() {
            if let Some(data) = &region.data {
                let dst = *file_offset as usize;
                buf[dst..dst + data.len()].copy_from_slice(data);
            }
        }
    }

    // SAFETY: `map` was obtained from `mmap` above with matching length.
    unsafe { nix::sys::mman::munmap(map, total_size as usize) }.map_err(|e| Error::MapFailed {
        range: crate::error::AddrRange { start: 0, end: total_size },
        source: e,
    })?;
    drop(file);
    Ok(())
}

impl RegionSpec {
    fn is_readable_spec(&self) -> bool {
        self.perms.as_bytes().first() == Some(&b'r')
    }
}

/// Read and parse an image's header (function-entry table + region table).
pub fn read(path: &Path) -> Result<ImageHeader> {
    let mut file = File::open(path)?;
    let header_size = header_section_size();
    let mut buf = vec![0u8; header_size as usize];
    file.read_exact(&mut buf)?;

    let mut func_entries = [0u64; MAX_FUNC_ENTRIES];
    for i in 0..MAX_FUNC_ENTRIES {
        func_entries[i] = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
    }

    let num_regions_off = MAX_FUNC_ENTRIES * 8;
    let num_regions = u64::from_le_bytes(buf[num_regions_off..num_regions_off + 8].try_into().unwrap()) as usize;
    if num_regions > MAX_REGIONS {
        return Err(Error::ConfigTooLarge(format!(
            "image claims {} regions, exceeds MAX_REGIONS ({})",
            num_regions, MAX_REGIONS
        )));
    }

    let table_off = num_regions_off + 8;
    let mut regions = Vec::with_capacity(num_regions);
    for i in 0..num_regions {
        let off = table_off + i * REGION_ENTRY_BYTES;
        regions.push(decode_region(&buf[off..off + REGION_ENTRY_BYTES]));
    }

    Ok(ImageHeader {
        func_entries,
        regions,
    })
}

/// Read the raw bytes of one region's data slot, for verifying round-trips.
pub fn read_region_bytes(path: &Path, entry: &RegionEntry) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(entry.file_offset))?;
    let mut buf = vec![0u8; entry.len() as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn page() -> u64 {
        page_size()
    }

    #[test]
    fn round_trip_single_readable_region() {
        let tmp = NamedTempFile::new().unwrap();
        let region_len = page();
        let data: Vec<u8> = (0..region_len).map(|i| (i % 251) as u8).collect();

        let regions = vec![RegionSpec {
            start: 0x10_0000_0000,
            end: 0x10_0000_0000 + region_len,
            perms: "rw-p".into(),
            data: Some(data.clone()),
        }];

        write(tmp.path(), &[0xdead_beef], &regions).unwrap();
        let header = read(tmp.path()).unwrap();

        assert_eq!(header.func_entries[0], 0xdead_beef);
        assert_eq!(header.regions.len(), 1);
        assert_eq!(header.regions[0].start, 0x10_0000_0000);
        assert_eq!(header.regions[0].end, 0x10_0000_0000 + region_len);

        let bytes = read_region_bytes(tmp.path(), &header.regions[0]).unwrap();
        assert_eq!(bytes, data);
    }

    #[test]
    fn non_readable_region_is_zero_filled() {
        let tmp = NamedTempFile::new().unwrap();
        let region_len = page();
        let regions = vec![RegionSpec {
            start: 0x20_0000_0000,
            end: 0x20_0000_0000 + region_len,
            perms: "-w-p".into(),
            data: None,
        }];
        write(tmp.path(), &[], &regions).unwrap();
        let header = read(tmp.path()).unwrap();
        let bytes = read_region_bytes(tmp.path(), &header.regions[0]).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn multiple_regions_get_disjoint_page_aligned_offsets() {
        let tmp = NamedTempFile::new().unwrap();
        let len = page();
        let regions = vec![
            RegionSpec {
                start: 0x1000,
                end: 0x1000 + len,
                perms: "rw-p".into(),
                data: Some(vec![1u8; len as usize]),
            },
            RegionSpec {
                start: 0x2000,
                end: 0x2000 + len,
                perms: "r-xp".into(),
                data: Some(vec![2u8; len as usize]),
            },
        ];
        write(tmp.path(), &[], &regions).unwrap();
        let header = read(tmp.path()).unwrap();
        assert_eq!(header.regions.len(), 2);
        assert_ne!(header.regions[0].file_offset, header.regions[1].file_offset);
        assert_eq!(header.regions[0].file_offset % page(), 0);
        assert_eq!(header.regions[1].file_offset % page(), 0);

        let b0 = read_region_bytes(tmp.path(), &header.regions[0]).unwrap();
        let b1 = read_region_bytes(tmp.path(), &header.regions[1]).unwrap();
        assert!(b0.iter().all(|&b| b == 1));
        assert!(b1.iter().all(|&b| b == 2));
    }

    #[test]
    fn func_entries_beyond_capacity_are_silently_dropped() {
        let tmp = NamedTempFile::new().unwrap();
        let many: Vec<u64> = (0..32).map(|i| i + 1).collect();
        write(tmp.path(), &many, &[]).unwrap();
        let header = read(tmp.path()).unwrap();
        assert_eq!(header.func_entries.len(), MAX_FUNC_ENTRIES);
        assert_eq!(header.func_entries[0], 1);
        assert_eq!(header.func_entries[MAX_FUNC_ENTRIES - 1], MAX_FUNC_ENTRIES as u64);
    }

    #[test]
    fn too_many_regions_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let regions: Vec<RegionSpec> = (0..MAX_REGIONS + 1)
            .map(|i| RegionSpec {
                start: (i as u64) * 0x10000,
                end: (i as u64) * 0x10000 + page(),
                perms: "rw-p".into(),
                data: None,
            })
            .collect();
        assert!(write(tmp.path(), &[], &regions).is_err());
    }

    #[test]
    fn resolve_func_rejects_null_and_out_of_region() {
        let header = ImageHeader {
            func_entries: {
                let mut f = [0u64; MAX_FUNC_ENTRIES];
                f[0] = 0x5000; // not inside any region below
                f[1] = 0; // null
                f
            },
            regions: vec![RegionEntry {
                start: 0x1000,
                end: 0x2000,
                file_offset: 0,
                perms: "r-xp".into(),
            }],
        };
        assert_eq!(header.resolve_func(0), None);
        assert_eq!(header.resolve_func(1), None);
        assert_eq!(header.resolve_func(99), None);
    }

    #[test]
    fn resolve_func_accepts_address_inside_executable_region() {
        let header = ImageHeader {
            func_entries: {
                let mut f = [0u64; MAX_FUNC_ENTRIES];
                f[0] = 0x1234;
                f
            },
            regions: vec![RegionEntry {
                start: 0x1000,
                end: 0x2000,
                file_offset: 0,
                perms: "r-xp".into(),
            }],
        };
        assert_eq!(header.resolve_func(0), Some(0x1234));
    }
}
