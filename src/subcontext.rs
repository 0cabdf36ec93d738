//! Client-side subcontext loading: mapping an image's regions back into the
//! process at their original virtual addresses, and calling into them.
//!
//! A subcontext starts out mapped but inert: every region lands with its
//! exec bit stripped, even ones captured as executable, so that at most one
//! domain can execute at a time. The matchmaker is what flips the bit back
//! on, in response to a fault.

use crate::error::{Error, Result};
use crate::image::{self, ImageHeader, RegionEntry};
use crate::maps;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

/// A subcontext mapped into this process, identified by the fd of its
/// backing image file.
pub struct MappedSubcontext {
    file: File,
    base_addr: u64,
    total_size: u64,
    header: ImageHeader,
    pub active: bool,
}

impl MappedSubcontext {
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn regions(&self) -> &[RegionEntry] {
        &self.header.regions
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.header.regions.iter().any(|r| addr >= r.start && addr < r.end)
    }

    /// Strip exec from every region of this subcontext (back to its
    /// captured read/write bits, minus exec).
    pub fn quiesce(&mut self) -> Result<()> {
        for region in &self.header.regions {
            set_region_prot(region, without_exec(maps::perms_to_prot(&region.perms)))?;
        }
        self.active = false;
        Ok(())
    }

    /// Restore every region of this subcontext to its originally captured
    /// permissions (including exec, for the ones that had it).
    pub fn activate(&mut self) -> Result<()> {
        for region in &self.header.regions {
            set_region_prot(region, maps::perms_to_prot(&region.perms))?;
        }
        self.active = true;
        Ok(())
    }
}

fn without_exec(prot: ProtFlags) -> ProtFlags {
    prot & !ProtFlags::PROT_EXEC
}

fn set_region_prot(region: &RegionEntry, prot: ProtFlags) -> Result<()> {
    let len = (region.end - region.start) as usize;
    // SAFETY: `region.start` is the base of a mapping this subcontext
    // previously established at that exact address with `MAP_FIXED`; only
    // the protection bits change here.
    unsafe {
        nix::sys::mman::mprotect(
            std::ptr::NonNull::new(region.start as *mut std::ffi::c_void).unwrap(),
            len,
            prot,
        )
    }
    .map_err(|e| Error::MapFailed {
        range: crate::error::AddrRange {
            start: region.start,
            end: region.end,
        },
        source: e,
    })
}

/// Map every region of the image at `path` into the current process at its
/// original addresses.
///
/// Every region is first checked against the live address space via
/// `/proc/self/maps` (walked fresh, matching the original's per-call
/// re-scan); any overlap aborts the whole load before any region of it is
/// mapped, and a failure partway through a load unwinds the regions already
/// mapped by this same call.
pub fn map(path: &Path) -> Result<MappedSubcontext> {
    let header = image::read(path)?;
    // Opened read-write, not read-only: map_one_region below establishes a
    // MAP_SHARED mapping with PROT_WRITE set, which the kernel refuses on an
    // O_RDONLY fd regardless of the requested page protections.
    let file = OpenOptions::new().read(true).write(true).open(path)?;

    for region in &header.regions {
        if maps::check_for_overlap(Pid::this(), region.start, region.end)? {
            return Err(Error::OverlapFatal {
                range: crate::error::AddrRange {
                    start: region.start,
                    end: region.end,
                },
            });
        }
    }

    let mut mapped: Vec<&RegionEntry> = Vec::with_capacity(header.regions.len());
    for region in &header.regions {
        if let Err(e) = map_one_region(&file, region) {
            for done in &mapped {
                let len = (done.end - done.start) as usize;
                // SAFETY: `done.start` is a region we just mapped in this
                // same loop; we are unwinding after a later failure.
                let _ = unsafe {
                    nix::sys::mman::munmap(
                        std::ptr::NonNull::new(done.start as *mut std::ffi::c_void).unwrap(),
                        len,
                    )
                };
            }
            return Err(e);
        }
        mapped.push(region);
    }

    let (base_addr, total_size) = match (header.regions.first(), header.regions.last()) {
        (Some(first), Some(last)) => (first.start, last.end - first.start),
        _ => (0, 0),
    };

    Ok(MappedSubcontext {
        file,
        base_addr,
        total_size,
        header,
        active: false,
    })
}

fn map_one_region(file: &File, region: &RegionEntry) -> Result<()> {
    let len = (region.end - region.start) as usize;
    // Map read/write/exec first so the kernel accepts the fixed placement
    // regardless of the region's captured permissions, then immediately
    // strip down to the captured bits minus exec. Every subcontext region
    // starts inert; the matchmaker is the only thing that ever re-adds exec.
    //
    // SAFETY: `region.start` was previously unmapped, just verified against
    // the live `/proc/self/maps`; `file` is open and covers `file_offset..
    // file_offset+len`.
    let map_result = unsafe {
        nix::sys::mman::mmap(
            std::num::NonZeroUsize::new(region.start as usize),
            std::num::NonZeroUsize::new(len).unwrap_or(std::num::NonZeroUsize::new(1).unwrap()),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
            file.as_fd(),
            region.file_offset as libc::off_t,
        )
    };
    map_result.map_err(|e| Error::MapFailed {
        range: crate::error::AddrRange {
            start: region.start,
            end: region.end,
        },
        source: e,
    })?;

    set_region_prot(region, without_exec(maps::perms_to_prot(&region.perms)))
}

/// Call into a subcontext's function-entry table by index.
///
/// The caller is responsible for having activated this subcontext's
/// permissions (via the matchmaker) before the call; this function only
/// resolves the address and invokes it as a `fn(i32) -> i32`, matching the
/// calling convention the original image writer committed to.
///
/// # Safety
///
/// The resolved address must actually be a valid entry point with the
/// `fn(i32) -> i32` signature. There is no way to verify this from the
/// image alone.
pub unsafe fn call(subcontext: &MappedSubcontext, index: usize, arg: i32) -> Result<i32> {
    let addr = subcontext
        .header
        .resolve_func(index)
        .ok_or(Error::BadIndex {
            fd: subcontext.fd(),
            index,
        })?;
    let f: extern "C" fn(i32) -> i32 = std::mem::transmute(addr as usize);
    Ok(f(arg))
}

/// Unmap every region of a subcontext, releasing its virtual address range.
pub fn unmap(subcontext: MappedSubcontext) -> Result<()> {
    for region in &subcontext.header.regions {
        let len = (region.end - region.start) as usize;
        // SAFETY: these regions were mapped by `map` above and are being
        // torn down exactly once, here.
        unsafe {
            nix::sys::mman::munmap(
                std::ptr::NonNull::new(region.start as *mut std::ffi::c_void).unwrap(),
                len,
            )
        }
        .map_err(|e| Error::MapFailed {
            range: crate::error::AddrRange {
                start: region.start,
                end: region.end,
            },
            source: e,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::RegionSpec;
    use tempfile::NamedTempFile;

    // Picks an address range well clear of anything the test binary itself
    // has mapped, so MAP_FIXED has room to work with.
    const TEST_BASE: u64 = 0x70_0000_000000;

    fn page_size() -> u64 {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
    }

    #[test]
    fn map_then_call_then_unmap_round_trips() {
        let page = page_size();
        let tmp = NamedTempFile::new().unwrap();

        // This fixture only exercises resolve/activate/quiesce with a NOP
        // sled; the genuine fault-driven call (hand-assembled machine code,
        // a real SIGSEGV, the matchmaker flipping permissions mid-call) is
        // covered by `rust_tests/subcontext_integration.rs`'s forked
        // round-trip test, which can't run inside this process's own test
        // threads without installing a process-wide signal handler that
        // would affect every other test running concurrently.
        let data = vec![0x90u8; page as usize]; // NOP sled
        let regions = vec![RegionSpec {
            start: TEST_BASE,
            end: TEST_BASE + page,
            perms: "rwxp".into(),
            data: Some(data),
        }];
        image::write(tmp.path(), &[TEST_BASE], &regions).unwrap();

        let mut sub = map(tmp.path()).expect("map should succeed");
        assert!(!sub.active, "subcontext must start inert");
        assert!(sub.contains(TEST_BASE));

        sub.activate().expect("activate should succeed");
        assert!(sub.active);

        sub.quiesce().expect("quiesce should succeed");
        assert!(!sub.active);

        unmap(sub).expect("unmap should succeed");
    }

    #[test]
    fn map_rejects_overlap_with_live_mapping() {
        let page = page_size();
        let tmp = NamedTempFile::new().unwrap();

        // Reserve the range ourselves first so the loader's overlap check
        // sees it as already occupied.
        let reserved = unsafe {
            nix::sys::mman::mmap_anonymous(
                std::num::NonZeroUsize::new((TEST_BASE + 0x10_0000_0000) as usize),
                std::num::NonZeroUsize::new(page as usize).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
            )
        }
        .expect("reservation mmap should succeed");

        let regions = vec![RegionSpec {
            start: TEST_BASE + 0x10_0000_0000,
            end: TEST_BASE + 0x10_0000_0000 + page,
            perms: "rw-p".into(),
            data: None,
        }];
        image::write(tmp.path(), &[], &regions).unwrap();

        let result = map(tmp.path());
        assert!(matches!(result, Err(Error::OverlapFatal { .. })));

        unsafe {
            let _ = nix::sys::mman::munmap(reserved, page as usize);
        }
    }

    #[test]
    fn bad_index_is_reported() {
        let page = page_size();
        let tmp = NamedTempFile::new().unwrap();
        let regions = vec![RegionSpec {
            start: TEST_BASE + 0x20_0000_0000,
            end: TEST_BASE + 0x20_0000_0000 + page,
            perms: "rw-p".into(),
            data: None,
        }];
        image::write(tmp.path(), &[], &regions).unwrap();
        let sub = map(tmp.path()).unwrap();
        let result = unsafe { call(&sub, 0, 0) };
        assert!(matches!(result, Err(Error::BadIndex { .. })));
        unmap(sub).unwrap();
    }
}
