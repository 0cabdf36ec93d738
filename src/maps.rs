//! Process memory-map introspection: parsing `/proc/{pid}/maps`.
//!
//! Format: `start-end perms offset dev:inode pathname`, e.g.
//! `7f1234560000-7f1234580000 rw-p 00000000 00:00 0 [heap]`.

use crate::error::{Error, Result};
use nix::sys::mman::ProtFlags;
use nix::unistd::Pid;
use std::fs;

/// One line of `/proc/{pid}/maps`, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapLine {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub pathname: String,
}

impl MapLine {
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    pub fn is_readable(&self) -> bool {
        self.perms.as_bytes().first() == Some(&b'r')
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Regions the snapshotter must never include and the matchmaker must never
/// touch the permissions of: kernel-installed, architecture-dependent, or
/// unsafe to `mprotect`.
const EXCLUDED_MARKERS: [&str; 5] = ["[vvar]", "[vdso]", "[vvar_vclock]", "[stack]", "[vsyscall]"];

/// Substrings identifying shared-library or kernel-pseudo mappings, which
/// the matchmaker leaves permanently executable.
const LIBRARY_MARKERS: [&str; 5] = [".so", "libc", "ld-", "[vdso]", "[vvar]"];

/// Parse `/proc/{pid}/maps` into structured lines.
pub fn parse_maps(pid: Pid) -> Result<Vec<MapLine>> {
    let path = format!("/proc/{}/maps", pid);
    let content = fs::read_to_string(&path)?;
    Ok(content.lines().filter_map(parse_line).collect())
}

/// Parse `/proc/self/maps` for the calling process.
pub fn parse_self_maps() -> Result<Vec<MapLine>> {
    parse_maps(Pid::this())
}

fn parse_line(line: &str) -> Option<MapLine> {
    let mut parts = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let addr_range = parts.next()?;
    let perms = parts.next()?;
    let (start_hex, end_hex) = addr_range.split_once('-')?;
    let start = u64::from_str_radix(start_hex, 16).ok()?;
    let end = u64::from_str_radix(end_hex, 16).ok()?;

    // Re-split on whitespace to reliably find the trailing pathname column,
    // since the fixed-position splitn above can't skip the offset/dev/inode
    // fields without knowing their exact widths.
    let fields: Vec<&str> = line.split_whitespace().collect();
    let pathname = fields.get(5..).map(|p| p.join(" ")).unwrap_or_default();

    Some(MapLine {
        start,
        end,
        perms: perms.to_string(),
        pathname,
    })
}

/// Should this mapping be excluded from a snapshot or from the client's
/// recorded executable-region table?
pub fn should_exclude(line: &MapLine) -> bool {
    EXCLUDED_MARKERS.iter().any(|m| line.pathname.contains(m))
}

/// Is the mapping containing `addr` backed by a shared library or kernel
/// pseudo-mapping? Such regions are never toggled by the matchmaker.
pub fn is_library_address(lines: &[MapLine], addr: u64) -> bool {
    lines
        .iter()
        .find(|l| l.contains(addr))
        .map(|l| LIBRARY_MARKERS.iter().any(|m| l.pathname.contains(m)))
        .unwrap_or(false)
}

/// Does `[start, end)` overlap any currently mapped region of the process?
pub fn check_for_overlap(pid: Pid, start: u64, end: u64) -> Result<bool> {
    let lines = parse_maps(pid)?;
    Ok(lines.iter().any(|l| start < l.end && end > l.start))
}

/// Convert a 4-character permission string (`r|-`, `w|-`, `x|-`, `p|s`) to
/// `mprotect`/`mmap` protection flags (the `p|s` share/private bit is not
/// representable in `ProtFlags` and is ignored here).
pub fn perms_to_prot(perms: &str) -> ProtFlags {
    let b = perms.as_bytes();
    let mut prot = ProtFlags::PROT_NONE;
    if b.first() == Some(&b'r') {
        prot |= ProtFlags::PROT_READ;
    }
    if b.get(1) == Some(&b'w') {
        prot |= ProtFlags::PROT_WRITE;
    }
    if b.get(2) == Some(&b'x') {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

pub fn ensure_not_over_capacity(count: usize, max: usize, what: &str) -> Result<()> {
    if count > max {
        return Err(Error::ConfigTooLarge(format!(
            "{} count {} exceeds capacity {}",
            what, count, max
        )));
    }
    Ok(())
}
