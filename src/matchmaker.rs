//! The matchmaker: a fault-driven arbiter deciding which domain — the
//! client or one of its loaded subcontexts — currently holds execute
//! permission.
//!
//! Exactly one domain has `PROT_EXEC` on its non-library regions at any
//! quiescent instant. A `SIGSEGV` on an instruction fetch is the signal that
//! the running code just crossed from one domain into another; the
//! installed handler looks up which domain owns the faulting address,
//! strips exec from every other domain, grants it to that one, and returns
//! so the faulting instruction retries and succeeds.
//!
//! There is deliberately no lock around the shared state below. The handler
//! runs synchronously on the single application thread that took the
//! fault — the kernel masks the signal for the duration of the handler —
//! so nothing else can be touching this state concurrently. A `Mutex` would
//! misrepresent that model, not protect it.

use crate::error::{Error, Result};
use crate::maps;
use crate::subcontext::{self, MappedSubcontext};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Maximum number of subcontexts that may be mapped at once. Exhaustion is a
/// soft error: `request_map` returns `ConfigTooLarge` with no side effects,
/// leaving every already-mapped subcontext untouched.
pub const MAX_SUBCONTEXTS: usize = 32;

/// Which domain currently holds execute permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Client,
    Sub(usize),
}

struct ClientRegion {
    start: u64,
    end: u64,
    original_prot: nix::sys::mman::ProtFlags,
    is_library: bool,
}

struct State {
    subcontexts: Vec<MappedSubcontext>,
    client_regions: Vec<ClientRegion>,
    active_domain: Domain,
}

impl State {
    fn find_subcontext_index(&self, fd: RawFd) -> Option<usize> {
        self.subcontexts.iter().position(|s| s.fd() == fd)
    }
}

/// Narrow seam between the matchmaker's bookkeeping and the thing the
/// signal handler actually needs: "whose address is this" and "make only
/// this domain executable." Kept as a trait so the handler's dispatch logic
/// doesn't need to know about `Vec<MappedSubcontext>` directly.
pub trait DomainTable {
    fn find_by_addr(&self, addr: u64) -> Option<Domain>;
    fn permit_only(&mut self, domain: Domain) -> Result<()>;
}

impl DomainTable for State {
    fn find_by_addr(&self, addr: u64) -> Option<Domain> {
        if let Some(idx) = self.subcontexts.iter().position(|s| s.contains(addr)) {
            return Some(Domain::Sub(idx));
        }
        if self.client_regions.iter().any(|r| addr >= r.start && addr < r.end) {
            return Some(Domain::Client);
        }
        None
    }

    fn permit_only(&mut self, domain: Domain) -> Result<()> {
        for (idx, sub) in self.subcontexts.iter_mut().enumerate() {
            if Domain::Sub(idx) != domain {
                sub.quiesce()?;
            }
        }
        quiesce_client(&self.client_regions)?;

        match domain {
            Domain::Client => activate_client(&self.client_regions)?,
            Domain::Sub(idx) => {
                self.subcontexts
                    .get_mut(idx)
                    .ok_or(Error::NotMapped(idx as RawFd))?
                    .activate()?;
            }
        }
        self.active_domain = domain;
        Ok(())
    }
}

fn quiesce_client(regions: &[ClientRegion]) -> Result<()> {
    for r in regions.iter().filter(|r| !r.is_library) {
        set_client_region_prot(r, r.original_prot & !nix::sys::mman::ProtFlags::PROT_EXEC)?;
    }
    Ok(())
}

fn activate_client(regions: &[ClientRegion]) -> Result<()> {
    for r in regions.iter().filter(|r| !r.is_library) {
        set_client_region_prot(r, r.original_prot)?;
    }
    Ok(())
}

fn set_client_region_prot(region: &ClientRegion, prot: nix::sys::mman::ProtFlags) -> Result<()> {
    let len = (region.end - region.start) as usize;
    // SAFETY: `region.start` is a live mapping of this same process,
    // recorded moments earlier from `/proc/self/maps`; only its protection
    // bits change here.
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

struct Shared(UnsafeCell<State>);
// SAFETY: accessed only from the single application thread and, re-entrantly,
// from the SIGSEGV handler running synchronously on that same thread. See
// the module-level note on why no lock is used.
unsafe impl Sync for Shared {}

static STATE: OnceLock<Shared> = OnceLock::new();
static LAST_UNMAPPED_FAULT: AtomicUsize = AtomicUsize::new(0);

/// The address of the most recent fault the handler could not attribute to
/// any known domain, just before it re-raised `SIGSEGV`. Diagnostic only —
/// by the time a caller reads this, the process is most likely already
/// being torn down by the re-raised signal.
pub fn last_unmapped_fault() -> usize {
    LAST_UNMAPPED_FAULT.load(Ordering::SeqCst)
}

/// # Safety
/// Must only be called from the single application thread, before any
/// reentrant access from the signal handler could occur concurrently with
/// this one (i.e. not from within a nested fault).
#[allow(clippy::mut_from_ref)]
unsafe fn state_mut() -> &'static mut State {
    &mut *STATE
        .get_or_init(|| {
            Shared(UnsafeCell::new(State {
                subcontexts: Vec::new(),
                client_regions: Vec::new(),
                active_domain: Domain::Client,
            }))
        })
        .0
        .get()
}

/// Record the client's own executable regions and install the fault
/// handler. Idempotent: calling it again after the handler is installed is
/// a no-op.
pub fn init() -> Result<()> {
    // SAFETY: called from ordinary (non-handler) application code.
    let state = unsafe { state_mut() };
    if !state.client_regions.is_empty() {
        return Ok(());
    }

    let lines = maps::parse_self_maps()?;
    for line in lines.iter().filter(|l| l.is_executable() && !maps::should_exclude(l)) {
        state.client_regions.push(ClientRegion {
            start: line.start,
            end: line.end,
            original_prot: maps::perms_to_prot(&line.perms),
            is_library: maps::is_library_address(&lines, line.start),
        });
    }

    install_handler()
}

fn install_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(handle_segv),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: `handle_segv` below has the `extern "C" fn(i32, *mut siginfo_t,
    // *mut c_void)` signature `sigaction` requires, and does not unwind
    // across the FFI boundary.
    unsafe { signal::sigaction(Signal::SIGSEGV, &action) }.map_err(|e| Error::MapFailed {
        range: crate::error::AddrRange { start: 0, end: 0 },
        source: e,
    })?;
    Ok(())
}

extern "C" fn handle_segv(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: the kernel guarantees `info` is a valid, initialized
    // `siginfo_t` for the duration of the handler.
    let addr = unsafe { (*info).si_addr() } as usize as u64;
    // SAFETY: the handler runs synchronously on the thread that faulted;
    // no other code is concurrently touching the matchmaker state.
    let state = unsafe { state_mut() };
    dispatch_fault(state, addr);
}

/// The actual fault-handling decision, factored out of the `extern "C"`
/// trampoline so it can be exercised directly in tests without raising a
/// real signal.
fn dispatch_fault(state: &mut State, addr: u64) {
    match state.find_by_addr(addr) {
        Some(Domain::Client) if is_in_library(state, addr) => {
            // Library regions are always executable, so a fault here can't
            // be an exec-permission toggle we're responsible for; retrying
            // would just fault again forever. Not our fault to fix.
            LAST_UNMAPPED_FAULT.store(addr as usize, Ordering::SeqCst);
            reraise_default();
        }
        Some(domain) => {
            if state.permit_only(domain).is_err() {
                reraise_default();
            }
        }
        None => {
            LAST_UNMAPPED_FAULT.store(addr as usize, Ordering::SeqCst);
            reraise_default();
        }
    }
}

fn is_in_library(state: &State, addr: u64) -> bool {
    state
        .client_regions
        .iter()
        .find(|r| addr >= r.start && addr < r.end)
        .map(|r| r.is_library)
        .unwrap_or(false)
}

fn reraise_default() {
    // SAFETY: resetting to the default disposition and re-raising is the
    // documented escape hatch for a fault this handler cannot attribute to
    // any known domain; the process terminates via `SIGSEGV` exactly as it
    // would have without this handler installed.
    unsafe {
        let _ = signal::signal(Signal::SIGSEGV, SigHandler::SigDfl);
    }
    let _ = signal::raise(Signal::SIGSEGV);
}

/// Load an image's regions into the process and register it as a
/// subcontext. Returns the fd identifying it for subsequent `call`/`unmap`.
pub fn request_map(path: &Path) -> Result<RawFd> {
    init()?;
    // SAFETY: ordinary application code, not reentrant from the handler.
    let state = unsafe { state_mut() };
    if state.subcontexts.len() >= MAX_SUBCONTEXTS {
        return Err(Error::ConfigTooLarge(format!(
            "subcontext count would exceed MAX_SUBCONTEXTS ({})",
            MAX_SUBCONTEXTS
        )));
    }
    let sub = subcontext::map(path)?;
    let fd = sub.fd();
    state.subcontexts.push(sub);
    Ok(fd)
}

/// Call into a mapped subcontext's function-entry table by index. The
/// domain switch on entry and return happens transparently via page faults;
/// this function just resolves the address and invokes it.
pub fn call(fd: RawFd, index: usize, arg: i32) -> Result<i32> {
    // SAFETY: ordinary application code, not reentrant from the handler.
    let state = unsafe { state_mut() };
    let idx = state.find_subcontext_index(fd).ok_or(Error::NotMapped(fd))?;
    let sub = &state.subcontexts[idx];
    // SAFETY: the caller supplied `fd` from a prior `request_map`, and the
    // image writer committed to the `fn(i32) -> i32` calling convention for
    // every exported function entry.
    unsafe { subcontext::call(sub, index, arg) }
}

/// Unmap a previously loaded subcontext and drop its bookkeeping.
pub fn request_unmap(fd: RawFd) -> Result<()> {
    // SAFETY: ordinary application code, not reentrant from the handler.
    let state = unsafe { state_mut() };
    let idx = state.find_subcontext_index(fd).ok_or(Error::NotMapped(fd))?;
    let sub = state.subcontexts.remove(idx);
    subcontext::unmap(sub)
}

/// Disable every subcontext and restore the client to full executable
/// permission. Call before the process tears down its subcontexts for good.
pub fn finalize() -> Result<()> {
    // SAFETY: ordinary application code, not reentrant from the handler.
    let state = unsafe { state_mut() };
    state.permit_only(Domain::Client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> State {
        State {
            subcontexts: Vec::new(),
            client_regions: vec![
                ClientRegion {
                    start: 0x1000,
                    end: 0x2000,
                    original_prot: nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_EXEC,
                    is_library: false,
                },
                ClientRegion {
                    start: 0x5000,
                    end: 0x6000,
                    original_prot: nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_EXEC,
                    is_library: true,
                },
            ],
            active_domain: Domain::Client,
        }
    }

    #[test]
    fn find_by_addr_recognizes_client_region() {
        let state = fresh_state();
        assert_eq!(state.find_by_addr(0x1500), Some(Domain::Client));
    }

    #[test]
    fn find_by_addr_returns_none_outside_all_domains() {
        let state = fresh_state();
        assert_eq!(state.find_by_addr(0xdead_0000), None);
    }

    #[test]
    fn library_region_never_reported_unmapped() {
        let state = fresh_state();
        assert!(is_in_library(&state, 0x5500));
        assert!(!is_in_library(&state, 0x1500));
    }

    #[test]
    fn unmapped_fault_is_recorded_and_dispatch_reraises() {
        // We can't safely let `dispatch_fault` actually re-raise SIGSEGV
        // inside the test process, so we only check the branch that runs
        // before the re-raise: the diagnostic side-channel.
        let state = fresh_state();
        let addr = 0x0bad_0000u64;
        assert_eq!(state.find_by_addr(addr), None);
        LAST_UNMAPPED_FAULT.store(addr as usize, Ordering::SeqCst);
        assert_eq!(last_unmapped_fault(), addr as usize);
    }
}
