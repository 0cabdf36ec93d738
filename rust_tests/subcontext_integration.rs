//! Subcontext Integration Tests: image round trip, loader bookkeeping, and
//! matchmaker error paths that need a real process rather than a single
//! in-module unit test.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::sys::signal::Signal;
use nix::unistd::{fork, ForkResult};
use std::os::fd::RawFd;
use sbc_core::error::Error;
use sbc_core::image::RegionSpec;
use sbc_core::{image, matchmaker};
use tempfile::NamedTempFile;

fn page_size() -> u64 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

// Addresses well clear of anything this test binary or libc map on their
// own, so MAP_FIXED placements never collide with live mappings by chance.
const BASE_A: u64 = 0x60_0000_000000;
const BASE_B: u64 = 0x61_0000_000000;

fn write_nop_image(path: &std::path::Path, base: u64, func: u64) {
    let page = page_size();
    let data = vec![0x90u8; page as usize];
    let regions = vec![RegionSpec {
        start: base,
        end: base + page,
        perms: "rwxp".into(),
        data: Some(data),
    }];
    image::write(path, &[func], &regions).unwrap();
}

#[test]
fn loader_tracks_multiple_subcontexts_by_distinct_fd() {
    let page = page_size();
    let tmp_a = NamedTempFile::new().unwrap();
    let tmp_b = NamedTempFile::new().unwrap();
    write_nop_image(tmp_a.path(), BASE_A, BASE_A);
    write_nop_image(tmp_b.path(), BASE_B, BASE_B);

    let fd_a = matchmaker::request_map(tmp_a.path()).expect("map A");
    let fd_b = matchmaker::request_map(tmp_b.path()).expect("map B");
    assert_ne!(fd_a, fd_b);

    assert!(matches!(matchmaker::call(fd_a, 5, 0), Err(Error::BadIndex { .. })));
    assert!(matches!(matchmaker::call(fd_b, 5, 0), Err(Error::BadIndex { .. })));

    matchmaker::request_unmap(fd_a).expect("unmap A");
    matchmaker::request_unmap(fd_b).expect("unmap B");
    let _ = page;
}

#[test]
fn calling_an_unmapped_fd_reports_not_mapped() {
    let tmp = NamedTempFile::new().unwrap();
    write_nop_image(tmp.path(), BASE_A + 0x1000_0000, BASE_A + 0x1000_0000);
    let fd = matchmaker::request_map(tmp.path()).expect("map");
    matchmaker::request_unmap(fd).expect("unmap");

    let result = matchmaker::call(fd, 0, 0);
    assert!(matches!(result, Err(Error::NotMapped(got)) if got == fd as RawFd));
}

#[test]
fn overlap_with_a_region_from_a_prior_map_is_rejected() {
    let page = page_size();
    let base = BASE_A + 0x2000_0000;
    let tmp_first = NamedTempFile::new().unwrap();
    write_nop_image(tmp_first.path(), base, base);
    let fd_first = matchmaker::request_map(tmp_first.path()).expect("first map");

    // A second image claiming the exact same range must be refused rather
    // than silently double-mapped.
    let tmp_second = NamedTempFile::new().unwrap();
    write_nop_image(tmp_second.path(), base, base);
    let result = matchmaker::request_map(tmp_second.path());
    assert!(matches!(result, Err(Error::OverlapFatal { .. })));

    matchmaker::request_unmap(fd_first).expect("cleanup");
    let _ = page;
}

#[test]
fn exhausting_max_subcontexts_is_a_soft_error_with_no_side_effects() {
    const FAR_BASE: u64 = 0x62_0000_000000;
    let page = page_size();
    let mut tmps = Vec::new();
    let mut fds = Vec::new();

    for i in 0..sbc_core::matchmaker::MAX_SUBCONTEXTS {
        let tmp = NamedTempFile::new().unwrap();
        let base = FAR_BASE + (i as u64) * 0x1_0000_0000;
        write_nop_image(tmp.path(), base, base);
        let fd = matchmaker::request_map(tmp.path()).expect("map within capacity");
        fds.push(fd);
        tmps.push(tmp);
    }

    let overflow = NamedTempFile::new().unwrap();
    let overflow_base = FAR_BASE + (sbc_core::matchmaker::MAX_SUBCONTEXTS as u64) * 0x1_0000_0000;
    write_nop_image(overflow.path(), overflow_base, overflow_base);
    let result = matchmaker::request_map(overflow.path());
    assert!(matches!(result, Err(Error::ConfigTooLarge(_))));

    for fd in fds {
        matchmaker::request_unmap(fd).expect("cleanup");
    }
    let _ = page;
}

/// Hand-assembled x86-64 machine code for `fn(i32) -> i32 { x + 1 }` under
/// the System V calling convention (first argument in `edi`, return value in
/// `eax`):
///
/// ```text
/// mov eax, edi   89 f8
/// add eax, 1     83 c0 01
/// ret            c3
/// ```
///
/// Writing raw bytes rather than pointing at a compiled function is the only
/// way to get a known function body into an image without shelling out to a
/// C toolchain, which is exactly what the snapshotter's filtered-region
/// approach lets us skip for this test: we hand-construct the one region
/// that matters instead of capturing the whole test binary's address space.
#[cfg(target_arch = "x86_64")]
const ADD_ONE_CODE: [u8; 6] = [0x89, 0xf8, 0x83, 0xc0, 0x01, 0xc3];

/// Scenario #1 from the spec: a call into a subcontext faults on its first
/// instruction fetch (the region was mapped with exec stripped), the
/// matchmaker's handler flips page permissions and returns, the instruction
/// retries and this time succeeds, runs to completion, and its `ret` faults
/// *again* on the way back into client code — handled the same way, in
/// reverse — before the call finally returns its result to the caller.
///
/// This installs a process-wide `SIGSEGV` handler and repeatedly toggles
/// `PROT_EXEC` across the whole address space, which is only safe with one
/// application thread running. `cargo test` runs tests concurrently on
/// multiple threads of the *same* process by default, so this would corrupt
/// every other test's execution if run inline. We fork a disposable child
/// — which inherits only the calling thread — do the entire real call there,
/// and report success or failure through its exit status.
#[cfg(target_arch = "x86_64")]
#[test]
#[ignore = "forks a child that installs a process-wide SIGSEGV handler; run explicitly with --test-threads=1"]
fn real_executable_call_faults_into_subcontext_and_back() {
    const CALL_BASE: u64 = 0x63_0000_000000;
    let page = page_size();

    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let tmp = NamedTempFile::new().unwrap();
            let mut code = vec![0u8; page as usize];
            code[..ADD_ONE_CODE.len()].copy_from_slice(&ADD_ONE_CODE);
            let regions = vec![RegionSpec {
                start: CALL_BASE,
                end: CALL_BASE + page,
                perms: "r-xp".into(),
                data: Some(code),
            }];
            image::write(tmp.path(), &[CALL_BASE], &regions).expect("write image");

            matchmaker::init().expect("matchmaker init in child");
            let fd = matchmaker::request_map(tmp.path()).expect("map in child");
            let result = matchmaker::call(fd, 0, 41).expect("call should succeed");
            assert_eq!(result, 42, "add_one(41) should return 42");
            matchmaker::request_unmap(fd).expect("unmap in child");
            std::process::exit(0);
        }
        ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid") {
            WaitStatus::Exited(_, code) => assert_eq!(code, 0, "child assertions should pass"),
            other => panic!("expected child to exit cleanly, got {:?}", other),
        },
    }
}

/// Scenario: a fault at an address outside every known domain terminates
/// the process via SIGSEGV rather than looping or corrupting state. We
/// can't let that happen inside the test harness itself, so we fork a
/// disposable child, install the handler there, jump to an address that
/// belongs to no domain, and inspect the exit status from the parent.
#[test]
#[ignore = "forks and crashes a child process; run explicitly"]
fn wild_fault_outside_all_domains_terminates_the_process() {
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            matchmaker::init().expect("matchmaker init in child");
            // SAFETY: this is an intentionally invalid jump, taken only in
            // a disposable child whose sole purpose is to crash.
            let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(0x1usize) };
            let _ = f(0);
            std::process::exit(0); // unreachable if the fault behaves as expected
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None).expect("waitpid") {
                WaitStatus::Signaled(_, sig, _) => assert_eq!(sig, Signal::SIGSEGV),
                other => panic!("expected child to be killed by SIGSEGV, got {:?}", other),
            }
        }
    }
}
