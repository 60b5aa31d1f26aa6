//! Signal-safe force cleanup.
//!
//! The registry is a set of fixed-size static atomics: the pids of live
//! worker processes, the name of the shared segment and the mapped arena. A signal handler can
//! read it without allocating or locking. The first SIGINT/SIGTERM only sets
//! a flag that the supervisor polls; the second one kills every registered
//! child, marks every worker state forced-exited, unlinks the segment and
//! exits immediately.
//!
//! `force_cleanup` runs at most once per process; later calls are no-ops.

use std::io;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering,
};

use nrflow_core::arena::SegmentBacking;
use nrflow_core::SharedArena;
use nrflow_core::layout::MAX_RINGS;
use tracing::{debug, warn};

/// Longest segment name the registry can hold
pub const MAX_SEGMENT_NAME: usize = 255;

const KIND_NONE: u8 = 0;
const KIND_SHM: u8 = 1;
const KIND_FILE: u8 = 2;

/// Exit status after a forced cleanup (128 + SIGINT)
pub const FORCED_EXIT_STATUS: i32 = 130;

static PIDS: [AtomicI32; MAX_RINGS] = [const { AtomicI32::new(0) }; MAX_RINGS];
static NAME: [AtomicU8; MAX_SEGMENT_NAME] = [const { AtomicU8::new(0) }; MAX_SEGMENT_NAME];
static NAME_LEN: AtomicUsize = AtomicUsize::new(0);
static NAME_KIND: AtomicU8 = AtomicU8::new(KIND_NONE);
static CLEANED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNALS_SEEN: AtomicU32 = AtomicU32::new(0);
static ARENA: AtomicPtr<SharedArena> = AtomicPtr::new(ptr::null_mut());

/// Register the segment to unlink on a forced cleanup
///
/// Anonymous segments need no unlink and clear the registration. Returns
/// `false` if the name does not fit the registry.
pub fn register_segment(backing: &SegmentBacking) -> bool {
    let (kind, name) = match backing {
        SegmentBacking::Anonymous => {
            NAME_KIND.store(KIND_NONE, Ordering::SeqCst);
            CLEANED.store(false, Ordering::SeqCst);
            return true;
        }
        SegmentBacking::Named(name) => (KIND_SHM, name.as_bytes().to_vec()),
        SegmentBacking::File(path) => {
            use std::os::unix::ffi::OsStrExt;
            (KIND_FILE, path.as_os_str().as_bytes().to_vec())
        }
    };
    if name.len() > MAX_SEGMENT_NAME || name.contains(&0) {
        warn!(
            "Segment name of {} bytes cannot be registered for force cleanup",
            name.len()
        );
        return false;
    }

    NAME_KIND.store(KIND_NONE, Ordering::SeqCst);
    for (slot, byte) in NAME.iter().zip(name.iter()) {
        slot.store(*byte, Ordering::Relaxed);
    }
    NAME_LEN.store(name.len(), Ordering::SeqCst);
    NAME_KIND.store(kind, Ordering::SeqCst);
    CLEANED.store(false, Ordering::SeqCst);
    true
}

/// Register the arena whose worker states a forced cleanup marks exited
///
/// The caller keeps `arena` alive until `disarm`.
pub fn register_arena(arena: &Arc<SharedArena>) {
    ARENA.store(Arc::as_ptr(arena).cast_mut(), Ordering::SeqCst);
}

/// Record the pid of worker process `slot`
pub fn register_pid(slot: u32, pid: i32) {
    if let Some(entry) = PIDS.get(slot as usize) {
        entry.store(pid, Ordering::SeqCst);
    }
}

/// Forget worker process `slot` (after it was reaped)
pub fn unregister_pid(slot: u32) {
    if let Some(entry) = PIDS.get(slot as usize) {
        entry.store(0, Ordering::SeqCst);
    }
}

/// Number of registered worker pids
pub fn registered_pids() -> usize {
    PIDS.iter()
        .filter(|p| p.load(Ordering::Relaxed) > 0)
        .count()
}

/// Clear the registry after an orderly teardown
pub fn disarm() {
    for pid in &PIDS {
        pid.store(0, Ordering::SeqCst);
    }
    NAME_KIND.store(KIND_NONE, Ordering::SeqCst);
    NAME_LEN.store(0, Ordering::SeqCst);
    ARENA.store(ptr::null_mut(), Ordering::SeqCst);
}

/// Whether a termination signal has been received
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// Request an orderly shutdown from code (same flag a first signal sets)
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

/// Mark worker states exited, kill registered children and unlink the
/// registered segment
///
/// Async-signal-safe: no allocation, no locks, only atomics, `kill`,
/// `shm_unlink` and `unlink`. Returns `false` if cleanup already ran.
pub fn force_cleanup() -> bool {
    if CLEANED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let arena = ARENA.swap(ptr::null_mut(), Ordering::SeqCst);
    // SAFETY: register_arena's caller keeps the arena alive until disarm,
    // which clears the pointer first.
    if let Some(arena) = unsafe { arena.as_ref() } {
        for ring in 0..arena.ring_count() {
            // Idle and Exited cells refuse the transition; nothing to mark
            let _ = arena.ring_meta(ring).control.state().force_exit();
        }
    }

    for entry in &PIDS {
        let pid = entry.swap(0, Ordering::SeqCst);
        if pid > 0 {
            // SAFETY: kill is async-signal-safe; pid is a child we forked.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }

    let kind = NAME_KIND.swap(KIND_NONE, Ordering::SeqCst);
    if kind == KIND_NONE {
        return true;
    }
    let len = NAME_LEN.load(Ordering::SeqCst).min(MAX_SEGMENT_NAME);
    let mut buf = [0u8; MAX_SEGMENT_NAME + 1];
    for (dst, src) in buf.iter_mut().zip(NAME.iter()).take(len) {
        *dst = src.load(Ordering::Relaxed);
    }
    let path = buf.as_ptr().cast::<libc::c_char>();

    // SAFETY: buf is NUL-terminated (len <= MAX_SEGMENT_NAME) and lives for
    // the duration of the call; both calls are async-signal-safe.
    unsafe {
        match kind {
            KIND_SHM => {
                shm_unlink(path);
            }
            KIND_FILE => {
                libc::unlink(path);
            }
            _ => {}
        }
    }
    true
}

#[cfg(target_os = "linux")]
unsafe fn shm_unlink(path: *const libc::c_char) {
    // SAFETY: forwarded from force_cleanup.
    unsafe {
        libc::shm_unlink(path);
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn shm_unlink(_path: *const libc::c_char) {}

extern "C" fn handle_termination(_signal: libc::c_int) {
    let seen = SIGNALS_SEEN.fetch_add(1, Ordering::SeqCst) + 1;
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    if seen >= 2 {
        force_cleanup();
        // SAFETY: _exit is async-signal-safe and skips destructors.
        unsafe { libc::_exit(FORCED_EXIT_STATUS) };
    }
}

/// Install the SIGINT/SIGTERM handlers
///
/// # Errors
///
/// Returns the OS error from `sigaction`.
pub fn install_signal_handlers() -> io::Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: sigaction is zero-initializable plain data; the handler is
        // an extern "C" fn that only touches atomics and signal-safe calls.
        let ret = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_termination as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = libc::SA_RESTART;
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    debug!("Installed SIGINT/SIGTERM handlers (second signal forces cleanup)");
    Ok(())
}

/// Detach a freshly forked worker from the parent's cleanup duties
///
/// The child ignores SIGINT (the parent coordinates shutdown), takes the
/// default SIGTERM action, and can never run the force path on the parent's
/// registry copy.
pub fn detach_child() {
    CLEANED.store(true, Ordering::SeqCst);
    // SAFETY: resetting dispositions in a single-threaded child.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
    }
}
