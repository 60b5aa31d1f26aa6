//! CPU pinning and NUMA topology helpers.
//!
//! Linux-specific; every function is a harmless no-op elsewhere.

use std::io;

#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use tracing::debug;

/// Core worker `worker` is pinned to: `worker % num_cpus`
#[must_use]
pub fn core_for_worker(worker: u32) -> usize {
    worker as usize % num_cpus::get().max(1)
}

/// Pin the calling thread (or single-threaded process) to `core`
///
/// # Errors
///
/// Returns the OS error from `sched_setaffinity`.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(core: usize) -> io::Result<()> {
    use std::mem;

    if core >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core {core} beyond CPU_SETSIZE"),
        ));
    }

    // SAFETY: cpu_set_t is plain data and valid when zeroed; core is below
    // CPU_SETSIZE; pid 0 targets the calling thread and the size matches the
    // set we pass.
    let ret = unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(core, &mut cpuset);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset)
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pin the calling thread to `core` (non-Linux: no-op)
#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_core: usize) -> io::Result<()> {
    Ok(())
}

/// NUMA node owning `cpu`, if the system exposes one
#[cfg(target_os = "linux")]
pub fn numa_node_for_cpu(cpu: usize) -> Option<usize> {
    for node in 0..8 {
        let path = format!("/sys/devices/system/node/node{}/cpu{}", node, cpu);
        if fs::metadata(&path).is_ok() {
            debug!("CPU {} found on NUMA node {}", cpu, node);
            return Some(node);
        }
    }

    if fs::metadata("/sys/devices/system/node/node0").is_ok() {
        Some(0)
    } else {
        None
    }
}

/// NUMA node owning `cpu` (non-Linux: always `None`)
#[cfg(not(target_os = "linux"))]
pub fn numa_node_for_cpu(_cpu: usize) -> Option<usize> {
    None
}
