//! CPU pinning for worker threads.
//!
//! Workers are pinned to the CPU they were assigned at scheduler
//! construction, both so "node-local" means something and so the kernel's
//! first-touch policy places worker allocations on the worker's node.
//!
//! Linux only; elsewhere pinning reports `Unsupported` and the scheduler
//! degrades to unpinned threads with a single-node topology.

use std::io;

/// Highest core index the affinity mask can express.
#[cfg(target_os = "linux")]
pub const CPU_SET_CAPACITY: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

#[cfg(not(target_os = "linux"))]
pub const CPU_SET_CAPACITY: usize = 1024;

/// Pin the calling thread to `core`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread_to_core(core: usize) -> io::Result<()> {
    if core >= CPU_SET_CAPACITY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core index {core} exceeds CPU_SET_CAPACITY ({CPU_SET_CAPACITY})"),
        ));
    }
    // SAFETY: zeroed cpu_set_t is valid; core is bounds-checked above.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set as *const _,
        );
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread_to_core(_core: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU affinity is not supported on this platform",
    ))
}

/// Pin, warning on failure instead of propagating. Pinning is placement
/// quality, not correctness; a failed pin must not kill the worker.
pub fn try_pin_to_core(core: usize) -> Option<usize> {
    match pin_current_thread_to_core(core) {
        Ok(()) => Some(core),
        Err(e) => {
            eprintln!("WARN: failed to pin thread to core {core}: {e}");
            None
        }
    }
}
