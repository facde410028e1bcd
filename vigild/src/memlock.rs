//! Real-time discipline: memory locking and scheduling priority.
//!
//! When `realtime = yes`, the daemon locks its address space so a
//! thrashing system cannot page out the code that is supposed to rescue
//! it, and elevates itself to round-robin real-time scheduling. Both are
//! undone on orderly exit.

use nix::sys::mman::{MlockAllFlags, mlockall, munlockall};
use tracing::{error, info};

/// Lock current and future pages and switch to SCHED_RR at `priority`.
pub fn lock_our_memory(realtime: bool, priority: i32) {
    if !realtime {
        return;
    }

    if let Err(e) = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        error!("mlockall failed ({e})");
        return;
    }

    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: param is a valid sched_param for the calling process.
    let rv = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rv != 0 {
        error!(
            "sched_setscheduler(SCHED_RR, {priority}) failed ({})",
            std::io::Error::last_os_error()
        );
    } else {
        info!("locked in memory, running at SCHED_RR priority {priority}");
    }
}

/// Return to normal scheduling and unlock memory.
pub fn unlock_our_memory() {
    let param = libc::sched_param { sched_priority: 0 };
    // SAFETY: param is a valid sched_param for the calling process.
    unsafe { libc::sched_setscheduler(0, libc::SCHED_OTHER, &param) };
    let _ = munlockall();
}
