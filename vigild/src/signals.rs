//! Signal intake.
//!
//! SIGTERM converts to a cooperative stop flag checked once per cycle;
//! the handler performs only an async-signal-safe atomic store. During
//! mass-kill operations almost every signal is ignored so the killing
//! loops cannot be taken down by their own fallout.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigterm(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Whether the supervision loop should keep running.
pub fn running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

/// Request a cooperative stop, as SIGTERM would.
pub fn request_stop() {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Install the SIGTERM handler so the device is closed cleanly on
/// termination instead of the hardware firing later.
pub fn install_sigterm_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigterm),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only performs an atomic store.
    unsafe { sigaction(Signal::SIGTERM, &action) }?;
    Ok(())
}

/// Ignore every catchable signal except SIGCHLD.
///
/// SIGCHLD keeps its default disposition so `waitpid` in the sandbox
/// continues to observe child exits.
pub fn ignore_most_signals() {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGCHLD | Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_IGN carries no handler re-entrancy concerns.
        let _ = unsafe { sigaction(sig, &ignore) };
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
