//! Child-process sandbox.
//!
//! Every unreliable operation — external test and repair binaries, stat
//! calls that may block on NFS, the shutdown helpers — runs as a child
//! bounded by a timeout while the parent keeps the hardware timer fed.
//!
//! The parent's wait schedule starts with short delays (1..400 ms,
//! about one second in total) to reap fast children without a polling
//! storm, then falls back to one-second polls for the remainder of the
//! timeout, issuing a keep-alive on every iteration.

use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execv, fork, sync};
use std::ffi::CString;
use tracing::{debug, error, warn};

use vigil_common::errcode::{ECHKILL, EREBOOT, ETOOLONG};

use crate::clock::safe_sleep;
use crate::device::WatchdogDevice;
use crate::killtree::kill_tree;
use crate::reopen::reopen_std_files;

/// Sync the filesystem in the child before doing anything else.
pub const FLAG_CHILD_SYNC: u32 = 0x01;
/// Capture the child's output in the test-binary log files.
pub const FLAG_REOPEN_STD_TEST: u32 = 0x02;
/// Capture the child's output in the repair-binary log files.
pub const FLAG_REOPEN_STD_REPAIR: u32 = 0x04;

/// Short-delay schedule for the first second of waiting (microseconds).
const WAIT_SCHEDULE_US: [u64; 10] = [
    1_000, 2_000, 3_000, 4_000, 20_000, 30_000, 40_000, 200_000, 300_000, 400_000,
];

/// A unit of work the sandbox can run in a child process.
///
/// The return value becomes the child's exit status, so implementations
/// speak the error-code space of `vigil_common::errcode`.
pub trait ChildTask {
    fn invoke(&self, code: i32) -> i32;
}

/// Fork and run `task` in the child without waiting for it.
///
/// Used by the asynchronous test-binary harness; everything else goes
/// through [`run_task`].
pub fn spawn_task(task: &dyn ChildTask, code: i32) -> nix::Result<Pid> {
    // SAFETY: single supervisory thread by design; the child immediately
    // runs the task and exits.
    match unsafe { fork() }? {
        ForkResult::Child => {
            let rv = task.invoke(code);
            std::process::exit(rv);
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Run `task` as a child, bounded by `timeout` seconds.
///
/// Returns the child's exit code on normal exit, `ECHKILL` if it was
/// killed by a signal, `ETOOLONG` after the timeout (the child and its
/// descendants are terminated, escalating to SIGKILL, and reaped), or
/// `EREBOOT` if the fork itself failed — at that point the system is so
/// exhausted the only useful reaction is a reboot.
pub fn run_task(device: &WatchdogDevice, timeout: i32, task: &dyn ChildTask, code: i32) -> i32 {
    // The short-delay schedule already accounts for the first second.
    let timeout = (timeout - 1).max(0) as usize;

    // SAFETY: single supervisory thread by design.
    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let rv = task.invoke(code);
            std::process::exit(rv);
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            error!("process fork failed with error = {} = '{e}'", e as i32);
            return EREBOOT;
        }
    };

    debug!("waiting on PID={child}...");

    for step in 0..timeout + WAIT_SCHEDULE_US.len() {
        // Keep waiting while the watchdog is kept alive.
        device.keep_alive();

        let delay = WAIT_SCHEDULE_US.get(step).copied().unwrap_or(1_000_000);
        thread::sleep(Duration::from_micros(delay));

        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, ecode)) => {
                debug!("child PID={child} has exited with value {ecode} (count={step})");
                return ecode;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                warn!("child PID={child} was terminated by signal {}", sig as i32);
                return ECHKILL;
            }
            Ok(_) => {} // still running (or stopped); keep polling
            Err(e) => {
                error!("failed to get child status (PID={child}, error = {} = '{e}')", e as i32);
                return e as i32;
            }
        }
    }

    // The wait loop completed without the child exiting: kill its whole
    // tree and report a time-out rather than "killed by signal", which
    // would imply someone else did it.
    kill_tree(child, Signal::SIGTERM);
    safe_sleep(device, 2);

    let gone = matches!(
        waitpid(child, Some(WaitPidFlag::WNOHANG)),
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_)
    );
    if !gone {
        // SIGTERM did not work; use the non-ignorable signal and reap so
        // the child does not linger as a zombie.
        kill_tree(child, Signal::SIGKILL);
        thread::sleep(Duration::from_millis(1));
        let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
    }

    error!("child timed out (PID={child})");
    ETOOLONG
}

/// Run an external program in the sandbox.
///
/// Convention: `argv[0]` is the full path, `argv[1]` the name the
/// program expects to see, `argv[2..]` its actual arguments.
pub struct ExecTask {
    pub flags: u32,
    pub argv: Vec<String>,
}

impl ExecTask {
    pub fn new(flags: u32, argv: Vec<String>) -> Self {
        Self { flags, argv }
    }
}

impl ChildTask for ExecTask {
    fn invoke(&self, _code: i32) -> i32 {
        let Some(path) = self.argv.first() else {
            return libc::ECHILD;
        };

        // The supplied program must exist and be executable before we
        // commit the child to an exec that cannot report back.
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                let err = e.raw_os_error().unwrap_or(libc::ECHILD);
                error!("can't get status of {path} (errno = {err} = '{e}')");
                return err;
            }
        };
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o100 == 0 {
            error!("program {path} is not executable");
            return libc::EACCES;
        }

        if self.flags & FLAG_CHILD_SYNC != 0 {
            debug!("syncing file system...");
            sync();
        }

        reopen_std_files(self.flags);

        debug!("running {}", self.argv.join(" "));

        let Ok(cpath) = CString::new(path.as_str()) else {
            return libc::EINVAL;
        };
        let cargs: Vec<CString> = self.argv[1..]
            .iter()
            .filter_map(|a| CString::new(a.as_str()).ok())
            .collect();

        match execv(&cpath, &cargs) {
            Ok(infallible) => match infallible {},
            Err(e) => e as i32,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
