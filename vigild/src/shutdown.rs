//! Shutdown state machine.
//!
//! Two ways down, selected by the triggering code: the orderly path
//! degrades politely (terminate processes, notify the administrator,
//! record the shutdown, sync clocks and disks, unmount), while the
//! brutal path (hard-reset requests only) goes straight from a sync to
//! the reboot syscall. Every external step is best-effort and logged;
//! nothing is allowed to stop control reaching a reboot syscall.
//!
//! If even the kernel refuses every reboot variant, the panic path
//! stops feeding the hardware so the timer fires, and finally exits
//! with failure.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::mem;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::mount::{MntFlags, umount2};
use nix::sys::reboot::{RebootMode, reboot, set_cad_enabled};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, sync};
use tracing::{debug, error, info};

use vigil_common::config::Config;
use vigil_common::errcode::{self, ERESET, ETOOHOT};

use crate::clock::safe_sleep;
use crate::device::WatchdogDevice;
use crate::email::SendEmail;
use crate::killtree::signal_all_users;
use crate::logging;
use crate::memlock;
use crate::pidlock;
use crate::probes::ProbeRegistry;
use crate::sandbox::{ChildTask, ExecTask, FLAG_CHILD_SYNC, run_task};
use crate::signals;

/// Where the random seed is preserved for the next boot.
const RANDOM_SEED: &str = "/var/lib/vigild/random-seed";
const WTMP: &str = "/var/log/wtmp";
const MOUNTS: &str = "/proc/self/mounts";
const ADJTIME: &str = "/etc/adjtime";

const PATH_HWCLOCK: &str = "/sbin/hwclock";
const PATH_SWAPOFF: &str = "/sbin/swapoff";
const PATH_UMOUNT: &str = "/bin/umount";

/// Kernel and pseudo filesystems that are pointless to unmount.
const SKIP_FS_TYPES: [&str; 7] = [
    "devfs", "proc", "sysfs", "ramfs", "tmpfs", "devpts", "devtmpfs",
];

/// With a few GB of disk cache or swap in use, releasing resources can
/// take a couple of minutes.
const HELPER_WAIT: i32 = 180;

/// Clean cooperative exit: close everything including the watchdog
/// handle (disarming it) and leave with `ecode`.
pub fn terminate(
    device: &mut WatchdogDevice,
    registry: &mut ProbeRegistry,
    ecode: i32,
) -> ! {
    info!("stopping daemon");
    memlock::unlock_our_memory();
    registry.close_all();
    device.close();
    pidlock::remove_pid_file();
    logging::flush();
    // Make sure the log is written.
    thread::sleep(Duration::from_millis(100));
    std::process::exit(ecode);
}

/// Shut the system down because of `errorcode`. Never returns.
pub fn do_shutdown(
    device: &mut WatchdogDevice,
    cfg: &Config,
    registry: &mut ProbeRegistry,
    errorcode: i32,
) -> ! {
    error!(
        "shutting down the system because of error {errorcode} = '{}'",
        errcode::describe(errorcode)
    );
    registry.close_all();

    if errorcode == ERESET {
        brutal_shutdown(device);
    } else {
        orderly_shutdown(device, cfg, errorcode);
    }

    error!("calling reboot() function");

    if errorcode != ETOOHOT {
        if device.fd() != -1 {
            // We have a hardware timer: shorten it and give it first go
            // at the reboot. The sleep is deliberately not fed.
            device.set_timeout(1);
            thread::sleep(Duration::from_secs(cfg.dev_timeout.max(1) as u64 * 4));
        }
        // That failed or was not possible; ask the kernel directly.
        let _ = reboot(RebootMode::RB_AUTOBOOT);
    } else if cfg.temp_poweroff {
        // Rebooting makes no sense if it is too hot.
        let _ = reboot(RebootMode::RB_POWER_OFF);
    } else {
        // Re-arm ctrl-alt-del so a human can reboot later, then halt.
        let _ = set_cad_enabled(true);
        let _ = reboot(RebootMode::RB_HALT_SYSTEM);
    }

    panic_path(device, cfg)
}

/// We are still alive but should not be.
fn panic_path(device: &mut WatchdogDevice, cfg: &Config) -> ! {
    let kill_time = cfg.dev_timeout.max(1) as u64 * 4;
    logging::resume();
    error!("PANIC: failed to reboot, trying hard-reset");
    // Deliberately plain sleep: with keep-alives stopped, a present
    // hardware timer resets the machine during this window.
    thread::sleep(Duration::from_secs(kill_time));

    error!("PANIC: still alive after sleeping {kill_time} seconds");
    device.close();
    logging::flush();
    std::process::exit(1);
}

/// Terminate (and with `aggressive`, kill) everything else.
///
/// Two termination passes cover the out-of-memory case where the first
/// process snapshot came up short.
fn kill_everything_else(device: &WatchdogDevice, aggressive: bool, settle: i32) {
    // The killing loops must not be taken down by their own fallout.
    signals::ignore_most_signals();

    // Stop init; it is insensitive to the signals sent by the kernel.
    let _ = kill(Pid::from_raw(1), Signal::SIGTSTP);

    signal_all_users(Signal::SIGTERM, aggressive);
    safe_sleep(device, 1);
    signal_all_users(Signal::SIGTERM, aggressive);

    // Wait for most processes to exit as intended.
    safe_sleep(device, settle);

    if aggressive {
        signal_all_users(Signal::SIGKILL, true);
        device.keep_alive();
        signal_all_users(Signal::SIGKILL, true);
        device.keep_alive();
    }
}

/// Append the shutdown record to the last-login log.
fn write_wtmp() {
    let Ok(mut file) = OpenOptions::new().append(true).open(WTMP) else {
        return;
    };

    // SAFETY: utmp is plain-old-data; all-zeros is a valid record.
    let mut record: libc::utmpx = unsafe { mem::zeroed() };
    record.ut_type = libc::RUN_LVL;
    record.ut_pid = 0;
    copy_into(&mut record.ut_user, "shutdown");
    copy_into(&mut record.ut_line, "~");
    copy_into(&mut record.ut_id, "~~");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    record.ut_tv.tv_sec = now as _;

    // SAFETY: record is a fully initialised POD struct; the byte view
    // lives only for this call.
    let bytes = unsafe {
        std::slice::from_raw_parts(
            std::ptr::addr_of!(record).cast::<u8>(),
            mem::size_of::<libc::utmpx>(),
        )
    };
    if let Err(e) = file.write_all(bytes) {
        error!("failed writing wtmp ({e})");
    }
}

fn copy_into(dst: &mut [libc::c_char], s: &str) {
    for (slot, byte) in dst.iter_mut().zip(s.bytes()) {
        *slot = byte as libc::c_char;
    }
}

/// Preserve a block of entropy for the next boot.
fn save_urandom() {
    let mut buf = [0u8; 512];
    let Ok(mut urandom) = File::open("/dev/urandom") else {
        return;
    };
    if urandom.read_exact(&mut buf).is_err() {
        return;
    }
    match File::create(RANDOM_SEED) {
        Ok(mut seed) => {
            if let Err(e) = seed.write_all(&buf) {
                error!("failed writing random seed ({e})");
            }
        }
        Err(_) => {
            // No seed location on this system; nothing to preserve.
        }
    }
}

/// Stop swap on swap *files* only: swap devices do not block
/// unmounting, swap files do.
struct SwapoffFiles;

impl ChildTask for SwapoffFiles {
    fn invoke(&self, _code: i32) -> i32 {
        let content = match std::fs::read_to_string("/proc/swaps") {
            Ok(c) => c,
            Err(e) => {
                let err = e.raw_os_error().unwrap_or(libc::EIO);
                error!("unable to open /proc/swaps (errno = {err} = '{e}')");
                return err;
            }
        };

        let mut err = 0;
        for line in content.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let (Some(dev), Some(kind)) = (fields.next(), fields.next()) else {
                continue;
            };
            if kind != "file" {
                continue;
            }
            info!("stopping swap for {dev}");
            let Ok(cdev) = std::ffi::CString::new(dev) else {
                continue;
            };
            // SAFETY: cdev is a valid nul-terminated path.
            if unsafe { libc::swapoff(cdev.as_ptr()) } != 0 {
                err = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                error!("failed to stop swap on {dev} (errno = {err})");
            }
        }
        err
    }
}

/// Run the system-supplied shutdown helpers, falling back on our
/// simpler methods where they fail.
fn run_shutdown_children(device: &WatchdogDevice, cfg: &Config) {
    // The CMOS clock usually holds UTC and seeds system time at boot,
    // so write the current time back before resetting.
    let mut hwclock_argv = vec![
        PATH_HWCLOCK.to_string(),
        "hwclock".to_string(),
        "-w".to_string(),
        if cfg.rtc_utc { "--utc" } else { "--localtime" }.to_string(),
    ];
    // No adjtime file means a modern "11 minute mode" system with no
    // drift estimate to apply.
    if !Path::new(ADJTIME).exists() {
        hwclock_argv.push("--noadjfile".to_string());
    }
    run_task(device, 20, &ExecTask::new(0, hwclock_argv), 0);

    // Swap files first; if that fails, let the binary turn off all swap.
    if run_task(device, HELPER_WAIT, &SwapoffFiles, 0) != 0 {
        let argv = vec![
            PATH_SWAPOFF.to_string(),
            "swapoff".to_string(),
            "-a".to_string(),
        ];
        run_task(device, HELPER_WAIT, &ExecTask::new(0, argv), 0);
    }

    let argv = vec![
        PATH_UMOUNT.to_string(),
        "umount".to_string(),
        "-a".to_string(),
        "-t".to_string(),
        "nodevfs,devtmpfs".to_string(),
    ];
    run_task(device, HELPER_WAIT, &ExecTask::new(FLAG_CHILD_SYNC, argv), 0);
}

/// Collect real mount points in mount order, skipping pseudo
/// filesystems.
fn unmount_candidates(mounts: &str) -> Vec<String> {
    let mut list = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(dir), Some(kind)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if SKIP_FS_TYPES.contains(&kind) {
            continue;
        }
        list.push(dir.to_string());
    }
    list
}

/// In case the umount binary failed, force-unmount what remains, in
/// reverse mount order.
fn unmount_disks_ourselves(device: &WatchdogDevice) {
    device.keep_alive();
    sync();
    device.keep_alive();

    let content = match std::fs::read_to_string(MOUNTS) {
        Ok(c) => c,
        Err(e) => {
            error!("could not open {MOUNTS} ({e})");
            return;
        }
    };

    for dir in unmount_candidates(&content).iter().rev() {
        debug!("unmounting {dir}");
        device.keep_alive();
        if let Err(e) = umount2(dir.as_str(), MntFlags::MNT_FORCE) {
            error!("could not unmount {dir} ({e})");
        }
    }
}

/// The hard-reset case: skip everything that takes time and get the
/// disks as consistent as a stopped world allows.
fn brutal_shutdown(device: &WatchdogDevice) {
    logging::flush();
    // Grace time for the last log message to be written.
    safe_sleep(device, 1);

    info!("stopping all processes");
    let _ = kill(Pid::from_raw(-1), Signal::SIGSTOP);
    device.keep_alive();

    // Nothing else can start a second daemon now, and a stale pidfile
    // after the planned reboot would claim we are still running.
    pidlock::remove_pid_file();

    // sync() returning does not flush lying battery-backed caches, so
    // sync, settle, sync again before the reset.
    info!("syncing file system");
    sync();
    safe_sleep(device, 1);
    sync();
}

/// The polite way down for everything except a hard-reset request.
fn orderly_shutdown(device: &WatchdogDevice, cfg: &Config, errorcode: i32) {
    let doomed = errcode::is_doomed(errorcode);

    // For the starvation family, helpers are unreliable until resources
    // are freed: shed user processes first, then try to notify. In the
    // other direction, mail has better odds while the system is intact.
    if doomed {
        kill_everything_else(device, false, cfg.sigterm_delay);
    }
    if let Some(admin) = &cfg.admin {
        let task = SendEmail {
            admin: admin.clone(),
        };
        run_task(device, 60, &task, errorcode);
    }
    if !doomed {
        kill_everything_else(device, false, cfg.sigterm_delay);
    }

    logging::flush();
    safe_sleep(device, 1);

    // Init may no longer be able to fork, so no rc script will run;
    // everything from here on is done by us.
    kill_everything_else(device, true, cfg.sigterm_delay - 1);

    logging::resume();

    pidlock::remove_pid_file();

    // Record the fact that we are going down.
    write_wtmp();
    save_urandom();

    // SAFETY: a null pointer argument turns process accounting off.
    if unsafe { libc::acct(std::ptr::null()) } < 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ENOSYS) {
            error!("failed stopping acct() ({e})");
        }
    }

    run_shutdown_children(device, cfg);
    unmount_disks_ourselves(device);
}

// ─── Tests ──────────────────────────────────────────────────────────
