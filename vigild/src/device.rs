//! Watchdog device handle.
//!
//! The one resource whose liveness is sacred: once opened, the handle is
//! kept alive until either a successful reboot syscall or an explicit
//! orderly close. Closing writes the magic byte first so the driver
//! disarms instead of resetting the machine when the file drops.
//!
//! All operations are no-ops on an unopened handle, so the supervision
//! plane runs identically with `--no-action`, with a missing device, and
//! under test.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::ioctl_readwrite;
use tracing::{error, info, warn};

use vigil_common::errcode;

// Request codes from include/uapi/linux/watchdog.h.
const WATCHDOG_IOCTL_BASE: u8 = b'W';
const WDIOC_SETTIMEOUT: u8 = 6;

ioctl_readwrite!(wdog_set_timeout, WATCHDOG_IOCTL_BASE, WDIOC_SETTIMEOUT, libc::c_int);

/// Handle to the hardware watchdog character device.
#[derive(Debug, Default)]
pub struct WatchdogDevice {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl WatchdogDevice {
    /// A handle with no device behind it. Keep-alives succeed silently.
    pub fn closed() -> Self {
        Self::default()
    }

    /// Open the device and configure its hardware timeout.
    ///
    /// Failure is logged and the daemon carries on without a hardware
    /// safety net; the supervision loop itself still provides the
    /// software-level reboot path.
    pub fn open(&mut self, path: &Path, timeout: i32) {
        match OpenOptions::new().write(true).open(path) {
            Ok(file) => {
                self.file = Some(file);
                self.path = Some(path.to_path_buf());
                info!("watchdog device {} activated", path.display());
                self.set_timeout(timeout);
            }
            Err(e) => {
                error!("cannot open watchdog device {} ({})", path.display(), e);
            }
        }
    }

    /// Ask the driver for a new timeout; the hardware may round it.
    pub fn set_timeout(&self, timeout: i32) {
        let Some(file) = self.file.as_ref() else {
            return;
        };
        let mut value: libc::c_int = timeout;
        // SAFETY: fd is a valid open watchdog device and `value` outlives the call.
        match unsafe { wdog_set_timeout(file.as_raw_fd(), &mut value) } {
            Ok(_) => {
                if value != timeout {
                    warn!("watchdog hardware rounded timeout {timeout} to {value} seconds");
                } else {
                    info!("watchdog hardware timeout set to {value} seconds");
                }
            }
            Err(e) => error!("cannot set watchdog timeout to {timeout} ({e})"),
        }
    }

    /// Defer the hardware reset with a keep-alive write.
    ///
    /// Returns an error code suitable for the repair policy: `ENOERR` on
    /// success (or when no device is open), the write errno otherwise.
    pub fn keep_alive(&self) -> i32 {
        let Some(file) = self.file.as_ref() else {
            return errcode::ENOERR;
        };
        let mut f = file;
        match f.write_all(b"\0") {
            Ok(()) => errcode::ENOERR,
            Err(e) => {
                let code = e.raw_os_error().unwrap_or(libc::EIO);
                error!("watchdog keep-alive write failed ({e})");
                code
            }
        }
    }

    /// Disarm and release the device. Idempotent.
    ///
    /// The magic byte tells the driver this is a deliberate close, not a
    /// daemon death, so it must not reset the machine.
    pub fn close(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        if let Err(e) = file.write_all(b"V").and_then(|()| file.flush()) {
            error!("cannot disarm watchdog device ({e})");
        } else if let Some(path) = &self.path {
            info!("watchdog device {} closed and disarmed", path.display());
        }
        self.path = None;
    }

    /// Raw file descriptor for introspection; -1 when not open.
    pub fn fd(&self) -> i32 {
        self.file.as_ref().map_or(-1, |f| f.as_raw_fd())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_handle_is_inert() {
        let mut device = WatchdogDevice::closed();
        assert_eq!(device.fd(), -1);
        assert_eq!(device.keep_alive(), errcode::ENOERR);
        device.set_timeout(60);
        device.close();
        device.close(); // idempotent
        assert_eq!(device.fd(), -1);
    }

    #[test]
    fn open_failure_leaves_handle_closed() {
        let mut device = WatchdogDevice::closed();
        device.open(Path::new("/nonexistent/watchdog"), 60);
        assert_eq!(device.fd(), -1);
        assert_eq!(device.keep_alive(), errcode::ENOERR);
    }
}
