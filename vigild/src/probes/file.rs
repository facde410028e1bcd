//! File mtime probe, fenced by the sandbox.
//!
//! A stat can block indefinitely on a dead NFS server; running it as a
//! timed child means the main daemon keeps feeding the hardware and can
//! still reboot cleanly instead of being reset mid-write.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error};

use vigil_common::descriptor::{Descriptor, Payload};
use vigil_common::errcode::{ENOCHANGE, ENOERR, ETOOLONG};

use crate::device::WatchdogDevice;
use crate::sandbox::{ChildTask, run_task};

/// Time budget for one stat; generous for a local disk, tight enough
/// that a dead NFS mount cannot stall the cycle.
const CHECK_TIMEOUT: i32 = 5;

/// Judge a file age against its expected change interval.
pub fn assess_age(age: i64, mtime_interval: i32) -> i32 {
    if mtime_interval != 0 && age > mtime_interval as i64 {
        ENOCHANGE
    } else {
        ENOERR
    }
}

struct StatTask<'a> {
    path: &'a str,
    mtime_interval: i32,
}

impl ChildTask for StatTask<'_> {
    fn invoke(&self, _code: i32) -> i32 {
        use std::os::unix::fs::MetadataExt;
        let meta = match std::fs::metadata(self.path) {
            Ok(m) => m,
            Err(e) => {
                let err = e.raw_os_error().unwrap_or(libc::EIO);
                error!("cannot stat {} (errno = {err} = '{e}')", self.path);
                return err;
            }
        };

        if self.mtime_interval == 0 {
            debug!("file {} status OK", self.path);
            return ENOERR;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let age = now - meta.mtime();
        let rv = assess_age(age, self.mtime_interval);
        if rv == ENOCHANGE {
            error!(
                "file {} was not changed in {age} seconds (more than {})",
                self.path, self.mtime_interval
            );
        } else {
            debug!("file {} was last changed {age}s ago", self.path);
        }
        rv
    }
}

/// Stat the file under the sandbox.
pub fn check_safe(device: &WatchdogDevice, d: &Descriptor) -> i32 {
    let Payload::File { mtime } = &d.payload else {
        return ENOERR;
    };
    let task = StatTask {
        path: &d.name,
        mtime_interval: *mtime,
    };
    let rv = run_task(device, CHECK_TIMEOUT, &task, 0);
    if rv == ETOOLONG {
        error!("timeout getting file status for {}", d.name);
    }
    rv
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_judgement() {
        assert_eq!(assess_age(100, 0), ENOERR); // interval 0 = stat only
        assert_eq!(assess_age(59, 60), ENOERR);
        assert_eq!(assess_age(61, 60), ENOCHANGE);
    }

    #[test]
    fn fresh_file_passes_under_the_sandbox() {
        let device = WatchdogDevice::closed();
        let file = tempfile::NamedTempFile::new().unwrap();
        let d = Descriptor::new(
            file.path().to_str().unwrap(),
            0,
            Payload::File { mtime: 3600 },
        );
        assert_eq!(check_safe(&device, &d), ENOERR);
    }

    #[test]
    fn missing_file_reports_the_stat_errno() {
        let device = WatchdogDevice::closed();
        let d = Descriptor::new("/nonexistent/probe-target", 0, Payload::File { mtime: 0 });
        assert_eq!(check_safe(&device, &d), libc::ENOENT);
    }
}
