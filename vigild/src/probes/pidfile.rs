//! Server-process liveness via pidfile.
//!
//! Reads the pid a server daemon wrote at startup and checks the
//! process still exists with a null signal.

use std::fs;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, error};

use vigil_common::descriptor::Descriptor;
use vigil_common::errcode::ENOERR;

/// Check the process named by a pidfile is still alive.
pub fn check(d: &Descriptor) -> i32 {
    let content = match fs::read_to_string(&d.name) {
        Ok(c) => c,
        Err(e) => {
            let err = e.raw_os_error().unwrap_or(libc::EIO);
            error!("cannot read pidfile {} (errno = {err} = '{e}')", d.name);
            return err;
        }
    };

    let Some(pid) = content.split_whitespace().next().and_then(|s| s.parse::<i32>().ok()) else {
        error!("pidfile {} contains no process id", d.name);
        return libc::EINVAL;
    };

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => {
            debug!("pidfile {}: process {pid} is alive", d.name);
            ENOERR
        }
        Err(e) => {
            error!("pidfile {}: process {pid} is gone (errno = {} = '{e}')", d.name, e as i32);
            e as i32
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vigil_common::descriptor::Payload;

    fn pidfile_with(content: &str) -> (tempfile::TempDir, Descriptor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{content}").unwrap();
        let d = Descriptor::new(path.to_str().unwrap(), 0, Payload::None);
        (dir, d)
    }

    #[test]
    fn our_own_pid_is_alive() {
        let (_dir, d) = pidfile_with(&format!("{}\n", std::process::id()));
        assert_eq!(check(&d), ENOERR);
    }

    #[test]
    fn a_dead_pid_reports_esrch() {
        // PID near the default pid_max limit, extremely unlikely to exist.
        let (_dir, d) = pidfile_with("4194302\n");
        assert_eq!(check(&d), libc::ESRCH);
    }

    #[test]
    fn garbage_content_is_invalid() {
        let (_dir, d) = pidfile_with("not-a-pid\n");
        assert_eq!(check(&d), libc::EINVAL);
    }

    #[test]
    fn missing_pidfile_reports_enoent() {
        let d = Descriptor::new("/nonexistent/server.pid", 0, Payload::None);
        assert_eq!(check(&d), libc::ENOENT);
    }
}
