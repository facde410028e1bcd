//! PID file and daemonization.
//!
//! The PID file is created exclusively so a second daemon cannot start
//! behind the first, and removed on every orderly way out — including
//! both shutdown paths, where a stale "running" claim after the planned
//! reboot would be a lie.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::unistd::{ForkResult, fork, getpid, setsid};

/// Default PID file location.
pub const PIDFILE: &str = "/var/run/vigild.pid";

static PIDFILE_CREATED: AtomicBool = AtomicBool::new(false);

/// Tuck the process id away, failing if another instance holds the file.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", getpid())?;
    PIDFILE_CREATED.store(true, Ordering::SeqCst);
    Ok(())
}

/// Remove the PID file if this process created it. Idempotent.
pub fn remove_pid_file() {
    if PIDFILE_CREATED.swap(false, Ordering::SeqCst) {
        let _ = fs::remove_file(PIDFILE);
    }
}

fn redirect_fd(path: &Path, fd: libc::c_int, append: bool) -> io::Result<()> {
    use std::os::fd::IntoRawFd;
    let file = OpenOptions::new()
        .read(!append)
        .write(true)
        .create(true)
        .append(append)
        .open(path)?;
    let raw = file.into_raw_fd();
    // SAFETY: raw is freshly opened; it is closed right after the dup.
    unsafe {
        libc::dup2(raw, fd);
        libc::close(raw);
    }
    Ok(())
}

/// Detach from the controlling terminal.
///
/// Forks (the parent exits), starts a new session, moves to `/` so no
/// mount point is held busy, and re-points the standard streams: stdin
/// and stdout at /dev/null, stderr at `<log-dir>/daemon.log` so the
/// tracing transport survives detachment.
pub fn daemonize(log_dir: &Path) -> io::Result<()> {
    // SAFETY: single-threaded at this point in startup.
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().map_err(io::Error::from)?;
    std::env::set_current_dir("/")?;

    let devnull = Path::new("/dev/null");
    redirect_fd(devnull, libc::STDIN_FILENO, false)?;
    redirect_fd(devnull, libc::STDOUT_FILENO, false)?;
    redirect_fd(&log_dir.join("daemon.log"), libc::STDERR_FILENO, true)?;
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        write_pid_file(&path).expect("first creation succeeds");
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<i32>().unwrap(), getpid().as_raw());

        let err = write_pid_file(&path).expect_err("second creation fails");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        PIDFILE_CREATED.store(false, Ordering::SeqCst);
    }
}
