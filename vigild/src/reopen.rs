//! Redirect child stdout/stderr into the log directory.
//!
//! Test and repair children get their output captured in
//! `<log-dir>/test-bin.{stdout,stderr}` and
//! `<log-dir>/repair-bin.{stdout,stderr}`; anything else goes to
//! /dev/null. The directory is registered once, before daemonizing, so
//! the redirect still works when the system later runs out of memory.

use std::fs::OpenOptions;
use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::warn;

use crate::sandbox::{FLAG_REOPEN_STD_REPAIR, FLAG_REOPEN_STD_TEST};

static REOPEN_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Declare where test/repair output should go. In foreground mode this
/// is never called and [`reopen_std_files`] does nothing.
pub fn set_reopen_dir(dir: &Path) {
    let _ = REOPEN_DIR.set(dir.to_path_buf());
}

fn redirect(target: &Path, fd: libc::c_int) -> i32 {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)
    {
        Ok(file) => {
            let raw = file.into_raw_fd();
            // SAFETY: raw is a freshly opened descriptor; after dup2 the
            // original is closed and only the std stream refers to it.
            unsafe {
                libc::dup2(raw, fd);
                libc::close(raw);
            }
            0
        }
        Err(e) => {
            let err = e.raw_os_error().unwrap_or(libc::EIO);
            warn!("unable to reopen using {} ({e})", target.display());
            err
        }
    }
}

/// Re-point stdout and stderr for the current (child) process.
///
/// Returns the last error encountered, 0 on success. Failing to reopen
/// is not fatal for the child: before daemonizing these streams already
/// point somewhere sensible.
pub fn reopen_std_files(flags: u32) -> i32 {
    let Some(dir) = REOPEN_DIR.get() else {
        return 0;
    };

    let base = if flags & FLAG_REOPEN_STD_REPAIR != 0 {
        Some("repair-bin")
    } else if flags & FLAG_REOPEN_STD_TEST != 0 {
        Some("test-bin")
    } else {
        None
    };

    let (out, err_path) = match base {
        Some(base) => (
            dir.join(format!("{base}.stdout")),
            dir.join(format!("{base}.stderr")),
        ),
        None => (PathBuf::from("/dev/null"), PathBuf::from("/dev/null")),
    };

    let mut err = redirect(&out, libc::STDOUT_FILENO);
    let rv = redirect(&err_path, libc::STDERR_FILENO);
    if rv != 0 {
        err = rv;
    }
    err
}
