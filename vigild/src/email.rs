//! Administrator notification.
//!
//! Sent through `sendmail` as a sandbox task with its own time budget:
//! a half-broken system may hang anywhere in the mail path, and the
//! shutdown must not wait on it forever.

use std::io::Write;
use std::process::{Command, Stdio};

use nix::unistd::gethostname;
use tracing::error;

use vigil_common::errcode::ETOOHOT;

use crate::sandbox::ChildTask;

const SENDMAIL: &str = "/usr/sbin/sendmail";

/// Mail the administrator that the machine is going down.
pub struct SendEmail {
    pub admin: String,
}

impl ChildTask for SendEmail {
    fn invoke(&self, errorcode: i32) -> i32 {
        // Check the binary first: a non-existent sendmail closes the pipe
        // faster than we can write to it, and all we would see is EPIPE.
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(SENDMAIL) {
            Ok(m) if m.permissions().mode() & 0o100 != 0 => {}
            _ => {
                error!("{SENDMAIL} does not exist or is not executable");
                return libc::EACCES;
            }
        }

        let hostname = gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let mut child = match Command::new(SENDMAIL)
            .arg("-i")
            .arg(&self.admin)
            .stdin(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                error!("cannot start {SENDMAIL} ({e})");
                return e.raw_os_error().unwrap_or(libc::EACCES);
            }
        };

        let body = if errorcode == ETOOHOT {
            "Message from vigil:\nIt is too hot to keep on working. The system will be halted!\n"
                .to_string()
        } else {
            format!(
                "Message from vigil:\nThe system will be rebooted because of error {errorcode}!\n"
            )
        };
        let message = format!(
            "To: {}\nSubject: {hostname} is going down!\n\n{body}",
            self.admin
        );

        let Some(mut stdin) = child.stdin.take() else {
            let _ = child.wait();
            return libc::EIO;
        };
        let rv = stdin.write_all(message.as_bytes());
        drop(stdin);
        if let Err(e) = rv {
            error!("cannot send mail ({e})");
            let _ = child.wait();
            return e.raw_os_error().unwrap_or(libc::EIO);
        }

        match child.wait() {
            Ok(status) if status.success() => {
                // Give the mail a chance to actually leave the machine
                // before the killing starts.
                std::thread::sleep(std::time::Duration::from_secs(10));
                0
            }
            Ok(status) => {
                error!("cannot finish mail (sendmail exited {status})");
                libc::EIO
            }
            Err(e) => {
                error!("cannot finish mail ({e})");
                e.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }
}
