//! Asynchronous test-binary harness.
//!
//! Test binaries run detached from the probe cadence: each cycle starts
//! any binary that is not already running, and collected exit codes are
//! reported the next time the harness is drained. A binary that
//! overstays `test-timeout` has its whole process tree killed and is
//! reported as timed out; one killed by an outside signal is reported
//! as such.

use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use vigil_common::config::Config;
use vigil_common::descriptor::Descriptor;
use vigil_common::errcode::{ECHKILL, ETOOLONG};

use crate::clock;
use crate::killtree::kill_tree;
use crate::sandbox::{ExecTask, FLAG_REOPEN_STD_TEST, spawn_task};

#[derive(Debug)]
struct Running {
    pid: Pid,
    desc_index: usize,
    started: u64,
}

/// Tracks the test children currently in flight.
#[derive(Debug, Default)]
pub struct TestBinHarness {
    running: Vec<Running>,
}

/// Build the test invocation for a descriptor. Version-1 binaries take
/// a `test` argument so they can distinguish testing from repairing.
fn test_argv(d: &Descriptor) -> Vec<String> {
    let mut argv = vec![d.name.clone(), d.name.clone()];
    if d.version == 1 {
        argv.push("test".to_string());
    }
    argv
}

impl TestBinHarness {
    /// Start the binary for `desc_index` unless it is still running.
    pub fn schedule(&mut self, desc_index: usize, d: &Descriptor) {
        if self.running.iter().any(|r| r.desc_index == desc_index) {
            return;
        }
        let task = ExecTask::new(FLAG_REOPEN_STD_TEST, test_argv(d));
        match spawn_task(&task, 0) {
            Ok(pid) => {
                debug!("started test binary {} (PID={pid})", d.name);
                self.running.push(Running {
                    pid,
                    desc_index,
                    started: clock::now(),
                });
            }
            Err(e) => {
                error!("cannot fork test binary {} ({e})", d.name);
            }
        }
    }

    /// Reap finished children and kill overdue ones.
    ///
    /// Returns `(descriptor index, code)` pairs for every binary that
    /// produced a verdict since the last drain.
    pub fn drain(&mut self, cfg: &Config) -> Vec<(usize, i32)> {
        let now = clock::now();
        let timeout = cfg.test_timeout;
        let mut results = Vec::new();

        self.running.retain(|r| {
            match waitpid(r.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    results.push((r.desc_index, code));
                    false
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    warn!("test child PID={} was terminated by signal {}", r.pid, sig as i32);
                    results.push((r.desc_index, ECHKILL));
                    false
                }
                Err(_) => {
                    // Already reaped or otherwise gone; nothing to report.
                    false
                }
                Ok(_) => {
                    if timeout > 0 && now.saturating_sub(r.started) > timeout as u64 {
                        error!("test child PID={} exceeded time limit {timeout}", r.pid);
                        kill_tree(r.pid, Signal::SIGKILL);
                        let _ = waitpid(r.pid, Some(WaitPidFlag::WNOHANG));
                        results.push((r.desc_index, ETOOLONG));
                        false
                    } else {
                        true
                    }
                }
            }
        });

        results
    }

    /// Kill and reap whatever is still in flight.
    pub fn close(&mut self) {
        for r in self.running.drain(..) {
            kill_tree(r.pid, Signal::SIGKILL);
            let _ = waitpid(r.pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use vigil_common::descriptor::Payload;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn drain_until(harness: &mut TestBinHarness, cfg: &Config) -> Vec<(usize, i32)> {
        for _ in 0..100 {
            let results = harness.drain(cfg);
            if !results.is_empty() {
                return results;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        Vec::new()
    }

    #[test]
    fn exit_code_flows_back_to_the_right_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "check", "exit 7");
        let d = Descriptor::new(path, 0, Payload::None);
        let cfg = Config::default();

        let mut harness = TestBinHarness::default();
        harness.schedule(3, &d);
        let results = drain_until(&mut harness, &cfg);
        assert_eq!(results, vec![(3, 7)]);
    }

    #[test]
    fn version1_gets_the_test_argument() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            dir.path(),
            "check",
            "[ \"$1\" = test ] && exit 0 || exit 9",
        );
        let d = Descriptor::new(path, 1, Payload::None);
        let cfg = Config::default();

        let mut harness = TestBinHarness::default();
        harness.schedule(0, &d);
        let results = drain_until(&mut harness, &cfg);
        assert_eq!(results, vec![(0, 0)]);
    }

    #[test]
    fn a_binary_is_not_started_twice_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "check", "sleep 30");
        let d = Descriptor::new(path, 0, Payload::None);
        let cfg = Config::default();

        let mut harness = TestBinHarness::default();
        harness.schedule(0, &d);
        harness.schedule(0, &d);
        assert_eq!(harness.running.len(), 1);
        harness.close();
        assert!(harness.running.is_empty());
    }

    #[test]
    fn overdue_binary_is_killed_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "check", "sleep 60");
        let d = Descriptor::new(path, 0, Payload::None);
        let cfg = Config {
            test_timeout: 1,
            ..Config::default()
        };

        let mut harness = TestBinHarness::default();
        harness.schedule(0, &d);
        std::thread::sleep(std::time::Duration::from_secs(3));
        let results = harness.drain(&cfg);
        assert_eq!(results, vec![(0, ETOOLONG)]);
        assert!(harness.running.is_empty());
    }

    #[test]
    fn test_argv_conventions() {
        let v0 = Descriptor::new("/opt/check", 0, Payload::None);
        assert_eq!(test_argv(&v0), ["/opt/check", "/opt/check"]);
        let v1 = Descriptor::new("/opt/check", 1, Payload::None);
        assert_eq!(test_argv(&v1), ["/opt/check", "/opt/check", "test"]);
    }
}
