//! # Supervision Integration Tests
//!
//! End-to-end scenarios across the repair policy, the sandbox and the
//! probe descriptors, driven through the public library API. The
//! shutdown state machine itself reboots machines and is exercised up
//! to (never across) its syscall boundary: these tests cover the
//! decision logic that selects and triggers it.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use vigil_common::config::Config;
use vigil_common::descriptor::{Descriptor, Payload};
use vigil_common::errcode::{ECHKILL, ENOCHANGE, ENOERR, ERESET, ETOOHOT, ETOOLONG, is_doomed};

use vigild::device::WatchdogDevice;
use vigild::repair::{Disposition, assess, handle, repair_argv};
use vigild::sandbox::{ChildTask, ExecTask, run_task};

// ─── Helpers ────────────────────────────────────────────────────────

fn file_probe(path: &str, mtime: i32) -> Descriptor {
    Descriptor::new(path, 0, Payload::File { mtime })
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "#!/bin/sh\n{body}").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_string()
}

// ─── Retry window across cycles ─────────────────────────────────────

#[test]
fn stale_file_is_first_suppressed_then_repaired() {
    let cfg = Config {
        retry_timeout: 30,
        repair_max: 1,
        repair_binary: Some("/usr/sbin/vigil-repair".into()),
        ..Config::default()
    };
    let mut probe = file_probe("/path/file", 60);

    // t=66: the file went stale; first offence is suppressed.
    assert_eq!(
        assess(Some(&mut probe), ENOCHANGE, 66, &cfg),
        Disposition::Suppress
    );
    assert_eq!(probe.first_failure, 66);
    assert_eq!(probe.repair_count, 0);

    // t=120: window exceeded; the repair binary is due with the V0
    // calling convention.
    assert_eq!(
        assess(Some(&mut probe), ENOCHANGE, 120, &cfg),
        Disposition::AttemptRepair
    );
    assert_eq!(probe.repair_count, 1);
    let argv = repair_argv(0, cfg.repair_binary.as_deref(), ENOCHANGE, &probe.name).unwrap();
    assert_eq!(
        argv,
        ["/usr/sbin/vigil-repair", "/usr/sbin/vigil-repair", "250", "/path/file"]
    );
}

// ─── Repair budget ──────────────────────────────────────────────────

#[test]
fn repair_budget_surfaces_on_the_third_failure() {
    let cfg = Config {
        retry_timeout: 0,
        repair_max: 2,
        ..Config::default()
    };
    let mut probe = file_probe("/path/file", 60);

    let mut dispositions = Vec::new();
    for t in 1..=5 {
        dispositions.push(assess(Some(&mut probe), ENOCHANGE, t, &cfg));
    }
    assert_eq!(
        dispositions,
        [
            Disposition::AttemptRepair,
            Disposition::AttemptRepair,
            Disposition::Surface,
            Disposition::Surface,
            Disposition::Surface,
        ]
    );
}

// ─── Doomed selection ───────────────────────────────────────────────

#[test]
fn too_hot_bypasses_repair_and_is_doomed() {
    let cfg = Config {
        temp_poweroff: true,
        ..Config::default()
    };
    let mut sensor = Descriptor::new(
        "/sys/class/hwmon/hwmon0/temp1_input",
        0,
        Payload::Temperature {
            in_use: true,
            recent: [0; 3],
            have: 0,
            warned: 0,
        },
    );
    assert_eq!(assess(Some(&mut sensor), ETOOHOT, 10, &cfg), Disposition::Surface);
    assert_eq!(sensor.repair_count, 0, "doomed errors never consume repairs");
    assert!(is_doomed(ETOOHOT));
    assert!(is_doomed(ERESET));
    assert!(!is_doomed(ENOCHANGE));
}

// ─── --no-action ────────────────────────────────────────────────────

#[test]
fn no_action_never_surfaces_a_shutdown_code() {
    let device = WatchdogDevice::closed();
    let cfg = Config::default();
    for code in [ETOOHOT, ERESET, ENOCHANGE] {
        let mut probe = file_probe("/path/file", 60);
        probe.first_failure = 1; // stale window from long ago
        assert_eq!(handle(&device, &cfg, true, Some(&mut probe), code), None);
    }
}

// ─── Sandbox round trip ─────────────────────────────────────────────

#[test]
fn sandbox_returns_the_value_of_a_fast_child() {
    struct Answer;
    impl ChildTask for Answer {
        fn invoke(&self, code: i32) -> i32 {
            code + 1
        }
    }
    let device = WatchdogDevice::closed();
    assert_eq!(run_task(&device, 5, &Answer, 41), 42);
}

#[test]
fn sandbox_times_out_a_term_ignoring_child() {
    let dir = tempfile::tempdir().unwrap();
    // The script ignores SIGTERM, so only the escalation to SIGKILL
    // can end it.
    let script = write_script(dir.path(), "stubborn", "trap '' TERM\nsleep 30");
    let task = ExecTask::new(0, vec![script.clone(), "stubborn".into()]);

    let device = WatchdogDevice::closed();
    let start = Instant::now();
    let rv = run_task(&device, 3, &task, 0);
    let elapsed = start.elapsed();

    assert_eq!(rv, ETOOLONG);
    assert!(elapsed >= Duration::from_secs(3), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(12), "returned after {elapsed:?}");
}

#[test]
fn sandbox_reports_an_externally_killed_child() {
    struct KillSelf;
    impl ChildTask for KillSelf {
        fn invoke(&self, _code: i32) -> i32 {
            // SAFETY: the raise only affects the forked child.
            unsafe { libc::kill(libc::getpid(), libc::SIGKILL) };
            0
        }
    }
    let device = WatchdogDevice::closed();
    assert_eq!(run_task(&device, 5, &KillSelf, 0), ECHKILL);
}

#[test]
fn sandbox_runs_real_binaries_with_their_own_argv() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "argcheck", "[ \"$1\" = alpha ] && exit 0\nexit 3");
    let device = WatchdogDevice::closed();

    let good = ExecTask::new(0, vec![script.clone(), "argcheck".into(), "alpha".into()]);
    assert_eq!(run_task(&device, 5, &good, 0), 0);

    let bad = ExecTask::new(0, vec![script, "argcheck".into(), "beta".into()]);
    assert_eq!(run_task(&device, 5, &bad, 0), 3);
}

// ─── Descriptor retry/repair bookkeeping ────────────────────────────

#[test]
fn failure_timestamp_tracks_outstanding_failures_exactly() {
    let cfg = Config {
        retry_timeout: 100,
        repair_max: 3,
        ..Config::default()
    };
    let mut probe = file_probe("/path/file", 60);

    assert!(!probe.has_outstanding_failure());
    assess(Some(&mut probe), ENOCHANGE, 10, &cfg);
    assert!(probe.has_outstanding_failure());
    assess(Some(&mut probe), ENOERR, 20, &cfg);
    assert!(!probe.has_outstanding_failure());
}

#[test]
fn success_between_failures_resets_the_repair_count() {
    let cfg = Config {
        retry_timeout: 0,
        repair_max: 5,
        ..Config::default()
    };
    let mut probe = file_probe("/path/file", 60);

    assess(Some(&mut probe), ENOCHANGE, 1, &cfg);
    assess(Some(&mut probe), ENOCHANGE, 2, &cfg);
    assert_eq!(probe.repair_count, 2);

    assess(Some(&mut probe), ENOERR, 3, &cfg);
    assert_eq!(probe.repair_count, 0);

    assess(Some(&mut probe), ENOCHANGE, 4, &cfg);
    assert_eq!(probe.repair_count, 1);
}

// ─── Self-repairing binaries end to end ─────────────────────────────

#[test]
fn version1_repair_invocation_actually_runs() {
    let dir = tempfile::tempdir().unwrap();
    // Succeeds only when called as "<self> repair <code> <self>".
    let script = write_script(
        dir.path(),
        "selfheal",
        "[ \"$1\" = repair ] && [ \"$2\" = 250 ] && exit 0\nexit 11",
    );

    let argv = repair_argv(1, None, ENOCHANGE, &script).unwrap();
    assert_eq!(argv[2], "repair");

    let device = WatchdogDevice::closed();
    let task = ExecTask::new(0, argv);
    assert_eq!(run_task(&device, 5, &task, 0), 0);
}
