//! Repair policy.
//!
//! Every probe result flows through here. Success clears the probe's
//! failure state; inconclusive results change nothing; fatal codes
//! bypass repair entirely; anything else may first be suppressed inside
//! the retry window, then repaired under the sandbox within the
//! per-probe budget, and finally surfaced for shutdown.
//!
//! [`assess`] is the pure decision procedure (it takes the monotonic
//! `now` as an argument so the window logic is testable); [`handle`]
//! executes the decision against the real sandbox and reports whether
//! the caller must shut the system down.

use tracing::{debug, error, warn};

use vigil_common::config::Config;
use vigil_common::descriptor::Descriptor;
use vigil_common::errcode::{self, Class, classify};

use crate::clock;
use crate::device::WatchdogDevice;
use crate::sandbox::{ExecTask, FLAG_REOPEN_STD_REPAIR, run_task};

/// What the policy decided for one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to do (success or inconclusive).
    Continue,
    /// Failure inside the retry window; treat as success this cycle.
    Suppress,
    /// Invoke the repair binary.
    AttemptRepair,
    /// Hand the code to the shutdown state machine.
    Surface,
}

/// Decide what to do with `result`, updating the descriptor's
/// retry/repair state.
pub fn assess(mut act: Option<&mut Descriptor>, result: i32, now: u64, cfg: &Config) -> Disposition {
    match classify(result) {
        Class::Ok => {
            // No error: reset any running retry window and repair budget.
            if let Some(d) = act.as_deref_mut() {
                d.first_failure = 0;
                d.repair_count = 0;
            }
            return Disposition::Continue;
        }
        Class::DontKnow => return Disposition::Continue,
        Class::Fatal => return Disposition::Surface,
        Class::Repairable => {}
    }

    let mut expired = true;
    if let Some(d) = act.as_deref_mut() {
        if cfg.retry_timeout > 0 {
            // A timer is possible and used to allow a re-try.
            expired = false;
            if d.first_failure == 0 {
                // First offence, record the time.
                d.first_failure = now;
            } else {
                let used = now.saturating_sub(d.first_failure);
                if used > cfg.retry_timeout as u64 {
                    warn!("retry timed-out at {used} seconds for {}", d.name);
                    expired = true;
                } else {
                    debug!("retry at {used} seconds for {}", d.name);
                }
            }
        }
    }

    if !expired {
        return Disposition::Suppress;
    }

    let mut try_repair = true;
    if let Some(d) = act {
        // Check for too many failed repair attempts.
        if cfg.repair_max > 0 {
            d.repair_count += 1;
            if d.repair_count > cfg.repair_max {
                try_repair = false;
                warn!("repair count exceeded ({} for {})", d.repair_count, d.name);
            } else {
                debug!("repair attempt {} for {}", d.repair_count, d.name);
            }
        }
        if try_repair {
            // Reset the window so the next try gets the same grace period.
            d.first_failure = 0;
        }
    }

    if try_repair {
        Disposition::AttemptRepair
    } else {
        Disposition::Surface
    }
}

/// Build the repair invocation for the given calling convention.
///
/// Version 0 uses the globally configured repair binary:
/// `rbin rbin <error-decimal> [<name>]`. Version 1 probes repair
/// themselves: `name name repair <error-decimal> name`. Returns `None`
/// when no binary is available.
pub fn repair_argv(
    version: u8,
    repair_bin: Option<&str>,
    result: i32,
    name: &str,
) -> Option<Vec<String>> {
    if version == 1 {
        if name.is_empty() {
            return None;
        }
        return Some(vec![
            name.to_string(),
            name.to_string(),
            "repair".to_string(),
            result.to_string(),
            name.to_string(),
        ]);
    }

    let rbin = repair_bin?;
    let mut argv = vec![rbin.to_string(), rbin.to_string(), result.to_string()];
    if !name.is_empty() {
        argv.push(name.to_string());
    }
    Some(argv)
}

/// Execute the repair binary under the sandbox.
///
/// Returns the repair binary's exit code, or the original `result` when
/// no binary is configured — at which point the failure must surface.
fn repair(device: &WatchdogDevice, cfg: &Config, result: i32, name: &str, version: u8) -> i32 {
    let Some(argv) = repair_argv(version, cfg.repair_binary.as_deref(), result, name) else {
        // No binary given; we have to reboot.
        return result;
    };

    let binary = argv[0].clone();
    let task = ExecTask::new(FLAG_REOPEN_STD_REPAIR, argv);
    let rv = run_task(device, cfg.repair_timeout, &task, result);
    if rv != 0 {
        error!(
            "repair binary {binary} returned {rv} = '{}'",
            errcode::describe(rv)
        );
    }
    rv
}

/// Feed one probe result through the policy.
///
/// Returns `Some(code)` when the failure could not be resolved and the
/// shutdown state machine must take over; `None` otherwise. With
/// `no_action` the surfaced code is logged and swallowed — no reboot
/// path is ever entered.
pub fn handle(
    device: &WatchdogDevice,
    cfg: &Config,
    no_action: bool,
    mut act: Option<&mut Descriptor>,
    result: i32,
) -> Option<i32> {
    let (name, version) = act
        .as_deref()
        .map(|d| (d.name.clone(), d.version))
        .unwrap_or_default();

    let final_code = match assess(act.as_deref_mut(), result, clock::now(), cfg) {
        Disposition::Continue | Disposition::Suppress => return None,
        Disposition::Surface => result,
        Disposition::AttemptRepair => match repair(device, cfg, result, &name, version) {
            0 => return None,
            code => code,
        },
    };

    if no_action {
        debug!(
            "shutdown blocked by --no-action (error {final_code} = '{}')",
            errcode::describe(final_code)
        );
        return None;
    }
    Some(final_code)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::descriptor::Payload;
    use vigil_common::errcode::{EDONTKNOW, ENOCHANGE, ENOERR, ERESET, ETOOHOT};

    fn desc(name: &str) -> Descriptor {
        Descriptor::new(name, 0, Payload::None)
    }

    fn cfg(retry_timeout: i32, repair_max: i32) -> Config {
        Config {
            retry_timeout,
            repair_max,
            ..Config::default()
        }
    }

    #[test]
    fn success_resets_failure_state() {
        let cfg = cfg(30, 1);
        let mut d = desc("/some/file");
        d.first_failure = 10;
        d.repair_count = 2;
        assert_eq!(assess(Some(&mut d), ENOERR, 50, &cfg), Disposition::Continue);
        assert_eq!(d.first_failure, 0);
        assert_eq!(d.repair_count, 0);
    }

    #[test]
    fn dont_know_changes_nothing() {
        let cfg = cfg(30, 1);
        let mut d = desc("/some/file");
        d.first_failure = 10;
        d.repair_count = 1;
        assert_eq!(assess(Some(&mut d), EDONTKNOW, 50, &cfg), Disposition::Continue);
        assert_eq!(d.first_failure, 10);
        assert_eq!(d.repair_count, 1);
    }

    #[test]
    fn fatal_codes_bypass_repair() {
        let cfg = cfg(30, 1);
        let mut d = desc("sensor");
        assert_eq!(assess(Some(&mut d), ETOOHOT, 50, &cfg), Disposition::Surface);
        assert_eq!(assess(Some(&mut d), ERESET, 50, &cfg), Disposition::Surface);
        assert_eq!(d.repair_count, 0, "fatal results never touch the budget");
    }

    // First offence at t=66 starts the window, no repair yet.
    #[test]
    fn first_offence_is_suppressed_and_timestamped() {
        let cfg = cfg(30, 1);
        let mut d = desc("/path/file");
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 66, &cfg), Disposition::Suppress);
        assert_eq!(d.first_failure, 66);
        assert_eq!(d.repair_count, 0);
    }

    // By t=120 the 30 s window has expired.
    #[test]
    fn expired_window_escalates_to_repair() {
        let cfg = cfg(30, 1);
        let mut d = desc("/path/file");
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 66, &cfg), Disposition::Suppress);
        assert_eq!(
            assess(Some(&mut d), ENOCHANGE, 120, &cfg),
            Disposition::AttemptRepair
        );
        assert_eq!(d.repair_count, 1);
        // The window restarts for the next attempt.
        assert_eq!(d.first_failure, 0);
    }

    #[test]
    fn failure_inside_the_window_keeps_suppressing() {
        let cfg = cfg(30, 1);
        let mut d = desc("/path/file");
        assess(Some(&mut d), ENOCHANGE, 66, &cfg);
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 80, &cfg), Disposition::Suppress);
        assert_eq!(d.first_failure, 66);
    }

    // repair-maximum=2 allows attempts 1 and 2, then surfaces.
    #[test]
    fn repair_budget_is_enforced() {
        let cfg = cfg(0, 2);
        let mut d = desc("probe");
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 10, &cfg), Disposition::AttemptRepair);
        assert_eq!(d.repair_count, 1);
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 11, &cfg), Disposition::AttemptRepair);
        assert_eq!(d.repair_count, 2);
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 12, &cfg), Disposition::Surface);
        assert_eq!(d.repair_count, 3);
        // A success in between resets the budget.
        assess(Some(&mut d), ENOERR, 13, &cfg);
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 14, &cfg), Disposition::AttemptRepair);
        assert_eq!(d.repair_count, 1);
    }

    #[test]
    fn repair_count_is_non_decreasing_between_successes() {
        let cfg = cfg(0, 5);
        let mut d = desc("probe");
        let mut last = 0;
        for t in 0..4 {
            assess(Some(&mut d), ENOCHANGE, 10 + t, &cfg);
            assert!(d.repair_count >= last);
            last = d.repair_count;
        }
    }

    #[test]
    fn zero_retry_timeout_repairs_immediately() {
        // --softboot zeroes retry-timeout; zero and "not configured" are
        // the same: no window, straight to repair.
        let cfg = cfg(0, 0);
        let mut d = desc("probe");
        assert_eq!(assess(Some(&mut d), ENOCHANGE, 10, &cfg), Disposition::AttemptRepair);
        assert_eq!(d.first_failure, 0);
        // Unlimited budget: the counter is not even maintained.
        assert_eq!(d.repair_count, 0);
    }

    #[test]
    fn detached_results_repair_immediately() {
        // Keep-alive and sync results carry no descriptor: no retry
        // window applies, the global binary is tried at once.
        let cfg = cfg(30, 1);
        assert_eq!(assess(None, ENOCHANGE, 10, &cfg), Disposition::AttemptRepair);
    }

    #[test]
    fn repair_argv_version0_matches_the_convention() {
        let argv = repair_argv(0, Some("/usr/sbin/repair"), 250, "/path/file").unwrap();
        assert_eq!(argv, ["/usr/sbin/repair", "/usr/sbin/repair", "250", "/path/file"]);
        // Without a probe name the argument is simply absent.
        let argv = repair_argv(0, Some("/usr/sbin/repair"), 250, "").unwrap();
        assert_eq!(argv, ["/usr/sbin/repair", "/usr/sbin/repair", "250"]);
    }

    #[test]
    fn repair_argv_version1_is_self_repair() {
        let argv = repair_argv(1, None, 250, "/etc/vigil.d/check").unwrap();
        assert_eq!(
            argv,
            ["/etc/vigil.d/check", "/etc/vigil.d/check", "repair", "250", "/etc/vigil.d/check"]
        );
    }

    #[test]
    fn repair_argv_without_any_binary_is_none() {
        assert_eq!(repair_argv(0, None, 250, "name"), None);
        assert_eq!(repair_argv(1, Some("/bin/r"), 250, ""), None);
    }

    #[test]
    fn no_action_swallows_surfaced_codes() {
        let device = WatchdogDevice::closed();
        let cfg = cfg(30, 1);
        let mut d = desc("sensor");
        assert_eq!(handle(&device, &cfg, true, Some(&mut d), ETOOHOT), None);
        assert_eq!(
            handle(&device, &cfg, false, Some(&mut d), ETOOHOT),
            Some(ETOOHOT)
        );
    }
}
