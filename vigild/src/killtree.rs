//! Process-tree signalling.
//!
//! Two entry points: [`signal_all_users`] stops the whole machine and
//! signals every process we are allowed to touch (sparing the kernel,
//! ourselves, and optionally our session and privileged daemons), and
//! [`kill_tree`] signals one process and its descendants, children
//! strictly before their parent so re-parenting to init cannot hide a
//! grandchild from the ppid scan.
//!
//! Both work from an ephemeral snapshot of `/proc`; the snapshot may be
//! short if the system is out of memory, which is why callers invoke the
//! mass kill twice in quick succession.

use std::fs;

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getpid};
use tracing::{debug, error, warn};

use crate::logging;

/// Processes owned by a UID below this are spared in the first,
/// non-aggressive round: killing syslog and friends too early makes the
/// remaining shutdown blind.
const MORTAL_UID: u32 = 110;

/// Recursion limit for [`kill_tree`]; the only defence against cycles
/// introduced by re-parenting races.
const MAX_DEPTH: i32 = 5;

/// One `/proc` snapshot entry.
#[derive(Debug, Clone, Copy)]
struct Proc {
    pid: i32,
    ppid: i32,
    sid: i32,
}

/// Parse the ppid and session id out of a `/proc/<pid>/stat` line.
///
/// The comm field is parenthesised and may itself contain spaces or
/// parentheses, so scanning starts after the *last* ')'.
fn parse_stat_ids(stat: &str) -> Option<(i32, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    let _pgrp: i32 = fields.next()?.parse().ok()?;
    let sid = fields.next()?.parse().ok()?;
    Some((ppid, sid))
}

/// Snapshot the process table. May be short under memory pressure; an
/// unreadable `/proc` yields an empty list and the caller falls back to
/// `kill(-1, sig)`.
fn read_processes() -> Vec<Proc> {
    let mut list = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        error!("cannot read /proc for the process snapshot");
        return list;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let (ppid, sid) = fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .as_deref()
            .and_then(parse_stat_ids)
            .unwrap_or((0, 0));
        list.push(Proc { pid, ppid, sid });
    }
    list
}

/// Whether this process is fair game in the non-aggressive round.
fn is_mortal(pid: i32) -> bool {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(format!("/proc/{pid}"))
        .map(|m| m.uid() >= MORTAL_UID)
        .unwrap_or(false)
}

/// Send `sig` to "all" processes.
///
/// Stops everything with SIGSTOP, snapshots the table, signals each
/// entry except ourselves and kernel processes (session id 0), then lets
/// the world continue. With `aggressive` false, our own session and
/// below-threshold UIDs are spared as well. Logging is suspended for the
/// duration so we do not write into a stopped logger.
pub fn signal_all_users(sig: Signal, aggressive: bool) {
    let myself = getpid().as_raw();

    logging::suspend();
    let _ = kill(Pid::from_raw(-1), Signal::SIGSTOP);

    let procs = read_processes();
    if procs.is_empty() {
        // Totally out of memory or file handles: last resort is the
        // kernel broadcast, which on Linux spares the caller.
        let _ = kill(Pid::from_raw(-1), sig);
    } else {
        let own_sid = procs
            .iter()
            .find(|p| p.pid == myself)
            .map_or(-1, |p| p.sid);

        // Init must be signalled too: not because it can die, but if we
        // don't try, respawned services keep filesystems busy later.
        for p in procs.iter().filter(|p| p.pid != myself && p.sid != 0) {
            if aggressive || (p.sid != own_sid && is_mortal(p.pid)) {
                let _ = kill(Pid::from_raw(p.pid), sig);
            }
        }
    }

    let _ = kill(Pid::from_raw(-1), Signal::SIGCONT);
    logging::resume();
}

fn kill_recursively(procs: &[Proc], pid: i32, sig: Signal, depth: i32) -> usize {
    if depth <= 0 {
        warn!("recursion limit reached for PID={pid}");
        return 0;
    }

    let mut count = 0;
    if kill(Pid::from_raw(pid), Signal::SIGSTOP).is_ok() {
        // Children first: once the parent is signalled, its children
        // re-parent to init and the ppid match would miss them.
        for child in procs.iter().filter(|p| p.ppid == pid) {
            count += kill_recursively(procs, child.pid, sig, depth - 1);
        }
        debug!("sending signal {:2} to PID {pid} (depth {depth})", sig as i32);
        let _ = kill(Pid::from_raw(pid), sig);
        let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
        count += 1;
    }
    count
}

/// Signal `pid` and every descendant, children before parents.
///
/// Used on test and repair children that missed their deadline, where a
/// wrapping shell may not forward signals to the real blocker. Returns
/// the number of processes signalled.
pub fn kill_tree(pid: Pid, sig: Signal) -> usize {
    let mut count = 0;
    if kill(pid, Signal::SIGSTOP).is_ok() {
        let procs = read_processes();
        if procs.is_empty() {
            let _ = kill(pid, sig);
            let _ = kill(pid, Signal::SIGCONT);
            count = 1;
        } else {
            count = kill_recursively(&procs, pid.as_raw(), sig, MAX_DEPTH);
        }
    }
    count
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    #[test]
    fn parse_stat_ids_handles_parenthesised_comm() {
        let line = "1234 (a (weird) name) S 77 1234 99 34827 1234 4202496 321 0 0 0";
        assert_eq!(parse_stat_ids(line), Some((77, 99)));
    }

    #[test]
    fn parse_stat_ids_rejects_garbage() {
        assert_eq!(parse_stat_ids("not a stat line"), None);
        assert_eq!(parse_stat_ids("1 (x) S"), None);
    }

    #[test]
    fn snapshot_contains_ourselves() {
        let me = getpid().as_raw();
        let procs = read_processes();
        let entry = procs.iter().find(|p| p.pid == me).expect("own pid listed");
        assert!(entry.sid != 0, "we are not a kernel process");
    }

    #[test]
    fn kill_tree_signals_a_sleeping_child() {
        // SAFETY: the child only sleeps and exits; no locks are held.
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => {
                std::thread::sleep(std::time::Duration::from_secs(30));
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                std::thread::sleep(std::time::Duration::from_millis(100));
                let count = kill_tree(child, Signal::SIGKILL);
                assert!(count >= 1, "signalled {count} processes");
                match waitpid(child, None).expect("waitpid") {
                    WaitStatus::Signaled(_, Signal::SIGKILL, _) => {}
                    other => panic!("unexpected wait status {other:?}"),
                }
            }
        }
    }

    #[test]
    fn kill_tree_on_a_dead_pid_is_harmless() {
        // PID near the default pid_max limit, extremely unlikely to exist.
        assert_eq!(kill_tree(Pid::from_raw(0x3ffffe), Signal::SIGTERM), 0);
    }
}
