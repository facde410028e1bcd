//! Monotonic time and the timed sleep that keeps the hardware fed.

use std::thread;
use std::time::Duration;

use nix::time::{ClockId, clock_gettime};

use crate::device::WatchdogDevice;

/// Monotonic "now" in whole seconds, immune to wall-clock jumps.
///
/// One is added to the raw reading: on a very fast start-up the uptime
/// seconds could still be 0, which is the value reserved everywhere else
/// for "timer not started".
pub fn now() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => 1 + ts.tv_sec() as u64,
        // The monotonic clock cannot realistically fail on Linux; if it
        // somehow does, returning the reserved value keeps timers inert
        // instead of tripping spurious retry windows.
        Err(_) => 0,
    }
}

/// Sleep for `secs` seconds while issuing one keep-alive per second.
///
/// Safe to call with a duration longer than the hardware timeout; the
/// device is petted before every one-second slice.
pub fn safe_sleep(device: &WatchdogDevice, secs: i32) {
    for _ in 0..secs.max(0) {
        device.keep_alive();
        thread::sleep(Duration::from_secs(1));
    }
    device.keep_alive();
}

/// Sleep for an arbitrary duration in one-second keep-alive slices.
///
/// Used for the tail of the probe cycle, where the remainder is not a
/// whole number of seconds.
pub fn safe_sleep_duration(device: &WatchdogDevice, mut remaining: Duration) {
    while !remaining.is_zero() {
        device.keep_alive();
        let slice = remaining.min(Duration::from_secs(1));
        thread::sleep(slice);
        remaining -= slice;
    }
    device.keep_alive();
}

// ─── Tests ──────────────────────────────────────────────────────────
