//! Per-probe descriptor records.
//!
//! A descriptor is the one place per-probe state survives across loop
//! iterations: the identity of the check, the retry/repair bookkeeping
//! the repair policy mutates, and a kind-specific payload. Descriptors
//! live in ordered lists owned by the probe registry for the lifetime
//! of the daemon; probes receive a borrowed reference.

use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;

/// Kind-specific payload carried by a descriptor.
#[derive(Debug, Default)]
pub enum Payload {
    /// No payload (pidfiles, test binaries, pseudo-descriptors).
    #[default]
    None,
    /// Ping target: resolved address, raw ICMP socket and the rolling
    /// echo sequence number. The socket is opened at startup and closed
    /// with the registry.
    Ping {
        addr: Ipv4Addr,
        sock: Option<OwnedFd>,
        seq: u16,
    },
    /// File probe: expected change interval in seconds (0 = stat only).
    File { mtime: i32 },
    /// Interface probe: byte counter observed last cycle, if any.
    Interface { last_bytes: Option<u64> },
    /// Temperature sensor: whether the sensor could be opened, the last
    /// readings (newest first) and which approach warnings have fired.
    Temperature {
        in_use: bool,
        recent: [i32; 3],
        have: u8,
        warned: u8,
    },
}

/// One check instance with its retry/repair state.
#[derive(Debug, Default)]
pub struct Descriptor {
    /// Display name: a path, an address, an interface name.
    pub name: String,
    /// Calling-convention version for the repair binary (0 or 1).
    pub version: u8,
    /// Monotonic timestamp of the first outstanding failure; 0 when none.
    pub first_failure: u64,
    /// Repair attempts since the last success.
    pub repair_count: i32,
    /// Kind-specific payload.
    pub payload: Payload,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, version: u8, payload: Payload) -> Self {
        Self {
            name: name.into(),
            version,
            first_failure: 0,
            repair_count: 0,
            payload,
        }
    }

    /// Whether a failure is currently recorded for this probe.
    pub fn has_outstanding_failure(&self) -> bool {
        self.first_failure != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_descriptor_has_no_failure_state() {
        let d = Descriptor::new("/var/run/test.pid", 0, Payload::None);
        assert_eq!(d.first_failure, 0);
        assert_eq!(d.repair_count, 0);
        assert!(!d.has_outstanding_failure());
    }

    #[test]
    fn outstanding_failure_tracks_timestamp() {
        let mut d = Descriptor::new("eth0", 0, Payload::Interface { last_bytes: None });
        d.first_failure = 17;
        assert!(d.has_outstanding_failure());
        d.first_failure = 0;
        assert!(!d.has_outstanding_failure());
    }
}
