//! Network-interface progress check.
//!
//! An interface counts as alive while its receive+transmit byte counter
//! keeps moving between cycles. The first observation only seeds the
//! counter; a later cycle with no movement at all reports stagnation.

use std::fs;

use tracing::{debug, error};

use vigil_common::descriptor::{Descriptor, Payload};
use vigil_common::errcode::{ENOCHANGE, ENOERR};

const NET_DEV: &str = "/proc/net/dev";

/// Find the rx+tx byte total for `name` in /proc/net/dev content.
///
/// Lines look like `  eth0: 12345 84 0 0 0 0 0 0 67890 52 ...` with
/// receive bytes first and transmit bytes in the ninth column.
pub fn total_bytes(content: &str, name: &str) -> Option<u64> {
    for line in content.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() != name {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let rx: u64 = fields.first()?.parse().ok()?;
        let tx: u64 = fields.get(8)?.parse().ok()?;
        return Some(rx + tx);
    }
    None
}

/// Compare against the previous counter; `None` means first observation.
pub fn assess(previous: Option<u64>, total: u64) -> i32 {
    match previous {
        Some(p) if p == total => ENOCHANGE,
        _ => ENOERR,
    }
}

/// Check that the interface moved bytes since the last cycle.
pub fn check(d: &mut Descriptor) -> i32 {
    let content = match fs::read_to_string(NET_DEV) {
        Ok(c) => c,
        Err(e) => {
            let err = e.raw_os_error().unwrap_or(libc::EIO);
            error!("cannot read {NET_DEV} ({e})");
            return err;
        }
    };

    let Some(total) = total_bytes(&content, &d.name) else {
        error!("interface {} is not listed in {NET_DEV}", d.name);
        return libc::ENODEV;
    };

    let Payload::Interface { last_bytes } = &mut d.payload else {
        return ENOERR;
    };

    let rv = assess(*last_bytes, total);
    if rv == ENOCHANGE {
        error!("interface {} did not receive or send anything", d.name);
    } else if let Some(previous) = *last_bytes {
        debug!("interface {} moved {} bytes", d.name, total - previous);
    }
    *last_bytes = Some(total);
    rv
}

// ─── Tests ──────────────────────────────────────────────────────────
