//! File-table pressure check.
//!
//! `/proc/sys/fs/file-nr` reports allocated handles, free handles among
//! the allocated, and the system-wide maximum. A full table means even
//! our own repair helpers cannot open files any more.

use std::fs;

use tracing::{error, warn};

use vigil_common::errcode::{EDONTKNOW, ENOERR};

const FILE_NR: &str = "/proc/sys/fs/file-nr";

/// Parse the three file-nr counters: (allocated, free, max).
pub fn parse_file_nr(content: &str) -> Option<(u64, u64, u64)> {
    let mut fields = content.split_whitespace();
    let allocated = fields.next()?.parse().ok()?;
    let free = fields.next()?.parse().ok()?;
    let max = fields.next()?.parse().ok()?;
    Some((allocated, free, max))
}

/// Check the system file table.
pub fn check() -> i32 {
    let content = match fs::read_to_string(FILE_NR) {
        Ok(c) => c,
        Err(e) => {
            warn!("cannot read {FILE_NR} ({e})");
            return EDONTKNOW;
        }
    };

    let Some((allocated, free, max)) = parse_file_nr(&content) else {
        warn!("{FILE_NR} contains no usable data");
        return EDONTKNOW;
    };

    if max > 0 && allocated.saturating_sub(free) >= max {
        error!("file table full: {allocated} allocated, {free} free, {max} maximum");
        return libc::ENFILE;
    }
    ENOERR
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_kernel_format() {
        assert_eq!(parse_file_nr("3424\t0\t9223372036854775807\n"), Some((3424, 0, 9223372036854775807)));
        assert_eq!(parse_file_nr("100 20 200"), Some((100, 20, 200)));
        assert_eq!(parse_file_nr(""), None);
        assert_eq!(parse_file_nr("only two 1"), None);
    }

    #[test]
    fn live_check_passes_on_a_healthy_machine() {
        assert_eq!(check(), ENOERR);
    }
}
