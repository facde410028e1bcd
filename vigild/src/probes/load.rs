//! Load-average check.
//!
//! `/proc/loadavg` is opened once and re-read in place each cycle, so
//! the check still works when the file table is exhausted later on.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use tracing::{error, info};

use vigil_common::config::Config;
use vigil_common::errcode::{EMAXLOAD, ENOERR, ENOLOAD};

const LOADAVG: &str = "/proc/loadavg";

/// Parse the three load averages from a /proc/loadavg line.
pub fn parse_loadavg(content: &str) -> Option<(f64, f64, f64)> {
    let mut fields = content.split_whitespace();
    let l1 = fields.next()?.parse().ok()?;
    let l5 = fields.next()?.parse().ok()?;
    let l15 = fields.next()?.parse().ok()?;
    Some((l1, l5, l15))
}

/// Decide whether any configured limit is exceeded.
pub fn assess(loads: (f64, f64, f64), cfg: &Config) -> i32 {
    let (l1, l5, l15) = loads;
    let over = (cfg.max_load1 > 0 && l1 > cfg.max_load1 as f64)
        || (cfg.max_load5 > 0 && l5 > cfg.max_load5 as f64)
        || (cfg.max_load15 > 0 && l15 > cfg.max_load15 as f64);
    if over {
        error!(
            "loadavg {l1} {l5} {l15} is higher than the given threshold {} {} {}",
            cfg.max_load1, cfg.max_load5, cfg.max_load15
        );
        EMAXLOAD
    } else {
        ENOERR
    }
}

#[derive(Debug, Default)]
pub struct LoadCheck {
    file: Option<File>,
}

impl LoadCheck {
    /// Open /proc/loadavg if any load limit is configured.
    pub fn open(&mut self, cfg: &Config) {
        if cfg.max_load1 == 0 && cfg.max_load5 == 0 && cfg.max_load15 == 0 {
            return;
        }
        match File::open(LOADAVG) {
            Ok(file) => {
                self.file = Some(file);
                info!(
                    "load average checking enabled ({}, {}, {})",
                    cfg.max_load1, cfg.max_load5, cfg.max_load15
                );
            }
            Err(e) => error!("cannot open {LOADAVG} ({e})"),
        }
    }

    pub fn check(&mut self, cfg: &Config) -> i32 {
        let Some(file) = self.file.as_mut() else {
            return ENOERR;
        };

        let mut content = String::new();
        let rv = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut content));
        if let Err(e) = rv {
            error!("cannot read {LOADAVG} ({e})");
            return e.raw_os_error().unwrap_or(libc::EIO);
        }

        match parse_loadavg(&content) {
            Some(loads) => assess(loads, cfg),
            None => {
                error!("{LOADAVG} contains no data");
                ENOLOAD
            }
        }
    }

    pub fn close(&mut self) {
        self.file = None;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
