//! Rolling heartbeat stamp file.
//!
//! Every keep-alive appends the monotonic timestamp, keeping at most
//! `heartbeat-stamps` entries. Records are fixed-width (12 bytes) and
//! the file is rewritten in place, so a reader — or a post-mortem —
//! always sees whole stamps.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use tracing::{error, info};

use vigil_common::config::Config;

/// Width of one stamp record, including the newline.
const STAMP_WIDTH: usize = 12;

#[derive(Debug, Default)]
pub struct Heartbeat {
    file: Option<File>,
    stamps: VecDeque<u64>,
    max: usize,
}

impl Heartbeat {
    /// Open the heartbeat file if one is configured.
    ///
    /// Failure is logged and heartbeats are skipped; a missing heartbeat
    /// file must never stop the supervision loop.
    pub fn open(cfg: &Config) -> Self {
        let Some(path) = cfg.heartbeat_file.as_deref() else {
            return Self::default();
        };
        match OpenOptions::new().write(true).create(true).truncate(true).open(path) {
            Ok(file) => {
                info!("heartbeat file {} opened", path.display());
                Self {
                    file: Some(file),
                    stamps: VecDeque::new(),
                    max: cfg.heartbeat_stamps.max(1) as usize,
                }
            }
            Err(e) => {
                error!("cannot open heartbeat file {} ({e})", path.display());
                Self::default()
            }
        }
    }

    /// Record one keep-alive timestamp.
    pub fn mark(&mut self, now: u64) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        self.stamps.push_back(now);
        while self.stamps.len() > self.max {
            self.stamps.pop_front();
        }

        let mut buf = String::with_capacity(self.stamps.len() * STAMP_WIDTH);
        for stamp in &self.stamps {
            buf.push_str(&format!("{stamp:>11}\n"));
        }
        let rv = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.set_len(0))
            .and_then(|_| file.write_all(buf.as_bytes()));
        if let Err(e) = rv {
            error!("cannot write heartbeat ({e})");
        }
    }

    /// Close the file; the stamp history is left on disk for inspection.
    pub fn close(&mut self) {
        self.file = None;
        self.stamps.clear();
    }

    #[cfg(test)]
    fn open_at(path: &std::path::Path, max: usize) -> Self {
        let cfg = Config {
            heartbeat_file: Some(path.to_path_buf()),
            heartbeat_stamps: max as i32,
            ..Config::default()
        };
        Self::open(&cfg)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_fixed_width_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat");
        let mut hb = Heartbeat::open_at(&path, 10);
        hb.mark(1);
        hb.mark(123456);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.len(), 2 * STAMP_WIDTH);
        assert_eq!(content.lines().count(), 2);
        assert_eq!(content.lines().last().unwrap().trim(), "123456");
    }

    #[test]
    fn history_is_capped_at_the_configured_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat");
        let mut hb = Heartbeat::open_at(&path, 3);
        for t in 1..=5 {
            hb.mark(t);
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let stamps: Vec<&str> = content.lines().map(str::trim).collect();
        assert_eq!(stamps, ["3", "4", "5"]);
    }

    #[test]
    fn unconfigured_heartbeat_is_inert() {
        let mut hb = Heartbeat::open(&Config::default());
        hb.mark(1);
        hb.close();
    }
}
