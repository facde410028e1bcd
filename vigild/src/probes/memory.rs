//! Free- and allocatable-memory checks.
//!
//! The free check parses MemFree + SwapFree out of a held-open
//! `/proc/meminfo`; the allocatable check actually maps and touches the
//! configured number of pages, because a machine can report plenty of
//! free memory while being unable to hand any of it out.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ptr;

use tracing::{error, info};

use vigil_common::config::{Config, EXEC_PAGESIZE};
use vigil_common::errcode::{EINVMEM, ENOERR};

const MEMINFO: &str = "/proc/meminfo";

/// Extract a `Name: <n> kB` value from /proc/meminfo content.
fn meminfo_field(content: &str, name: &str) -> Option<i64> {
    content
        .lines()
        .find(|l| l.starts_with(name))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Free pages available to user space: MemFree + SwapFree.
pub fn parse_free_pages(content: &str) -> Option<i64> {
    let mem_free = meminfo_field(content, "MemFree:")?;
    let swap_free = meminfo_field(content, "SwapFree:")?;
    Some((mem_free + swap_free) * 1024 / EXEC_PAGESIZE)
}

#[derive(Debug, Default)]
pub struct MemoryCheck {
    file: Option<File>,
}

impl MemoryCheck {
    pub fn open(&mut self, cfg: &Config) {
        if cfg.min_memory == 0 {
            return;
        }
        match File::open(MEMINFO) {
            Ok(file) => {
                self.file = Some(file);
                info!(
                    "memory checking enabled (minimum {} pages of {} bytes)",
                    cfg.min_memory, EXEC_PAGESIZE
                );
            }
            Err(e) => error!("cannot open {MEMINFO} ({e})"),
        }
    }

    /// Check free (+ swap) pages against the configured minimum.
    pub fn check_free(&mut self, cfg: &Config) -> i32 {
        let Some(file) = self.file.as_mut() else {
            return ENOERR;
        };

        let mut content = String::new();
        let rv = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut content));
        if let Err(e) = rv {
            error!("cannot read {MEMINFO} ({e})");
            return e.raw_os_error().unwrap_or(libc::EIO);
        }

        let Some(pages) = parse_free_pages(&content) else {
            error!("{MEMINFO} contains invalid data");
            return EINVMEM;
        };

        if pages < cfg.min_memory {
            error!("memory {pages} pages is less than {} pages", cfg.min_memory);
            return libc::ENOMEM;
        }
        ENOERR
    }

    pub fn close(&mut self) {
        self.file = None;
    }
}

/// Probe that the kernel will still hand out memory, by mapping and
/// touching the configured number of anonymous pages.
pub fn check_allocatable(cfg: &Config) -> i32 {
    if cfg.alloc_memory <= 0 {
        return ENOERR;
    }
    let len = cfg.alloc_memory as usize * EXEC_PAGESIZE as usize;

    // SAFETY: anonymous private mapping; the pointer is only used inside
    // this function and unmapped before return.
    unsafe {
        let ptr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            error!(
                "cannot allocate {} pages ({})",
                cfg.alloc_memory,
                std::io::Error::last_os_error()
            );
            return libc::ENOMEM;
        }

        // Touch one byte per page so the pages really get backed.
        let bytes = ptr as *mut u8;
        let mut offset = 0;
        while offset < len {
            ptr::write_volatile(bytes.add(offset), 0xff);
            offset += EXEC_PAGESIZE as usize;
        }

        libc::munmap(ptr, len);
    }
    ENOERR
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MemTotal:       16384000 kB\n\
                          MemFree:         4096000 kB\n\
                          MemAvailable:    8192000 kB\n\
                          SwapTotal:       2048000 kB\n\
                          SwapFree:        2048000 kB\n";

    #[test]
    fn parses_free_plus_swap_pages() {
        let pages = parse_free_pages(SAMPLE).unwrap();
        assert_eq!(pages, (4_096_000 + 2_048_000) * 1024 / EXEC_PAGESIZE);
    }

    #[test]
    fn missing_fields_are_invalid() {
        assert_eq!(parse_free_pages("MemFree: 100 kB\n"), None);
        assert_eq!(parse_free_pages(""), None);
    }

    #[test]
    fn unopened_checker_reports_success() {
        let mut check = MemoryCheck::default();
        assert_eq!(check.check_free(&Config::default()), ENOERR);
    }

    #[test]
    fn small_allocation_probe_succeeds() {
        let cfg = Config {
            alloc_memory: 4,
            ..Config::default()
        };
        assert_eq!(check_allocatable(&cfg), ENOERR);
    }

    #[test]
    fn disabled_allocation_probe_is_a_noop() {
        assert_eq!(check_allocatable(&Config::default()), ENOERR);
    }
}
