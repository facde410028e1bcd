//! Immutable configuration snapshot and parameter sanity checks.
//!
//! The snapshot is built once at startup from the line-oriented
//! `key = value` configuration file (parsed in the daemon crate) and is
//! then passed around by shared reference; nothing mutates it after load.
//!
//! `validate()` implements the pre-flight sanity checks the daemon runs
//! unless `--force` is given. It reports every problem found instead of
//! stopping at the first so the operator can fix the file in one pass.

use std::path::PathBuf;

/// Hardware timeout must exceed the polling interval by this margin.
pub const TIMEOUT_MARGIN: i32 = 2;
/// Default value shared by the four time-outs (seconds).
pub const TIMER_MARGIN: i32 = 60;
/// Minimum accepted hardware timeout; testing shows drivers misbehave below this.
pub const MIN_WD_TIMEOUT: i32 = 3;
/// Maximum accepted hardware timeout.
pub const MAX_WD_TIMEOUT: i32 = 600;
/// Upper bound for the generic time-out options.
pub const MAX_TIME: i32 = 100_000;
/// Upper bound for the load-average limits.
pub const MAX_LOAD: i32 = 2000;
/// A load-average limit below this would reboot a healthy machine.
pub const MIN_LOAD: i32 = 2;
/// Page size assumed when converting kB counts from /proc into pages.
pub const EXEC_PAGESIZE: i64 = 4096;
/// Lower limit on a sensible maximum temperature (Celsius).
const MIN_SANE_TEMPERATURE: i32 = 55;

/// One file-mtime probe entry: path plus the expected change interval
/// in seconds (0 means "just stat it").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProbe {
    pub path: String,
    pub mtime: i32,
}

/// One test-binary entry. Version 0 binaries use the global repair
/// binary; version 1 binaries are self-repairing (invoked with a
/// `test` / `repair` first argument).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBinary {
    pub path: String,
    pub version: u8,
}

/// The full configuration snapshot, immutable after load.
#[derive(Debug, Clone)]
pub struct Config {
    /// Probe cadence in seconds.
    pub interval: i32,
    /// Emit the verbose "still alive" message every this many intervals.
    pub logtick: i32,
    /// Scheduling priority used when `realtime` is enabled.
    pub priority: i32,
    /// Lock memory and elevate scheduling before entering the loop.
    pub realtime: bool,
    /// 1-minute load-average limit (0 disables).
    pub max_load1: i32,
    /// 5-minute load-average limit (0 disables).
    pub max_load5: i32,
    /// 15-minute load-average limit (0 disables).
    pub max_load15: i32,
    /// Minimum free (+ swap) pages (0 disables).
    pub min_memory: i64,
    /// Minimum allocatable pages, probed with an anonymous map (0 disables).
    pub alloc_memory: i64,
    /// Maximum sensor temperature in Celsius.
    pub max_temperature: i32,
    /// Echo requests per ping target per cycle.
    pub ping_count: i32,
    /// Power off instead of rebooting when shutting down because of heat.
    pub temp_poweroff: bool,
    /// Seconds from the first termination pass to the non-catchable kill.
    pub sigterm_delay: i32,
    /// Repair attempts allowed without an intervening success (0 = unlimited).
    pub repair_max: i32,
    /// Window in which repeated failures are suppressed before repairing
    /// (0 = repair immediately).
    pub retry_timeout: i32,
    /// Time budget for one test-binary run.
    pub test_timeout: i32,
    /// Time budget for one repair-binary run.
    pub repair_timeout: i32,
    /// Hardware watchdog timeout.
    pub dev_timeout: i32,
    /// Administrator mail address, if any.
    pub admin: Option<String>,
    /// Watchdog device node, if any.
    pub device: Option<PathBuf>,
    /// Global (version-0) repair binary.
    pub repair_binary: Option<String>,
    /// Rolling keep-alive stamp file.
    pub heartbeat_file: Option<PathBuf>,
    /// Maximum stamps kept in the heartbeat file.
    pub heartbeat_stamps: i32,
    /// Directory for child stdout/stderr captures and the daemon log.
    pub log_dir: PathBuf,
    /// Directory scanned for auto-registered version-1 test binaries.
    pub test_directory: Option<PathBuf>,
    /// `verbose = yes` in the file, merged with the command line count.
    pub verbose: bool,
    /// Real-time clock keeps UTC (from /etc/default/rcS, default yes).
    pub rtc_utc: bool,

    // Ordered probe lists; order in the file is preserved.
    pub files: Vec<FileProbe>,
    pub ping_targets: Vec<String>,
    pub pidfiles: Vec<String>,
    pub interfaces: Vec<String>,
    pub temp_sensors: Vec<String>,
    pub test_binaries: Vec<TestBinary>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: 1,
            logtick: 1,
            priority: 1,
            realtime: false,
            max_load1: 0,
            max_load5: 0,
            max_load15: 0,
            min_memory: 0,
            alloc_memory: 0,
            max_temperature: 90,
            ping_count: 3,
            temp_poweroff: true,
            sigterm_delay: 5,
            repair_max: 1,
            retry_timeout: TIMER_MARGIN,
            test_timeout: TIMER_MARGIN,
            repair_timeout: TIMER_MARGIN,
            dev_timeout: TIMER_MARGIN,
            admin: Some("root".to_string()),
            device: None,
            repair_binary: None,
            heartbeat_file: None,
            heartbeat_stamps: 300,
            log_dir: PathBuf::from("/var/log/vigil"),
            test_directory: None,
            verbose: false,
            rtc_utc: true,
            files: Vec::new(),
            ping_targets: Vec::new(),
            pidfiles: Vec::new(),
            interfaces: Vec::new(),
            temp_sensors: Vec::new(),
            test_binaries: Vec::new(),
        }
    }
}

impl Config {
    /// Check the configured parameters for sensibility.
    ///
    /// Returns one message per problem found; an empty vector means the
    /// configuration passed. The caller decides whether `--force`
    /// overrides a non-empty result.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let max_timeout = (15 * self.dev_timeout).max(120);

        // The polling interval against the hardware timer - VERY important.
        if self.dev_timeout - self.interval < TIMEOUT_MARGIN {
            problems.push(format!(
                "this interval length ({}) might reboot the system while the process sleeps \
                 (watchdog-timeout = {})",
                self.interval, self.dev_timeout
            ));
        }

        for (name, limit) in [
            ("1-minute", self.max_load1),
            ("5-minute", self.max_load5),
            ("15-minute", self.max_load15),
        ] {
            if limit > 0 && limit < MIN_LOAD {
                problems.push(format!(
                    "using this maximal {name} load average ({limit}) might reboot the system \
                     too often"
                ));
            }
        }

        for (name, value, min) in [
            ("repair", self.repair_timeout, 1),
            ("test", self.test_timeout, 1),
            // Zeroing the retry time-out is not unreasonable.
            ("retry", self.retry_timeout, 0),
        ] {
            if value < min || value > max_timeout {
                problems.push(format!(
                    "this {name} time-out ({value}) looks out of a sensible range \
                     ({min}..{max_timeout})"
                ));
            }
        }

        if !self.temp_sensors.is_empty() && self.max_temperature < MIN_SANE_TEMPERATURE {
            problems.push(format!(
                "max temperature of {} is too low to be sensible (limit = {}C)",
                self.max_temperature, MIN_SANE_TEMPERATURE
            ));
        }

        problems
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
