//! Configuration file reader.
//!
//! Line-oriented `key = value` grammar: blank lines and `#` comments are
//! ignored, whitespace is trimmed on both sides of the `=`, list-valued
//! options append in file order, and unknown options are skipped with a
//! warning. Out-of-range values are likewise warned about and ignored
//! rather than aborting the daemon — a watchdog that refuses to start
//! over a typo protects nothing.
//!
//! Parsing happens before the logging transport is up, so warnings are
//! collected and returned for the caller to emit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use vigil_common::config::{
    Config, FileProbe, MAX_LOAD, MAX_TIME, MAX_WD_TIMEOUT, MIN_WD_TIMEOUT, TestBinary,
};

/// Default configuration file location.
pub const CONFIG_FILENAME: &str = "/etc/vigild.conf";

/// Auxiliary file consulted for the real-time-clock timezone.
const RCS_FILENAME: &str = "/etc/default/rcS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't open config file \"{path}\" ({source})")]
    Open { path: PathBuf, source: io::Error },
}

/// A parsed configuration plus the warnings produced along the way.
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    pub warnings: Vec<String>,
}

/// Split one `key = value` line; comments and blanks yield `None`.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

fn parse_int(
    key: &str,
    value: &str,
    line: usize,
    min: i32,
    max: i32,
    warnings: &mut Vec<String>,
) -> Option<i32> {
    match value.parse::<i32>() {
        Ok(v) if (min..=max).contains(&v) => Some(v),
        Ok(v) => {
            warnings.push(format!(
                "value {v} for '{key}' at line {line} is outside {min}..{max}, ignoring it"
            ));
            None
        }
        Err(_) => {
            warnings.push(format!(
                "value '{value}' for '{key}' at line {line} is not a number, ignoring it"
            ));
            None
        }
    }
}

fn parse_yes_no(key: &str, value: &str, line: usize, warnings: &mut Vec<String>) -> Option<bool> {
    match value {
        "yes" => Some(true),
        "no" => Some(false),
        _ => {
            warnings.push(format!(
                "value '{value}' for '{key}' at line {line} is not yes/no, ignoring it"
            ));
            None
        }
    }
}

/// Blank string values mean "not configured".
fn optional_string(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_line(key: &str, value: &str, line: usize, cfg: &mut Config, warnings: &mut Vec<String>) {
    macro_rules! int_opt {
        ($field:ident, $min:expr, $max:expr) => {
            if let Some(v) = parse_int(key, value, line, $min, $max, warnings) {
                cfg.$field = v;
            }
        };
    }

    match key {
        "file" => cfg.files.push(FileProbe {
            path: value.to_string(),
            mtime: 0,
        }),
        "change" => {
            let Some(v) = parse_int(key, value, line, 2, MAX_TIME, warnings) else {
                return;
            };
            match cfg.files.last_mut() {
                None => warnings.push(format!(
                    "file change interval, but no file (yet) at line {line} of config file"
                )),
                Some(file) => {
                    if file.mtime != 0 {
                        warnings.push(format!(
                            "duplicate change interval at line {line} of config file \
                             (ignoring previous)"
                        ));
                    }
                    file.mtime = v;
                }
            }
        }
        "ping" => cfg.ping_targets.push(value.to_string()),
        "ping-count" => int_opt!(ping_count, 1, 100),
        "pidfile" => cfg.pidfiles.push(value.to_string()),
        "interface" => cfg.interfaces.push(value.to_string()),
        "temperature-sensor" => cfg.temp_sensors.push(value.to_string()),
        "test-binary" => cfg.test_binaries.push(TestBinary {
            path: value.to_string(),
            version: 0,
        }),
        "realtime" => {
            if let Some(v) = parse_yes_no(key, value, line, warnings) {
                cfg.realtime = v;
            }
        }
        "priority" => int_opt!(priority, 0, 100),
        "repair-binary" => cfg.repair_binary = optional_string(value),
        "repair-timeout" => int_opt!(repair_timeout, 0, MAX_TIME),
        "test-timeout" => int_opt!(test_timeout, 0, MAX_TIME),
        "heartbeat-file" => cfg.heartbeat_file = optional_string(value).map(PathBuf::from),
        "heartbeat-stamps" => int_opt!(heartbeat_stamps, 10, 500),
        "admin" => cfg.admin = optional_string(value),
        "interval" => int_opt!(interval, 1, MAX_WD_TIMEOUT),
        "logtick" => int_opt!(logtick, 1, MAX_TIME),
        "watchdog-device" => cfg.device = optional_string(value).map(PathBuf::from),
        "watchdog-timeout" => int_opt!(dev_timeout, MIN_WD_TIMEOUT, MAX_WD_TIMEOUT),
        "temperature-device" => warnings.push(format!(
            "use of 'temperature-device' at line {line} of config file is deprecated"
        )),
        "max-temperature" => int_opt!(max_temperature, 30, 150),
        "max-load-1" => int_opt!(max_load1, 0, MAX_LOAD),
        "max-load-5" => int_opt!(max_load5, 0, MAX_LOAD),
        "max-load-15" => int_opt!(max_load15, 0, MAX_LOAD),
        "min-memory" => {
            if let Some(v) = parse_int(key, value, line, 0, i32::MAX, warnings) {
                cfg.min_memory = v as i64;
            }
        }
        "allocatable-memory" => {
            if let Some(v) = parse_int(key, value, line, 0, i32::MAX, warnings) {
                cfg.alloc_memory = v as i64;
            }
        }
        "log-dir" => {
            if value.is_empty() {
                warnings.push(format!("blank 'log-dir' at line {line}, keeping the default"));
            } else {
                cfg.log_dir = PathBuf::from(value);
            }
        }
        "test-directory" => cfg.test_directory = optional_string(value).map(PathBuf::from),
        "temperature-poweroff" => {
            if let Some(v) = parse_yes_no(key, value, line, warnings) {
                cfg.temp_poweroff = v;
            }
        }
        "sigterm-delay" => int_opt!(sigterm_delay, 2, 300),
        "retry-timeout" => int_opt!(retry_timeout, 0, MAX_TIME),
        "repair-maximum" => int_opt!(repair_max, 0, 100),
        "verbose" => {
            if let Some(v) = parse_yes_no(key, value, line, warnings) {
                cfg.verbose = v;
            }
        }
        _ => warnings.push(format!(
            "ignoring invalid option at line {line} of config file: {key}={value}"
        )),
    }
}

fn parse_into(content: &str, cfg: &mut Config, warnings: &mut Vec<String>) {
    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match split_assignment(raw) {
            Some((key, value)) => parse_line(key, value, line, cfg, warnings),
            None => warnings.push(format!(
                "no '=' assignment at line {line} of config file"
            )),
        }
    }
}

/// Register every usable file directly under the test directory as a
/// version-1 (self-repairing) test binary.
fn add_test_binaries(dir: &Path, cfg: &mut Config, warnings: &mut Vec<String>) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut found: Vec<TestBinary> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // A hidden file in the test directory is a bit suspicious.
        if name.starts_with('.') {
            warnings.push(format!("skipping hidden file {}", path.display()));
            continue;
        }
        let mode = meta.permissions().mode();
        if mode & 0o100 == 0 || mode & 0o400 == 0 {
            continue;
        }
        found.push(TestBinary {
            path: path.to_string_lossy().into_owned(),
            version: 1,
        });
    }
    // Directory iteration order is arbitrary; keep the registered order
    // stable across restarts.
    found.sort_by(|a, b| a.path.cmp(&b.path));
    cfg.test_binaries.extend(found);
}

/// Recover `UTC=yes|no` from an rcS-style file with the same grammar.
fn read_rtc_utc(path: &Path, warnings: &mut Vec<String>) -> Option<bool> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warnings.push(format!("failed to open {} ({e})", path.display()));
            return None;
        }
    };
    let mut found = None;
    for raw in content.lines() {
        if let Some(("UTC", value)) = split_assignment(raw) {
            match value {
                "yes" => found = Some(true),
                "no" => found = Some(false),
                _ => {}
            }
        }
    }
    if found.is_none() {
        warnings.push(format!(
            "unable to determine UTC status from {}",
            path.display()
        ));
    }
    found
}

/// Read and parse the configuration file.
pub fn read_config(path: &Path) -> Result<Loaded, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config = Config::default();
    let mut warnings = Vec::new();
    parse_into(&content, &mut config, &mut warnings);

    if let Some(dir) = config.test_directory.clone() {
        add_test_binaries(&dir, &mut config, &mut warnings);
    }
    if let Some(utc) = read_rtc_utc(Path::new(RCS_FILENAME), &mut warnings) {
        config.rtc_utc = utc;
    }

    Ok(Loaded { config, warnings })
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn parse(content: &str) -> (Config, Vec<String>) {
        let mut cfg = Config::default();
        let mut warnings = Vec::new();
        parse_into(content, &mut cfg, &mut warnings);
        (cfg, warnings)
    }

    #[test]
    fn parses_scalars_and_trims_whitespace() {
        let (cfg, warnings) = parse(
            "interval = 10\n\
             \twatchdog-timeout=60   \n\
             watchdog-device = /dev/watchdog\n\
             realtime = yes\n\
             priority = 2\n\
             admin =\n",
        );
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(cfg.interval, 10);
        assert_eq!(cfg.dev_timeout, 60);
        assert_eq!(cfg.device.as_deref(), Some(Path::new("/dev/watchdog")));
        assert!(cfg.realtime);
        assert_eq!(cfg.priority, 2);
        assert_eq!(cfg.admin, None, "blank admin disables mail");
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let (cfg, warnings) = parse("# a comment\n\n   \n  # indented comment\ninterval = 5\n");
        assert!(warnings.is_empty());
        assert_eq!(cfg.interval, 5);
    }

    #[test]
    fn lists_preserve_order() {
        let (cfg, _) = parse(
            "ping = 192.168.1.1\n\
             ping = 10.0.0.1\n\
             interface = eth1\n\
             interface = eth0\n\
             pidfile = /run/sshd.pid\n\
             test-binary = /opt/check-db\n",
        );
        assert_eq!(cfg.ping_targets, ["192.168.1.1", "10.0.0.1"]);
        assert_eq!(cfg.interfaces, ["eth1", "eth0"]);
        assert_eq!(cfg.pidfiles, ["/run/sshd.pid"]);
        assert_eq!(cfg.test_binaries[0].path, "/opt/check-db");
        assert_eq!(cfg.test_binaries[0].version, 0);
    }

    #[test]
    fn change_attaches_to_the_preceding_file() {
        let (cfg, warnings) = parse(
            "file = /var/log/syslog\n\
             change = 300\n\
             file = /var/run/heartbeat\n\
             change = 60\n",
        );
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(cfg.files.len(), 2);
        assert_eq!(cfg.files[0].mtime, 300);
        assert_eq!(cfg.files[1].mtime, 60);
    }

    #[test]
    fn change_without_a_file_warns() {
        let (cfg, warnings) = parse("change = 300\n");
        assert!(cfg.files.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no file"), "got: {}", warnings[0]);
    }

    #[test]
    fn duplicate_change_warns_and_takes_the_last() {
        let (cfg, warnings) = parse("file = /a\nchange = 300\nchange = 120\n");
        assert_eq!(cfg.files[0].mtime, 120);
        assert!(warnings[0].contains("duplicate"), "got: {}", warnings[0]);
    }

    #[test]
    fn unknown_options_warn_and_are_skipped() {
        let (cfg, warnings) = parse("no-such-option = 17\n");
        assert_eq!(cfg.interval, Config::default().interval);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no-such-option"));
    }

    #[test]
    fn missing_assignment_warns() {
        let (_, warnings) = parse("interval 10\n");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no '='"));
    }

    #[test]
    fn out_of_range_values_warn_and_keep_the_default() {
        let (cfg, warnings) = parse("watchdog-timeout = 1\nping-count = 5000\n");
        assert_eq!(cfg.dev_timeout, Config::default().dev_timeout);
        assert_eq!(cfg.ping_count, Config::default().ping_count);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn deprecated_temperature_device_warns() {
        let (_, warnings) = parse("temperature-device = /dev/temperature\n");
        assert!(warnings[0].contains("deprecated"));
    }

    #[test]
    fn test_directory_scan_filters_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let mk = |name: &str, mode: u32| {
            let path = dir.path().join(name);
            let mut f = fs::File::create(&path).unwrap();
            writeln!(f, "#!/bin/sh\nexit 0").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        };
        mk("usable", 0o755);
        mk("second", 0o700);
        mk(".hidden", 0o755);
        mk("not-executable", 0o644);
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let mut cfg = Config::default();
        let mut warnings = Vec::new();
        add_test_binaries(dir.path(), &mut cfg, &mut warnings);

        let names: Vec<String> = cfg
            .test_binaries
            .iter()
            .map(|t| {
                Path::new(&t.path)
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, ["second", "usable"]);
        assert!(cfg.test_binaries.iter().all(|t| t.version == 1));
        assert!(warnings.iter().any(|w| w.contains(".hidden")));
    }

    #[test]
    fn rtc_utc_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rcS");

        fs::write(&path, "# settings\nUTC=no\n").unwrap();
        let mut warnings = Vec::new();
        assert_eq!(read_rtc_utc(&path, &mut warnings), Some(false));
        assert!(warnings.is_empty());

        fs::write(&path, "TZ=UTC\n").unwrap();
        let mut warnings = Vec::new();
        assert_eq!(read_rtc_utc(&path, &mut warnings), None);
        assert_eq!(warnings.len(), 1);

        let mut warnings = Vec::new();
        assert_eq!(read_rtc_utc(&dir.path().join("absent"), &mut warnings), None);
        assert!(warnings[0].contains("failed to open"));
    }

    #[test]
    fn read_config_reports_a_missing_file() {
        assert!(read_config(Path::new("/nonexistent/vigild.conf")).is_err());
    }
}
