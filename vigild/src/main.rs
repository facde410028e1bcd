//! # vigild
//!
//! Supervisory hardware-watchdog daemon. Startup mirrors the layering
//! of the crate: parse the command line, load and sanity-check the
//! configuration, claim the log directory and PID file, open the
//! watchdog device and the probe registry, then hand control to the
//! supervisory loop. The loop only ever comes back with either a
//! cooperative stop (clean exit) or an unresolved error code (system
//! shutdown).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use clap::Parser;
use tracing::{error, info, warn};

use vigil_common::config::Config;

use vigild::config::{self, CONFIG_FILENAME};
use vigild::device::WatchdogDevice;
use vigild::heartbeat::Heartbeat;
use vigild::probes::ProbeRegistry;
use vigild::supervisor::{Options, Supervisor};
use vigild::{EX_SYSERR, EX_USAGE, logging, memlock, pidlock, reopen, shutdown, signals};

/// Supervisory watchdog daemon
#[derive(Parser, Debug)]
#[command(name = "vigild")]
#[command(version)]
#[command(about = "Keeps the system healthy with periodic checks and a hardware watchdog")]
struct Args {
    /// Specify the location of the config file
    #[arg(short = 'c', long = "config-file", default_value = CONFIG_FILENAME)]
    config_file: PathBuf,

    /// Run in foreground
    #[arg(short = 'F', long)]
    foreground: bool,

    /// Don't sanity-check the config or use the PID file
    #[arg(short = 'f', long)]
    force: bool,

    /// Sync the filesystem each cycle
    #[arg(short = 's', long)]
    sync: bool,

    /// Do not reboot or halt
    #[arg(short = 'q', long = "no-action")]
    no_action: bool,

    /// Soft-boot on error (disables the retry window)
    #[arg(short = 'b', long)]
    softboot: bool,

    /// Verbose messages (repeat for more)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run a fixed number of loops then exit
    #[arg(short = 'X', long = "loop-exit", value_name = "N")]
    loop_exit: Option<u64>,

    // Old single-letter options that used to carry values. They only
    // print a pointer at the config file and exit.
    #[arg(short = 'd', hide = true)]
    legacy_d: Option<String>,
    #[arg(short = 'i', hide = true)]
    legacy_i: Option<String>,
    #[arg(short = 'n', hide = true)]
    legacy_n: Option<String>,
    #[arg(short = 'p', hide = true)]
    legacy_p: Option<String>,
    #[arg(short = 'a', hide = true)]
    legacy_a: Option<String>,
    #[arg(short = 'r', hide = true)]
    legacy_r: Option<String>,
    #[arg(short = 't', hide = true)]
    legacy_t: Option<String>,
    #[arg(short = 'l', hide = true)]
    legacy_l: Option<String>,
    #[arg(short = 'm', hide = true)]
    legacy_m: Option<String>,
}

impl Args {
    /// First legacy value-option present on the command line, if any.
    fn legacy_option_used(&self) -> Option<char> {
        [
            ('d', &self.legacy_d),
            ('i', &self.legacy_i),
            ('n', &self.legacy_n),
            ('p', &self.legacy_p),
            ('a', &self.legacy_a),
            ('r', &self.legacy_r),
            ('t', &self.legacy_t),
            ('l', &self.legacy_l),
            ('m', &self.legacy_m),
        ]
        .into_iter()
        .find_map(|(c, value)| value.as_ref().map(|_| c))
    }
}

/// Log the effective configuration the way an operator will want to
/// read it back from the journal.
fn print_info(cfg: &Config, opts: &Options, force: bool) {
    info!(
        "int={}s realtime={} sync={} load={},{},{}",
        cfg.interval,
        if cfg.realtime { "yes" } else { "no" },
        if opts.sync_it { "yes" } else { "no" },
        cfg.max_load1,
        cfg.max_load5,
        cfg.max_load15
    );

    if cfg.min_memory == 0 && cfg.alloc_memory == 0 {
        info!("memory not checked");
    } else {
        info!(
            "memory: minimum pages = {} free, {} allocatable",
            cfg.min_memory, cfg.alloc_memory
        );
    }

    if cfg.ping_targets.is_empty() {
        info!("ping: no machine to check");
    } else {
        for target in &cfg.ping_targets {
            info!("ping: {target}");
        }
    }

    if cfg.files.is_empty() {
        info!("file: no file to check");
    } else {
        for file in &cfg.files {
            info!("file: {}:{}", file.path, file.mtime);
        }
    }

    if cfg.pidfiles.is_empty() {
        info!("pidfile: no server process to check");
    } else {
        for pidfile in &cfg.pidfiles {
            info!("pidfile: {pidfile}");
        }
    }

    if cfg.interfaces.is_empty() {
        info!("interface: no interface to check");
    } else {
        for iface in &cfg.interfaces {
            info!("interface: {iface}");
        }
    }

    if cfg.temp_sensors.is_empty() {
        info!("temperature: no sensors to check");
    } else {
        info!("temperature: maximum = {}", cfg.max_temperature);
        for sensor in &cfg.temp_sensors {
            info!("temperature: {sensor}");
        }
    }

    if cfg.test_binaries.is_empty() {
        info!("no test binary files");
    } else {
        info!("test binary time-out = {}", cfg.test_timeout);
        for bin in &cfg.test_binaries {
            info!(
                "{}: {}",
                if bin.version == 0 { "test binary V0" } else { "test/repair V1" },
                bin.path
            );
        }
    }

    match &cfg.repair_binary {
        None => info!("no repair binary files"),
        Some(bin) => {
            info!("repair binary: time-out = {}", cfg.repair_timeout);
            info!("repair binary: program = {bin}");
        }
    }

    info!("error retry time-out = {} seconds", cfg.retry_timeout);
    if cfg.repair_max > 0 {
        info!("repair attempts = {}", cfg.repair_max);
    } else {
        info!("repair attempts = unlimited");
    }

    info!(
        "alive={} heartbeat={} to={} no_act={} force={}",
        cfg.device
            .as_deref()
            .map_or("[none]".to_string(), |p| p.display().to_string()),
        cfg.heartbeat_file
            .as_deref()
            .map_or("[none]".to_string(), |p| p.display().to_string()),
        cfg.admin.as_deref().unwrap_or("[none]"),
        if opts.no_action { "yes" } else { "no" },
        if force { "yes" } else { "no" }
    );
}

fn main() {
    let args = Args::parse();

    if let Some(opt) = args.legacy_option_used() {
        eprintln!("Option -{opt} is no longer valid, please specify it in the config file.");
        exit(EX_USAGE);
    }

    let loaded = match config::read_config(&args.config_file) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("vigild: {e}");
            exit(EX_SYSERR);
        }
    };
    let mut cfg = loaded.config;

    let verbose = args.verbose.max(u8::from(cfg.verbose));
    logging::init(verbose);
    for warning in &loaded.warnings {
        warn!("{warning}");
    }

    if args.softboot {
        // Zeroing the retry window means immediate action on errors.
        cfg.retry_timeout = 0;
    }

    if let Some(count) = args.loop_exit {
        warn!("using --loop-exit so daemon will exit after {count} time intervals");
    }

    if !args.force {
        let problems = cfg.validate();
        if !problems.is_empty() {
            for problem in &problems {
                error!("{problem}");
            }
            error!("to force parameter(s) use the --force command line option");
            exit(EX_USAGE);
        }
    }

    // Make sure we get our own log directory.
    if let Err(e) = fs::create_dir_all(&cfg.log_dir) {
        error!("cannot create directory {} ({e})", cfg.log_dir.display());
        exit(EX_SYSERR);
    }

    if !args.foreground {
        // Register the redirect directory now: this must still work
        // later even if the system runs out of memory.
        reopen::set_reopen_dir(&cfg.log_dir);
        if let Err(e) = pidlock::daemonize(&cfg.log_dir) {
            error!("failed to daemonize ({e})");
            exit(EX_SYSERR);
        }
    }

    // Tuck the process id away.
    if !args.force {
        if let Err(e) = pidlock::write_pid_file(Path::new(pidlock::PIDFILE)) {
            error!("unable to gain lock via PID file {} ({e})", pidlock::PIDFILE);
            exit(EX_USAGE);
        }
    }

    let opts = Options {
        no_action: args.no_action,
        sync_it: args.sync,
        force: args.force,
        foreground: args.foreground,
        verbose,
        loop_max: args.loop_exit.unwrap_or(0),
    };

    info!("starting daemon ({})", env!("CARGO_PKG_VERSION"));
    print_info(&cfg, &opts, args.force);

    let mut device = WatchdogDevice::closed();
    if !opts.no_action {
        if let Some(path) = cfg.device.clone() {
            device.open(&path, cfg.dev_timeout);
        }
    }

    let registry = match ProbeRegistry::open(&cfg) {
        Ok(registry) => registry,
        Err(e) => {
            error!("{e}");
            exit(EX_USAGE);
        }
    };
    let heartbeat = Heartbeat::open(&cfg);

    // SIGTERM must close the watchdog device cleanly, not abandon it.
    if let Err(e) = signals::install_sigterm_handler() {
        error!("cannot install SIGTERM handler ({e})");
        exit(EX_SYSERR);
    }

    memlock::lock_our_memory(cfg.realtime, cfg.priority);

    let mut sup = Supervisor::new(device, cfg, opts, registry, heartbeat);
    match sup.run() {
        Some(code) => {
            shutdown::do_shutdown(&mut sup.device, &sup.config, &mut sup.registry, code)
        }
        None => shutdown::terminate(&mut sup.device, &mut sup.registry, 0),
    }
}
