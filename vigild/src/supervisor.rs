//! Supervisory loop.
//!
//! One cycle: pet the hardware, run every probe in the fixed documented
//! order with a keep-alive bracketed around each, give fast test
//! binaries 50 ms to finish, then sleep out the remainder of the
//! interval in keep-alive slices. Any probe result the repair policy
//! cannot resolve ends the loop with the code the shutdown state
//! machine should act on.
//!
//! If the sum of probe durations exceeds the interval the next cycle
//! simply starts late; the per-probe sandbox timeouts and interleaved
//! keep-alives ensure the hardware timeout is never tripped meanwhile.

use std::thread;
use std::time::Duration;

use nix::unistd::sync;
use tracing::{debug, warn};

use vigil_common::config::Config;

use crate::clock;
use crate::device::WatchdogDevice;
use crate::heartbeat::Heartbeat;
use crate::probes::{ProbeRegistry, file, filetable, iface, memory, net, pidfile, temp};
use crate::repair;
use crate::signals;

/// Command-line switches that affect the loop.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub no_action: bool,
    pub sync_it: bool,
    pub force: bool,
    pub foreground: bool,
    pub verbose: u8,
    /// Exit after this many cycles (0 = run forever).
    pub loop_max: u64,
}

/// Pet the hardware and record the heartbeat stamp.
fn pet(device: &WatchdogDevice, heartbeat: &mut Heartbeat) -> i32 {
    let code = device.keep_alive();
    heartbeat.mark(clock::now());
    code
}

/// Sync twice if requested; the second pass picks up what the first
/// flush made dirty.
fn sync_system(sync_it: bool) -> i32 {
    if sync_it {
        sync();
        sync();
    }
    0
}

pub struct Supervisor {
    pub device: WatchdogDevice,
    pub config: Config,
    pub opts: Options,
    pub registry: ProbeRegistry,
    pub heartbeat: Heartbeat,
    count: u64,
    ticker: i32,
}

impl Supervisor {
    pub fn new(
        device: WatchdogDevice,
        config: Config,
        opts: Options,
        registry: ProbeRegistry,
        heartbeat: Heartbeat,
    ) -> Self {
        let ticker = config.logtick;
        Self {
            device,
            config,
            opts,
            registry,
            heartbeat,
            count: 0,
            ticker,
        }
    }

    /// Run until the stop flag is raised or a failure surfaces.
    ///
    /// Returns `Some(code)` when the shutdown state machine must take
    /// over, `None` on a cooperative stop.
    pub fn run(&mut self) -> Option<i32> {
        while signals::running() {
            if let Some(code) = self.cycle() {
                return Some(code);
            }

            self.count += 1;

            if self.opts.verbose > 0 && self.config.logtick > 0 {
                self.ticker -= 1;
                if self.ticker <= 0 {
                    self.ticker = self.config.logtick;
                    debug!("still alive after {} interval(s)", self.count);
                }
            }

            if self.opts.loop_max > 0 && self.count >= self.opts.loop_max {
                warn!("loop exit on interval counter reached");
                break;
            }
        }
        None
    }

    /// One full probe cycle. `Some(code)` means "shut down now".
    fn cycle(&mut self) -> Option<i32> {
        let Supervisor {
            device,
            config,
            opts,
            registry,
            heartbeat,
            ..
        } = self;
        let no_act = opts.no_action;

        // Every probe result is chased by a keep-alive whose own result
        // goes through the policy ungrouped.
        macro_rules! feed {
            ($desc:expr, $code:expr) => {
                if let Some(ec) = repair::handle(device, config, no_act, $desc, $code) {
                    return Some(ec);
                }
                let ka = pet(device, heartbeat);
                if let Some(ec) = repair::handle(device, config, no_act, None, ka) {
                    return Some(ec);
                }
            };
        }

        let ka = pet(device, heartbeat);
        if let Some(ec) = repair::handle(device, config, no_act, None, ka) {
            return Some(ec);
        }

        feed!(None, sync_system(opts.sync_it));

        feed!(None, filetable::check());

        let code = registry.load.check(config);
        feed!(Some(&mut registry.load_timer), code);

        let code = registry.memory.check_free(config);
        feed!(Some(&mut registry.mem_timer), code);

        let code = memory::check_allocatable(config);
        feed!(Some(&mut registry.mem_timer), code);

        for i in 0..registry.temps.len() {
            let code = temp::check(&mut registry.temps[i], config);
            feed!(Some(&mut registry.temps[i]), code);
        }

        for i in 0..registry.files.len() {
            let code = file::check_safe(device, &registry.files[i]);
            feed!(Some(&mut registry.files[i]), code);
        }

        for i in 0..registry.pidfiles.len() {
            let code = pidfile::check(&registry.pidfiles[i]);
            feed!(Some(&mut registry.pidfiles[i]), code);
        }

        for i in 0..registry.ifaces.len() {
            let code = iface::check(&mut registry.ifaces[i]);
            feed!(Some(&mut registry.ifaces[i]), code);
        }

        for i in 0..registry.pings.len() {
            let code = net::check(device, &mut registry.pings[i], config);
            feed!(Some(&mut registry.pings[i]), code);
        }

        for i in 0..registry.testbins.len() {
            registry.harness.schedule(i, &registry.testbins[i]);
        }
        for (i, code) in registry.harness.drain(config) {
            feed!(Some(&mut registry.testbins[i]), code);
        }

        // Give fast test binaries a moment, then drain once more.
        thread::sleep(Duration::from_millis(50));
        for (i, code) in registry.harness.drain(config) {
            feed!(Some(&mut registry.testbins[i]), code);
        }

        // Sleep out the rest of the interval; the device was petted by
        // the last check and keeps being petted through the sleep.
        let interval = Duration::from_secs(config.interval.max(1) as u64);
        clock::safe_sleep_duration(device, interval.saturating_sub(Duration::from_millis(50)));

        None
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
