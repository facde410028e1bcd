//! Probe registry and dispatch.
//!
//! The registry owns the ordered descriptor lists built from the
//! configuration, plus the stateful checkers (held-open /proc handles
//! and the asynchronous test-binary harness). The supervisor iterates
//! the lists in the fixed documented order; each probe updates only its
//! own descriptor.

pub mod file;
pub mod filetable;
pub mod iface;
pub mod load;
pub mod memory;
pub mod net;
pub mod pidfile;
pub mod temp;
pub mod testbin;

use tracing::info;

use vigil_common::config::Config;
use vigil_common::descriptor::{Descriptor, Payload};

/// Startup failure while preparing a probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeSetupError {
    #[error("cannot resolve ping target {target}: {reason}")]
    Resolve { target: String, reason: String },
    #[error("cannot open ping socket for {target} ({source})")]
    Socket {
        target: String,
        source: std::io::Error,
    },
}

/// All per-probe state for the daemon's lifetime.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    pub files: Vec<Descriptor>,
    pub pidfiles: Vec<Descriptor>,
    pub ifaces: Vec<Descriptor>,
    pub pings: Vec<Descriptor>,
    pub temps: Vec<Descriptor>,
    pub testbins: Vec<Descriptor>,

    /// Pseudo-descriptor grouping the load-average checks, so their
    /// retry window is shared the way a real probe's would be.
    pub load_timer: Descriptor,
    /// Pseudo-descriptor grouping the two memory checks.
    pub mem_timer: Descriptor,

    pub load: load::LoadCheck,
    pub memory: memory::MemoryCheck,
    pub harness: testbin::TestBinHarness,
}

impl ProbeRegistry {
    /// Build every descriptor list and open the probe-side resources.
    pub fn open(cfg: &Config) -> Result<Self, ProbeSetupError> {
        let mut registry = Self {
            load_timer: Descriptor::new("<load-average>", 0, Payload::None),
            mem_timer: Descriptor::new("<free-memory>", 0, Payload::None),
            ..Self::default()
        };

        for f in &cfg.files {
            registry.files.push(Descriptor::new(
                f.path.clone(),
                0,
                Payload::File { mtime: f.mtime },
            ));
        }
        for p in &cfg.pidfiles {
            registry.pidfiles.push(Descriptor::new(p.clone(), 0, Payload::None));
        }
        for i in &cfg.interfaces {
            registry.ifaces.push(Descriptor::new(
                i.clone(),
                0,
                Payload::Interface { last_bytes: None },
            ));
        }
        for t in &cfg.test_binaries {
            registry
                .testbins
                .push(Descriptor::new(t.path.clone(), t.version, Payload::None));
        }

        for target in &cfg.ping_targets {
            let mut d = Descriptor::new(target.clone(), 0, Payload::None);
            net::open(&mut d)?;
            registry.pings.push(d);
        }

        for sensor in &cfg.temp_sensors {
            let mut d = Descriptor::new(
                sensor.clone(),
                0,
                Payload::Temperature {
                    in_use: true,
                    recent: [0; 3],
                    have: 0,
                    warned: 0,
                },
            );
            temp::open(&mut d);
            registry.temps.push(d);
        }

        registry.load.open(cfg);
        registry.memory.open(cfg);

        Ok(registry)
    }

    /// Release every probe-side resource.
    ///
    /// Called on orderly exit and at the start of a shutdown; the
    /// watchdog handle is deliberately not ours to touch.
    pub fn close_all(&mut self) {
        self.harness.close();
        self.load.close();
        self.memory.close();
        for d in &mut self.pings {
            net::close(d);
        }
        info!("probe resources closed");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
