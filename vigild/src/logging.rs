//! Tracing setup and the suspend/resume gate.
//!
//! Logging is a process-wide resource. During mass-kill windows the
//! logger process (if any) is stopped along with everything else, so the
//! killers bracket their work with [`suspend`]/[`resume`]; while
//! suspended, log lines are dropped instead of risking a blocking write.
//!
//! The transport is stderr (redirected into `<log-dir>/daemon.log` when
//! daemonized). Remote log transports are external collaborators; the
//! shutdown sequence's transport close/reopen steps reduce to
//! [`flush`]/[`resume`] here.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

static SUSPENDED: AtomicBool = AtomicBool::new(false);

/// Drop log output until [`resume`] is called.
pub fn suspend() {
    SUSPENDED.store(true, Ordering::SeqCst);
}

/// Re-enable log output.
pub fn resume() {
    SUSPENDED.store(false, Ordering::SeqCst);
}

/// Best-effort flush of the transport before the world changes under it.
pub fn flush() {
    let _ = io::stderr().flush();
}

struct GatedStderr;

struct GatedWriter(Option<io::Stderr>);

impl Write for GatedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(err) => err.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0 {
            Some(err) => err.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for GatedStderr {
    type Writer = GatedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        if SUSPENDED.load(Ordering::SeqCst) {
            GatedWriter(None)
        } else {
            GatedWriter(Some(io::stderr()))
        }
    }
}

/// Install the global subscriber. Call exactly once, early in main.
pub fn init(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(GatedStderr)
        .init();
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_writer_swallows_output() {
        suspend();
        let mut w = GatedStderr.make_writer();
        assert_eq!(w.write(b"dropped").unwrap(), 7);
        resume();
        let w = GatedStderr.make_writer();
        assert!(w.0.is_some());
    }
}
