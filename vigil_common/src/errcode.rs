//! Extended error-code space for probe and repair results.
//!
//! Every probe, repair invocation and keep-alive returns a plain `i32`
//! drawn from the OS errno space plus a reserved extension range at the
//! top of the unsigned-8-bit window (245..=255). Codes cross process
//! boundaries as child exit statuses, which is why they stay integers
//! rather than an enum.

use std::borrow::Cow;

use nix::errno::Errno;

/// No error.
pub const ENOERR: i32 = 0;
/// Unconditional reboot requested (255 = -1 as unsigned 8-bit).
pub const EREBOOT: i32 = 255;
/// Unconditional hard reset requested.
pub const ERESET: i32 = 254;
/// Load average too high.
pub const EMAXLOAD: i32 = 253;
/// Too hot inside.
pub const ETOOHOT: i32 = 252;
/// /proc/loadavg contains no data.
pub const ENOLOAD: i32 = 251;
/// File or counter was not changed in the given interval.
pub const ENOCHANGE: i32 = 250;
/// /proc/meminfo contains invalid data.
pub const EINVMEM: i32 = 249;
/// Child was killed by a signal.
pub const ECHKILL: i32 = 248;
/// Child did not return in time.
pub const ETOOLONG: i32 = 247;
/// Reserved for user error codes.
pub const EUSERVALUE: i32 = 246;
/// Unknown: not success, but implies the test is still inconclusive.
pub const EDONTKNOW: i32 = 245;

/// How the repair policy should treat a result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Success; clears any per-probe failure state.
    Ok,
    /// Inconclusive; neither failure nor success.
    DontKnow,
    /// Fatal; bypasses repair entirely and goes to shutdown.
    Fatal,
    /// Any other non-zero code; eligible for retry and repair.
    Repairable,
}

/// Classify a result code for the repair policy.
pub fn classify(code: i32) -> Class {
    match code {
        ENOERR => Class::Ok,
        EDONTKNOW => Class::DontKnow,
        EREBOOT | ERESET | ETOOHOT | EMAXLOAD => Class::Fatal,
        c if c == libc::EMFILE || c == libc::ENFILE || c == libc::ENOMEM => Class::Fatal,
        _ => Class::Repairable,
    }
}

/// Whether post-failure cleanup is unreliable for this code.
///
/// For these conditions the system is so starved that running `sendmail`
/// or other helpers is likely to fail, so the shutdown sequencing sheds
/// user processes before notifying the administrator.
pub fn is_doomed(code: i32) -> bool {
    match code {
        EREBOOT | ERESET | EMAXLOAD | ETOOHOT => true,
        c => c == libc::EMFILE || c == libc::ENFILE || c == libc::ENOMEM,
    }
}

/// Extend the system strerror mapping with the watchdog-specific codes.
pub fn describe(code: i32) -> Cow<'static, str> {
    match code {
        ENOERR => Cow::Borrowed("no error"),
        EREBOOT => Cow::Borrowed("unconditional reboot requested"),
        ERESET => Cow::Borrowed("unconditional hard reset requested"),
        EMAXLOAD => Cow::Borrowed("load average too high"),
        ETOOHOT => Cow::Borrowed("too hot"),
        ENOLOAD => Cow::Borrowed("loadavg contains no data"),
        ENOCHANGE => Cow::Borrowed("file was not changed in the given interval"),
        EINVMEM => Cow::Borrowed("meminfo contains invalid data"),
        ECHKILL => Cow::Borrowed("child process was killed by signal"),
        ETOOLONG => Cow::Borrowed("child process did not return in time"),
        EUSERVALUE => Cow::Borrowed("user-reserved code"),
        EDONTKNOW => Cow::Borrowed("unknown (neither good nor bad)"),
        c => Cow::Borrowed(Errno::from_raw(c).desc()),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_table() {
        assert_eq!(classify(ENOERR), Class::Ok);
        assert_eq!(classify(EDONTKNOW), Class::DontKnow);
        for fatal in [EREBOOT, ERESET, ETOOHOT, EMAXLOAD, libc::EMFILE, libc::ENFILE, libc::ENOMEM]
        {
            assert_eq!(classify(fatal), Class::Fatal, "{fatal} should be fatal");
        }
        for repairable in [ENOCHANGE, ENOLOAD, EINVMEM, ECHKILL, ETOOLONG, libc::ENOENT, 1] {
            assert_eq!(
                classify(repairable),
                Class::Repairable,
                "{repairable} should be repairable"
            );
        }
    }

    #[test]
    fn doomed_is_the_starvation_family() {
        for doomed in [EREBOOT, ERESET, EMAXLOAD, ETOOHOT, libc::EMFILE, libc::ENFILE, libc::ENOMEM]
        {
            assert!(is_doomed(doomed), "{doomed} should be doomed");
        }
        for not_doomed in [ENOERR, ENOCHANGE, ECHKILL, ETOOLONG, libc::ENOENT] {
            assert!(!is_doomed(not_doomed), "{not_doomed} should not be doomed");
        }
    }

    #[test]
    fn describe_extended_codes() {
        assert_eq!(describe(ENOERR), "no error");
        assert_eq!(describe(ETOOHOT), "too hot");
        assert_eq!(describe(ETOOLONG), "child process did not return in time");
        // OS codes fall through to strerror.
        assert!(!describe(libc::ENOENT).is_empty());
    }
}
