use crate::child::ExitDisposition;
use crate::events;
use crate::exit_code;
use crate::signals;
use tracing::{debug, error};

/// What the supervisor does with the child's final disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Exit with this status.
    Code(u8),
    /// Re-raise this signal number against the supervisor.
    Raise(i32),
}

/// Translate the child's disposition into the supervisor's own exit.
///
/// A normal exit passes through unchanged. A signal `N` becomes exit status
/// `128 + N`, or is re-raised when `propagate` is set.
pub fn resolve(disposition: ExitDisposition, propagate: bool) -> Exit {
    match disposition {
        ExitDisposition::Exited(code) => Exit::Code(code),
        ExitDisposition::Signaled(sig) if propagate => Exit::Raise(sig),
        ExitDisposition::Signaled(sig) => Exit::Code(signal_status(sig)),
    }
}

/// `128 + N`, saturating for signal numbers that do not fit.
pub fn signal_status(sig: i32) -> u8 {
    u8::try_from(i32::from(exit_code::SIGNAL_BASE).saturating_add(sig)).unwrap_or(u8::MAX)
}

/// Terminate the supervisor with `sig`, the way the child was terminated.
///
/// Restores the default disposition, unblocks the signal and raises it. This
/// does not return. Signals whose default action does not terminate the
/// process (e.g. `CONT`, `WINCH`) fall back to exiting with `128 + N`.
pub fn raise_signal(sig: i32) -> ! {
    debug!(signal = sig, "re-raising the child's signal");

    if let Err(e) = events::restore_default(sig) {
        error!("{e}");
        std::process::exit(i32::from(exit_code::OSERR));
    }
    if let Err(e) = signals::unblock(sig) {
        debug!(error = %e, "could not unblock the signal");
    }
    if let Err(e) = signals::raise(sig) {
        debug!(error = %e, "raise failed");
    }

    std::process::exit(i32::from(signal_status(sig)))
}
