//! Exit statuses from `<sysexits.h>` used by the supervisor.

/// Success.
pub const OK: u8 = 0;

/// Bad option value or missing command.
pub const USAGE: u8 = 64;

/// The supervisor itself was asked to terminate while supervising.
pub const SOFTWARE: u8 = 70;

/// A system call failed: fork, exec, wait, sigaction, setitimer.
pub const OSERR: u8 = 71;

/// Offset added to a signal number when a signaled child is reported as an exit code.
pub const SIGNAL_BASE: u8 = 128;
