use crate::config::TimeSpec;
use crate::exit_code;
use nix::errno::Errno;
use std::fmt;

/// Failure to arm or disarm the interval timer.
#[derive(Debug)]
pub struct TimerError {
    pub name: &'static str,
    pub source: Errno,
}

impl TimerError {
    pub fn exit_code(&self) -> u8 {
        exit_code::OSERR
    }
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not set the {} timer: {}", self.name, self.source)
    }
}

impl std::error::Error for TimerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Single-shot real-time countdown that delivers `SIGALRM` on expiry.
///
/// Arming replaces any expiry still pending. With the `subsecond` feature the
/// countdown has microsecond resolution; otherwise the fraction is dropped.
#[derive(Debug, Default)]
pub struct Timer;

impl Timer {
    pub fn new() -> Self {
        Timer
    }

    /// Schedule one expiry `after` from now. `name` identifies the stage in errors.
    pub fn arm(&self, name: &'static str, after: TimeSpec) -> Result<(), TimerError> {
        tracing::debug!(timer = name, after = %after, "arming timer");
        backend::set(after).map_err(|source| TimerError { name, source })
    }

    /// Cancel a pending expiry, if any.
    pub fn disarm(&self) -> Result<(), TimerError> {
        backend::set(TimeSpec::from_secs(0)).map_err(|source| TimerError {
            name: "pending",
            source,
        })
    }
}

#[cfg(feature = "subsecond")]
mod backend {
    use crate::config::TimeSpec;
    use nix::errno::Errno;
    use nix::libc;

    /// Build a one-shot `itimerval`; a zero value disarms.
    pub(super) fn itimerval(after: TimeSpec) -> libc::itimerval {
        libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: after.seconds.min(libc::time_t::MAX as u64) as libc::time_t,
                tv_usec: after.micros as libc::suseconds_t,
            },
        }
    }

    pub(super) fn set(after: TimeSpec) -> Result<(), Errno> {
        let value = itimerval(after);
        // SAFETY: value is a valid itimerval and the old value is not requested.
        let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &value, std::ptr::null_mut()) };
        Errno::result(rc).map(drop)
    }
}

#[cfg(not(feature = "subsecond"))]
mod backend {
    use crate::config::TimeSpec;
    use nix::errno::Errno;
    use nix::unistd::alarm;

    /// Whole seconds for `alarm(2)`; the fraction is rounded down.
    pub(super) fn alarm_secs(after: TimeSpec) -> u32 {
        after.seconds.min(u64::from(u32::MAX)) as u32
    }

    pub(super) fn set(after: TimeSpec) -> Result<(), Errno> {
        match alarm_secs(after) {
            0 => {
                alarm::cancel();
            }
            secs => {
                alarm::set(secs);
            }
        }
        Ok(())
    }
}
