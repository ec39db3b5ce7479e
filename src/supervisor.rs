use crate::child::{self, ChildError};
use crate::config::Config;
use crate::events::{self, Event, SignalError, SignalEvents};
use crate::exit_code;
use crate::signals;
use crate::timer::{Timer, TimerError};
use nix::errno::Errno;
use nix::libc;
use nix::unistd::Pid;
use std::fmt;
use tracing::{debug, warn};

/// The two timed stages of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the warn timer.
    Warning,
    /// Warning signal sent, waiting for the kill timer.
    Grace,
}

impl Phase {
    /// Name used when reporting a termination during this phase.
    pub fn period(&self) -> &'static str {
        match self {
            Phase::Warning => "run",
            Phase::Grace => "grace",
        }
    }
}

/// How a supervised run ended, from the supervisor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// The child exited on its own before any signal was sent.
    Exited,
    /// The child exited after the warning signal, before the kill timer.
    ExitedAfterWarning,
    /// The kill signal was sent.
    Killed,
}

/// Errors that abort supervision.
#[derive(Debug)]
pub enum SuperviseError {
    Signals(SignalError),
    Timer(TimerError),
    Child(ChildError),
    /// `kill(2)` against the child failed.
    Send { signal: i32, source: Errno },
    /// The supervisor received a terminating signal during `phase`.
    Terminated { signal: i32, phase: Phase },
}

impl SuperviseError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SuperviseError::Signals(e) => e.exit_code(),
            SuperviseError::Timer(e) => e.exit_code(),
            SuperviseError::Child(e) => e.exit_code(),
            SuperviseError::Send { .. } => exit_code::OSERR,
            SuperviseError::Terminated { .. } => exit_code::SOFTWARE,
        }
    }
}

impl fmt::Display for SuperviseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuperviseError::Signals(e) => write!(f, "{e}"),
            SuperviseError::Timer(e) => write!(f, "{e}"),
            SuperviseError::Child(e) => write!(f, "{e}"),
            SuperviseError::Send { signal, source } => write!(
                f,
                "could not send signal {signal} to the child: {source}"
            ),
            SuperviseError::Terminated { signal, phase } => write!(
                f,
                "terminated by signal {signal} during the {} period",
                phase.period()
            ),
        }
    }
}

impl std::error::Error for SuperviseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SuperviseError::Signals(e) => Some(e),
            SuperviseError::Timer(e) => Some(e),
            SuperviseError::Child(e) => Some(e),
            SuperviseError::Send { source, .. } => Some(source),
            SuperviseError::Terminated { .. } => None,
        }
    }
}

impl From<SignalError> for SuperviseError {
    fn from(e: SignalError) -> Self {
        SuperviseError::Signals(e)
    }
}

impl From<TimerError> for SuperviseError {
    fn from(e: TimerError) -> Self {
        SuperviseError::Timer(e)
    }
}

impl From<ChildError> for SuperviseError {
    fn from(e: ChildError) -> Self {
        SuperviseError::Child(e)
    }
}

/// State of the single run in progress.
///
/// Owns the event receiver for the run: dropping the session restores the
/// supervisor's signal mask.
pub struct Session<'a> {
    config: &'a Config,
    child: Pid,
    phase: Phase,
    events: SignalEvents,
    timer: Timer,
}

impl<'a> Session<'a> {
    /// Clear the event flags, install the handlers, start the child and arm
    /// the warn timer.
    pub fn start(config: &'a Config) -> Result<Self, SuperviseError> {
        let events = SignalEvents::install()?;
        let child = child::spawn(&config.command, events.original_mask())?;
        let session = Self {
            config,
            child,
            phase: Phase::Warning,
            events,
            timer: Timer::new(),
        };
        session.timer.arm("warning", config.warn_time)?;
        Ok(session)
    }

    pub fn child(&self) -> Pid {
        self.child
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive the state machine until the child is done or the kill signal is sent.
    pub fn run(&mut self) -> Result<Ending, SuperviseError> {
        loop {
            match self.events.wait()? {
                Event::ChildDone => {
                    self.timer.disarm()?;
                    debug!(phase = ?self.phase, "child finished before the timer");
                    return Ok(match self.phase {
                        Phase::Warning => Ending::Exited,
                        Phase::Grace => Ending::ExitedAfterWarning,
                    });
                }
                Event::Terminated(signal) => {
                    self.timer.disarm()?;
                    return Err(SuperviseError::Terminated {
                        signal,
                        phase: self.phase,
                    });
                }
                Event::TimerFired => match self.phase {
                    Phase::Warning => {
                        self.send("warning", self.config.warn_signal)?;
                        self.phase = Phase::Grace;
                        self.events.clear_timer();
                        self.timer.arm("kill", self.config.kill_time)?;
                    }
                    Phase::Grace => {
                        self.send("kill", self.config.kill_signal)?;
                        events::restore_default(libc::SIGCHLD)?;
                        return Ok(Ending::Killed);
                    }
                },
            }
        }
    }

    fn send(&self, what: &str, signal: i32) -> Result<(), SuperviseError> {
        if !self.config.quiet {
            warn!("sending {what} signal {signal}");
        }
        match signals::send(self.child, signal) {
            Ok(()) => Ok(()),
            // Already gone but not yet reported; the wait will pick it up.
            Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SuperviseError::Send { signal, source }),
        }
    }
}

/// Run one full supervision: start the child and escalate on timeouts.
///
/// Returns the child's pid for reaping. A terminating signal received by the
/// supervisor is returned as [`SuperviseError::Terminated`].
pub fn supervise(config: &Config) -> Result<Pid, SuperviseError> {
    let mut session = Session::start(config)?;
    let ending = session.run()?;
    debug!(
        pid = %session.child(),
        phase = ?session.phase(),
        ending = ?ending,
        "supervision finished"
    );
    Ok(session.child())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_period_names() {
        assert_eq!(Phase::Warning.period(), "run");
        assert_eq!(Phase::Grace.period(), "grace");
    }

    #[test]
    fn test_terminated_error_reports_signal_and_phase() {
        let err = SuperviseError::Terminated {
            signal: 15,
            phase: Phase::Warning,
        };
        assert_eq!(
            err.to_string(),
            "terminated by signal 15 during the run period"
        );
        assert_eq!(err.exit_code(), exit_code::SOFTWARE);

        let err = SuperviseError::Terminated {
            signal: 2,
            phase: Phase::Grace,
        };
        assert_eq!(
            err.to_string(),
            "terminated by signal 2 during the grace period"
        );
    }

    #[test]
    fn test_os_errors_map_to_oserr() {
        let err = SuperviseError::from(TimerError {
            name: "kill",
            source: Errno::EINVAL,
        });
        assert_eq!(err.exit_code(), exit_code::OSERR);

        let err = SuperviseError::from(ChildError::Spawn {
            source: Errno::EAGAIN,
        });
        assert_eq!(err.exit_code(), exit_code::OSERR);
        assert!(err.to_string().starts_with("fork"));

        let err = SuperviseError::Send {
            signal: libc::SIGTERM,
            source: Errno::EPERM,
        };
        assert_eq!(err.exit_code(), exit_code::OSERR);
        assert!(err.to_string().contains("signal 15"));
    }
}
