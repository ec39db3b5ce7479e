use crate::exit_code;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Signals that ask the supervisor itself to stop.
pub const TERMINATING: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
];

/// Every signal the event source intercepts.
const WATCHED: [Signal; 6] = [
    Signal::SIGCHLD,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
];

/// Flags shared between the signal handlers and the control loop.
///
/// Handlers only ever store into these; the control loop only loads and
/// clears them, and only while the watched signals are blocked.
struct SessionEvents {
    child_done: AtomicBool,
    timer_fired: AtomicBool,
    terminated: AtomicBool,
    caught: AtomicI32,
}

impl SessionEvents {
    const fn new() -> Self {
        Self {
            child_done: AtomicBool::new(false),
            timer_fired: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            caught: AtomicI32::new(0),
        }
    }

    fn clear_timer(&self) {
        self.timer_fired.store(false, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.child_done.store(false, Ordering::SeqCst);
        self.timer_fired.store(false, Ordering::SeqCst);
        self.terminated.store(false, Ordering::SeqCst);
        self.caught.store(0, Ordering::SeqCst);
    }

    /// Read and clear the highest-priority pending event.
    ///
    /// Child exit wins over a termination request, which wins over a timer
    /// expiry. `child_done` stays set once observed.
    fn take(&self) -> Option<Event> {
        if self.child_done.load(Ordering::SeqCst) {
            return Some(Event::ChildDone);
        }
        if self.terminated.load(Ordering::SeqCst) {
            self.terminated.store(false, Ordering::SeqCst);
            let sig = self.caught.load(Ordering::SeqCst);
            return Some(Event::Terminated(sig));
        }
        if self.timer_fired.load(Ordering::SeqCst) {
            self.timer_fired.store(false, Ordering::SeqCst);
            return Some(Event::TimerFired);
        }
        None
    }
}

static EVENTS: SessionEvents = SessionEvents::new();

extern "C" fn on_child_exit(_: libc::c_int) {
    EVENTS.child_done.store(true, Ordering::SeqCst);
}

extern "C" fn on_timer(_: libc::c_int) {
    EVENTS.timer_fired.store(true, Ordering::SeqCst);
}

extern "C" fn on_terminate(sig: libc::c_int) {
    EVENTS.caught.store(sig, Ordering::SeqCst);
    EVENTS.terminated.store(true, Ordering::SeqCst);
}

/// What woke the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The child changed state (exited or was killed).
    ChildDone,
    /// The armed timer expired.
    TimerFired,
    /// A terminating signal (raw number) was delivered to the supervisor.
    Terminated(i32),
}

/// Errors from changing signal dispositions or the signal mask.
#[derive(Debug)]
pub enum SignalError {
    /// `sigaction` failed for a signal.
    Handler {
        signal: i32,
        action: &'static str,
        source: Errno,
    },
    /// `sigprocmask` failed.
    Mask { source: Errno },
    /// `sigsuspend` failed with something other than `EINTR`.
    Suspend { source: Errno },
}

impl SignalError {
    pub fn exit_code(&self) -> u8 {
        exit_code::OSERR
    }
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::Handler {
                signal,
                action,
                source,
            } => write!(
                f,
                "{action} signal handler for {signal}: {source}"
            ),
            SignalError::Mask { source } => write!(f, "could not change the signal mask: {source}"),
            SignalError::Suspend { source } => write!(f, "could not wait for signals: {source}"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Handler { source, .. } => Some(source),
            SignalError::Mask { source } => Some(source),
            SignalError::Suspend { source } => Some(source),
        }
    }
}

/// Install `handler` for `sig`.
///
/// `EINVAL` is tolerated for `KILL` and `STOP`, whose dispositions cannot be
/// changed, so restoring defaults before re-raising them is not an error.
pub fn set_handler(
    sig: Signal,
    handler: SigHandler,
    flags: SaFlags,
    action: &'static str,
) -> Result<(), SignalError> {
    let act = SigAction::new(handler, flags, SigSet::empty());
    // SAFETY: the handlers installed here only store into atomics.
    match unsafe { signal::sigaction(sig, &act) } {
        Ok(_) => Ok(()),
        Err(Errno::EINVAL) if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) => Ok(()),
        Err(source) => Err(SignalError::Handler {
            signal: sig as i32,
            action,
            source,
        }),
    }
}

/// Put signal number `sig` back to its default disposition.
///
/// Numbers without a nix `Signal` (real-time signals) go through `sigaction`
/// directly.
pub fn restore_default(sig: i32) -> Result<(), SignalError> {
    if let Ok(known) = Signal::try_from(sig) {
        return set_handler(known, SigHandler::SigDfl, SaFlags::empty(), "restoring");
    }
    // SAFETY: act is zero-initialised, then given SIG_DFL and an empty mask;
    // no handler code is installed.
    let rc = unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(sig, &act, std::ptr::null_mut())
    };
    Errno::result(rc)
        .map(drop)
        .map_err(|source| SignalError::Handler {
            signal: sig,
            action: "restoring",
            source,
        })
}

/// Receiver for the asynchronous events of one supervision session.
///
/// While alive, the watched signals are blocked everywhere except inside
/// [`SignalEvents::wait`], which unblocks them atomically with the suspend.
/// A signal arriving between a flag check and the wait therefore stays
/// pending and interrupts the wait instead of being lost. Dropping the
/// receiver restores the original signal mask.
pub struct SignalEvents {
    original_mask: SigSet,
    wait_mask: SigSet,
}

impl SignalEvents {
    /// Clear all flags, block the watched signals and install the handlers.
    pub fn install() -> Result<Self, SignalError> {
        EVENTS.reset();

        let mut watched = SigSet::empty();
        for sig in WATCHED {
            watched.add(sig);
        }
        let mut original_mask = SigSet::empty();
        signal::sigprocmask(
            SigmaskHow::SIG_BLOCK,
            Some(&watched),
            Some(&mut original_mask),
        )
        .map_err(|source| SignalError::Mask { source })?;

        let mut wait_mask = original_mask;
        for sig in WATCHED {
            wait_mask.remove(sig);
        }
        let events = Self {
            original_mask,
            wait_mask,
        };

        set_handler(
            Signal::SIGALRM,
            SigHandler::Handler(on_timer),
            SaFlags::empty(),
            "setting",
        )?;
        install_child_handler()?;
        for sig in TERMINATING {
            set_handler(
                sig,
                SigHandler::Handler(on_terminate),
                SaFlags::empty(),
                "setting",
            )?;
        }

        Ok(events)
    }

    /// The signal mask the process had before the session started.
    pub fn original_mask(&self) -> &SigSet {
        &self.original_mask
    }

    /// Block until one of the watched events is pending, then consume it.
    pub fn wait(&self) -> Result<Event, SignalError> {
        loop {
            if let Some(event) = EVENTS.take() {
                return Ok(event);
            }
            let mask: &libc::sigset_t = self.wait_mask.as_ref();
            // SAFETY: mask is a fully initialised sigset_t owned by self.
            let rc = unsafe { libc::sigsuspend(mask) };
            match Errno::result(rc) {
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(source) => return Err(SignalError::Suspend { source }),
            }
        }
    }

    /// Forget a timer expiry that has not been consumed yet.
    pub fn clear_timer(&self) {
        EVENTS.clear_timer();
    }
}

impl Drop for SignalEvents {
    fn drop(&mut self) {
        if let Err(e) =
            signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.original_mask), None)
        {
            tracing::debug!(error = %e, "could not restore the signal mask");
        }
    }
}

/// Child-exit handler, asking not to be woken for merely stopped children.
///
/// `SA_NOCLDSTOP` is best-effort: if the host refuses it, the plain handler
/// is installed instead.
fn install_child_handler() -> Result<(), SignalError> {
    let handler = SigHandler::Handler(on_child_exit);
    match set_handler(Signal::SIGCHLD, handler, SaFlags::SA_NOCLDSTOP, "setting") {
        Err(SignalError::Handler {
            source: Errno::EINVAL,
            ..
        }) => {
            tracing::debug!("SA_NOCLDSTOP rejected, installing plain child handler");
            set_handler(Signal::SIGCHLD, handler, SaFlags::empty(), "setting")
        }
        other => other,
    }
}
