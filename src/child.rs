//! Child process lifecycle: fork and exec the supervised command, then reap it.

use crate::exit_code;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use std::ffi::{CString, NulError};
use std::fmt;

/// How the child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Normal exit with this status.
    Exited(u8),
    /// Terminated by this signal number, which may be a real-time signal.
    Signaled(i32),
}

/// Errors creating or reaping the child.
#[derive(Debug)]
pub enum ChildError {
    /// An argument contains an interior NUL byte.
    Argument { arg: String, source: NulError },
    /// `fork` failed.
    Spawn { source: Errno },
    /// `waitpid` failed.
    Wait { pid: Pid, source: Errno },
    /// `waitpid` reported neither an exit nor a terminating signal.
    UnexpectedStatus { pid: Pid, status: libc::c_int },
}

impl ChildError {
    pub fn exit_code(&self) -> u8 {
        exit_code::OSERR
    }
}

impl fmt::Display for ChildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildError::Argument { arg, source } => {
                write!(f, "invalid argument {arg:?}: {source}")
            }
            ChildError::Spawn { source } => write!(f, "fork: {source}"),
            ChildError::Wait { pid, source } => write!(
                f,
                "could not get the exit status for process {pid}: {source}"
            ),
            ChildError::UnexpectedStatus { pid, status } => {
                write!(f, "unexpected wait status for process {pid}: {status:#x}")
            }
        }
    }
}

impl std::error::Error for ChildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChildError::Argument { source, .. } => Some(source),
            ChildError::Spawn { source } => Some(source),
            ChildError::Wait { source, .. } => Some(source),
            ChildError::UnexpectedStatus { .. } => None,
        }
    }
}

/// Convert the command line to C strings ahead of the fork.
fn c_args(command: &[String]) -> Result<Vec<CString>, ChildError> {
    command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes()).map_err(|source| ChildError::Argument {
                arg: arg.clone(),
                source,
            })
        })
        .collect()
}

/// Fork and exec `command`, returning the child's pid.
///
/// The child restores `mask` (the supervisor's mask from before the session
/// blocked its signals) and the default `SIGPIPE` disposition, then replaces
/// its image. Everything it needs is allocated before the fork. If the exec
/// fails the child writes one line to stderr and exits with `EX_OSERR`.
pub fn spawn(command: &[String], mask: &SigSet) -> Result<Pid, ChildError> {
    let args = c_args(command)?;
    let Some(program) = args.first() else {
        return Err(ChildError::Spawn {
            source: Errno::ENOENT,
        });
    };
    let prefix = format!("timelimit: executing {}: ", command[0]);

    // SAFETY: the child branch below only makes async-signal-safe calls
    // (sigaction, sigprocmask, execvp, write, _exit) on pre-allocated data.
    match unsafe { fork() }.map_err(|source| ChildError::Spawn { source })? {
        ForkResult::Parent { child } => {
            tracing::debug!(pid = %child, command = ?command, "child started");
            Ok(child)
        }
        ForkResult::Child => exec_child(program, &args, mask, prefix.as_bytes()),
    }
}

/// Runs in the forked child only; never returns.
fn exec_child(program: &CString, args: &[CString], mask: &SigSet, prefix: &[u8]) -> ! {
    // SAFETY: restoring SIG_DFL installs no handler.
    let _ = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) };
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(mask), None);

    let errno = match execvp(program, args) {
        Ok(never) => match never {},
        Err(e) => e,
    };

    let reason = errno.desc().as_bytes();
    for part in [prefix, reason, &b"\n"[..]] {
        // SAFETY: plain write(2) of a borrowed buffer to stderr.
        unsafe {
            libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len());
        }
    }
    // SAFETY: _exit skips atexit handlers and stdio flushing inherited from the parent.
    unsafe { libc::_exit(i32::from(exit_code::OSERR)) }
}

/// Decode a raw `waitpid` status into the child's final disposition.
///
/// Decoded by hand rather than through nix's `WaitStatus`, which cannot
/// represent signals outside its `Signal` enum.
pub fn disposition(pid: Pid, status: libc::c_int) -> Result<ExitDisposition, ChildError> {
    if libc::WIFEXITED(status) {
        Ok(ExitDisposition::Exited(libc::WEXITSTATUS(status) as u8))
    } else if libc::WIFSIGNALED(status) {
        Ok(ExitDisposition::Signaled(libc::WTERMSIG(status)))
    } else {
        Err(ChildError::UnexpectedStatus { pid, status })
    }
}

/// Block until `pid` terminates and return how it ended.
pub fn reap(pid: Pid) -> Result<ExitDisposition, ChildError> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        match Errno::result(rc) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(ChildError::Wait { pid, source }),
        }
    }
    tracing::debug!(pid = %pid, status = %format!("{status:#x}"), "child reaped");
    disposition(pid, status)
}
