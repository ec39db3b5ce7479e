use crate::config::ConfigError;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::str::FromStr;

/// Names accepted and listed in addition to the host's canonical ones.
const ALIASES: [(&str, Signal); 2] = [("IOT", Signal::SIGABRT), ("POLL", Signal::SIGIO)];

/// Highest signal number the host can deliver, real-time signals included.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn max_signal() -> i32 {
    libc::SIGRTMAX()
}

/// Highest signal number the host can deliver.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn max_signal() -> i32 {
    Signal::iterator().map(|s| s as i32).max().unwrap_or(libc::SIGTERM)
}

/// Short name of a signal without the `SIG` prefix (e.g. `TERM`), if the host
/// names it. Real-time signals have no name.
pub fn name(sig: i32) -> Option<&'static str> {
    let full = Signal::try_from(sig).ok()?.as_str();
    Some(full.strip_prefix("SIG").unwrap_or(full))
}

/// All signal names, canonical ones in ascending signal-number order followed
/// by the aliases.
pub fn names() -> Vec<&'static str> {
    let mut sigs: Vec<i32> = Signal::iterator().map(|s| s as i32).collect();
    sigs.sort_unstable();
    sigs.into_iter()
        .filter_map(name)
        .chain(ALIASES.iter().map(|(alias, _)| *alias))
        .collect()
}

/// Parse a signal given either as a decimal number or as a name.
///
/// Names are accepted with or without the `SIG` prefix, plus the `IOT` and
/// `POLL` aliases. Numbers must lie in `1..=max_signal()`, so real-time
/// signals can be given numerically.
pub fn parse_signal(s: &str) -> Result<i32, ConfigError> {
    let invalid = || ConfigError::InvalidSignal(s.to_string());

    if s.is_empty() {
        return Err(invalid());
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        let n: i32 = s.parse().map_err(|_| invalid())?;
        if (1..=max_signal()).contains(&n) {
            return Ok(n);
        }
        return Err(invalid());
    }

    // Names only; a leading digit with trailing garbage is not a name either.
    if s.as_bytes()[0].is_ascii_digit() {
        return Err(invalid());
    }

    let bare = s.strip_prefix("SIG").unwrap_or(s);
    if let Some((_, sig)) = ALIASES.iter().find(|(alias, _)| *alias == bare) {
        return Ok(*sig as i32);
    }
    Signal::from_str(&format!("SIG{bare}"))
        .map(|sig| sig as i32)
        .map_err(|_| invalid())
}

/// Send `sig` to `pid`, including numbers nix has no `Signal` for.
pub fn send(pid: Pid, sig: i32) -> Result<(), Errno> {
    match Signal::try_from(sig) {
        Ok(sig) => signal::kill(pid, sig),
        Err(_) => {
            // SAFETY: kill(2) takes plain integers.
            let rc = unsafe { libc::kill(pid.as_raw(), sig) };
            Errno::result(rc).map(drop)
        }
    }
}

/// Remove `sig` from the blocked set of the calling thread.
pub fn unblock(sig: i32) -> Result<(), Errno> {
    // SAFETY: set is initialised by sigemptyset before use and only borrowed
    // for the duration of each call.
    let rc = unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut())
    };
    Errno::result(rc).map(drop)
}

/// Deliver `sig` to the calling process.
pub fn raise(sig: i32) -> Result<(), Errno> {
    match Signal::try_from(sig) {
        Ok(sig) => signal::raise(sig),
        Err(_) => {
            // SAFETY: raise(3) takes a plain integer.
            let rc = unsafe { libc::raise(sig) };
            Errno::result(rc).map(drop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_by_name() {
        assert_eq!(parse_signal("TERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("USR1").unwrap(), libc::SIGUSR1);
    }

    #[test]
    fn test_parse_signal_with_sig_prefix() {
        assert_eq!(parse_signal("SIGHUP").unwrap(), libc::SIGHUP);
    }

    #[test]
    fn test_parse_signal_aliases() {
        assert_eq!(parse_signal("IOT").unwrap(), libc::SIGABRT);
        assert_eq!(parse_signal("POLL").unwrap(), libc::SIGIO);
        assert_eq!(parse_signal("SIGPOLL").unwrap(), libc::SIGIO);
    }

    #[test]
    fn test_parse_signal_by_number() {
        assert_eq!(parse_signal("9").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("15").unwrap(), libc::SIGTERM);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_parse_signal_accepts_realtime_numbers() {
        assert_eq!(parse_signal("35").unwrap(), 35);
        let max = max_signal();
        assert_eq!(parse_signal(&max.to_string()).unwrap(), max);
    }

    #[test]
    fn test_parse_signal_rejects_out_of_range_and_unknown() {
        assert!(parse_signal("0").is_err());
        assert!(parse_signal(&(max_signal() + 1).to_string()).is_err());
        assert!(parse_signal("99999999999").is_err());
        assert!(parse_signal("NOSUCH").is_err());
        assert!(parse_signal("term").is_err());
    }

    #[test]
    fn test_parse_signal_rejects_garbage() {
        assert!(parse_signal("").is_err());
        assert!(parse_signal("15x").is_err());
        assert!(parse_signal("1.5").is_err());
        let err = parse_signal("BOGUS").unwrap_err();
        assert!(err.to_string().contains("BOGUS"));
    }

    #[test]
    fn test_name_of_realtime_signal_is_none() {
        assert_eq!(name(libc::SIGTERM), Some("TERM"));
        #[cfg(target_os = "linux")]
        assert_eq!(name(35), None);
    }

    #[test]
    fn test_names_sorted_unprefixed_with_aliases() {
        let list = names();
        assert!(list.contains(&"TERM"));
        assert!(list.contains(&"KILL"));
        assert!(list.contains(&"IOT"));
        assert!(list.contains(&"POLL"));
        assert!(list.iter().all(|n| !n.starts_with("SIG")));
        let hup = list.iter().position(|n| *n == "HUP").unwrap();
        let term = list.iter().position(|n| *n == "TERM").unwrap();
        assert!(hup < term);
    }

    #[test]
    fn test_every_listed_name_parses() {
        for n in names() {
            let sig = parse_signal(n).unwrap();
            assert!(sig >= 1 && sig <= max_signal(), "{n} -> {sig}");
        }
    }
}
