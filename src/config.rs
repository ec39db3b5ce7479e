use crate::exit_code;
use crate::signals;
use nix::libc;
use serde::{Serialize, Serializer};
use std::fmt;

/// Default warning signal and delay before it is sent.
pub const DEFAULT_WARN_SIGNAL: i32 = libc::SIGTERM;
pub const DEFAULT_WARN_TIME: TimeSpec = TimeSpec::from_secs(3600);

/// Default kill signal and grace period before it is sent.
pub const DEFAULT_KILL_SIGNAL: i32 = libc::SIGKILL;
pub const DEFAULT_KILL_TIME: TimeSpec = TimeSpec::from_secs(120);

/// Whether timers can be armed with sub-second resolution in this build.
pub const SUBSECOND: bool = cfg!(feature = "subsecond");

/// A timer interval: whole seconds plus a microsecond fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    pub seconds: u64,
    pub micros: u32,
}

impl TimeSpec {
    pub const fn from_secs(seconds: u64) -> Self {
        Self { seconds, micros: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.micros == 0
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.micros == 0 {
            return write!(f, "{}", self.seconds);
        }
        let frac = format!("{:06}", self.micros);
        write!(f, "{}.{}", self.seconds, frac.trim_end_matches('0'))
    }
}

impl Serialize for TimeSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Errors in option values. All of them are usage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Not a valid duration.
    InvalidTime(String),
    /// More than six fractional digits.
    Precision(String),
    /// Sub-second duration requested but only whole-second timers exist.
    UnsupportedPrecision(String),
    /// Not a known signal name or number.
    InvalidSignal(String),
    /// The warn or kill stage would be disabled.
    ZeroDuration { stage: &'static str },
    /// No command given.
    NoCommand,
}

impl ConfigError {
    pub fn exit_code(&self) -> u8 {
        exit_code::USAGE
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidTime(s) => write!(f, "invalid time value: {s:?}"),
            ConfigError::Precision(s) => {
                write!(f, "no more than microsecond precision: {s:?}")
            }
            ConfigError::UnsupportedPrecision(s) => write!(
                f,
                "subsecond precision not supported on this platform: {s:?}"
            ),
            ConfigError::InvalidSignal(s) => write!(f, "invalid signal: {s:?}"),
            ConfigError::ZeroDuration { stage } => {
                write!(f, "the {stage} time must be greater than zero")
            }
            ConfigError::NoCommand => write!(f, "no command specified"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse a duration: decimal seconds with an optional fraction of at most
/// six digits (`"3600"`, `"1."`, `"0.25"`).
pub fn parse_time(s: &str) -> Result<TimeSpec, ConfigError> {
    let invalid = || ConfigError::InvalidTime(s.to_string());

    let (whole, frac) = match s.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (s, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let seconds: u64 = whole.parse().map_err(|_| invalid())?;

    let Some(frac) = frac else {
        return Ok(TimeSpec::from_secs(seconds));
    };
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > 6 {
        return Err(ConfigError::Precision(s.to_string()));
    }

    let mut micros: u32 = 0;
    for b in frac.bytes() {
        micros = micros * 10 + u32::from(b - b'0');
    }
    for _ in frac.len()..6 {
        micros *= 10;
    }

    if !SUBSECOND && seconds == 0 && micros != 0 {
        return Err(ConfigError::UnsupportedPrecision(s.to_string()));
    }

    Ok(TimeSpec { seconds, micros })
}

/// Values set through the environment or the command line, before defaults.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub warn_signal: Option<i32>,
    pub warn_time: Option<TimeSpec>,
    pub kill_signal: Option<i32>,
    pub kill_time: Option<TimeSpec>,
}

impl Overrides {
    /// True if none of the four values were set by any source.
    pub fn is_empty(&self) -> bool {
        self.warn_signal.is_none()
            && self.warn_time.is_none()
            && self.kill_signal.is_none()
            && self.kill_time.is_none()
    }
}

/// Signals render by name, or as the bare number when the host has no name for them.
fn serialize_signal<S: Serializer>(sig: &i32, serializer: S) -> Result<S::Ok, S::Error> {
    match signals::name(*sig) {
        Some(name) => serializer.serialize_str(name),
        None => serializer.collect_str(sig),
    }
}

/// Fully resolved settings for one supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    #[serde(serialize_with = "serialize_signal")]
    pub warn_signal: i32,
    pub warn_time: TimeSpec,
    #[serde(serialize_with = "serialize_signal")]
    pub kill_signal: i32,
    pub kill_time: TimeSpec,
    pub propagate: bool,
    pub quiet: bool,
    pub command: Vec<String>,
}

impl Config {
    /// Apply defaults to the overrides and validate the result.
    pub fn resolve(
        overrides: Overrides,
        propagate: bool,
        quiet: bool,
        command: Vec<String>,
    ) -> Result<Self, ConfigError> {
        if command.is_empty() {
            return Err(ConfigError::NoCommand);
        }

        let config = Self {
            warn_signal: overrides.warn_signal.unwrap_or(DEFAULT_WARN_SIGNAL),
            warn_time: overrides.warn_time.unwrap_or(DEFAULT_WARN_TIME),
            kill_signal: overrides.kill_signal.unwrap_or(DEFAULT_KILL_SIGNAL),
            kill_time: overrides.kill_time.unwrap_or(DEFAULT_KILL_TIME),
            propagate,
            quiet,
            command,
        };

        if config.warn_time.is_zero() {
            return Err(ConfigError::ZeroDuration { stage: "warning" });
        }
        if config.kill_time.is_zero() {
            return Err(ConfigError::ZeroDuration { stage: "kill" });
        }
        Ok(config)
    }

    /// Render the resolved settings as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_time_whole_seconds() {
        assert_eq!(parse_time("3600").unwrap(), TimeSpec::from_secs(3600));
        assert_eq!(parse_time("0").unwrap(), TimeSpec::from_secs(0));
    }

    #[test]
    fn test_parse_time_fraction_scales_to_micros() {
        assert_eq!(
            parse_time("1.5").unwrap(),
            TimeSpec {
                seconds: 1,
                micros: 500_000
            }
        );
        assert_eq!(
            parse_time("2.000001").unwrap(),
            TimeSpec {
                seconds: 2,
                micros: 1
            }
        );
    }

    #[test]
    fn test_parse_time_trailing_dot() {
        assert_eq!(parse_time("1.").unwrap(), TimeSpec::from_secs(1));
    }

    #[test]
    #[cfg(feature = "subsecond")]
    fn test_parse_time_subsecond_only() {
        assert_eq!(
            parse_time("0.25").unwrap(),
            TimeSpec {
                seconds: 0,
                micros: 250_000
            }
        );
    }

    #[test]
    #[cfg(not(feature = "subsecond"))]
    fn test_parse_time_subsecond_only_unsupported() {
        assert!(matches!(
            parse_time("0.25"),
            Err(ConfigError::UnsupportedPrecision(_))
        ));
    }

    #[test]
    fn test_parse_time_rejects_more_than_micros() {
        assert!(matches!(
            parse_time("1.1234567"),
            Err(ConfigError::Precision(_))
        ));
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        for bad in ["", ".5", "abc", "1s", "1.5x", "-1", "1.2.3", " 1"] {
            assert!(
                matches!(parse_time(bad), Err(ConfigError::InvalidTime(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_timespec_display() {
        assert_eq!(TimeSpec::from_secs(120).to_string(), "120");
        assert_eq!(
            TimeSpec {
                seconds: 1,
                micros: 500_000
            }
            .to_string(),
            "1.5"
        );
        assert_eq!(
            TimeSpec {
                seconds: 0,
                micros: 1_000
            }
            .to_string(),
            "0.001"
        );
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let config = Config::resolve(Overrides::default(), false, false, cmd(&["true"])).unwrap();
        assert_eq!(config.warn_signal, libc::SIGTERM);
        assert_eq!(config.warn_time, TimeSpec::from_secs(3600));
        assert_eq!(config.kill_signal, libc::SIGKILL);
        assert_eq!(config.kill_time, TimeSpec::from_secs(120));
    }

    #[test]
    fn test_resolve_keeps_overrides() {
        let overrides = Overrides {
            warn_signal: Some(libc::SIGUSR1),
            warn_time: Some(TimeSpec::from_secs(5)),
            kill_signal: Some(libc::SIGTERM),
            kill_time: Some(TimeSpec::from_secs(7)),
        };
        assert!(!overrides.is_empty());
        let config = Config::resolve(overrides, true, true, cmd(&["sleep", "1"])).unwrap();
        assert_eq!(config.warn_signal, libc::SIGUSR1);
        assert_eq!(config.warn_time.seconds, 5);
        assert_eq!(config.kill_signal, libc::SIGTERM);
        assert_eq!(config.kill_time.seconds, 7);
        assert!(config.propagate);
        assert!(config.quiet);
        assert_eq!(config.command, cmd(&["sleep", "1"]));
    }

    #[test]
    fn test_resolve_rejects_zero_durations() {
        let overrides = Overrides {
            warn_time: Some(TimeSpec::from_secs(0)),
            ..Default::default()
        };
        let err = Config::resolve(overrides, false, false, cmd(&["true"])).unwrap_err();
        assert_eq!(err, ConfigError::ZeroDuration { stage: "warning" });

        let overrides = Overrides {
            kill_time: Some(TimeSpec::from_secs(0)),
            ..Default::default()
        };
        let err = Config::resolve(overrides, false, false, cmd(&["true"])).unwrap_err();
        assert_eq!(err, ConfigError::ZeroDuration { stage: "kill" });
        assert_eq!(err.exit_code(), exit_code::USAGE);
    }

    #[test]
    fn test_resolve_rejects_empty_command() {
        let err = Config::resolve(Overrides::default(), false, false, vec![]).unwrap_err();
        assert_eq!(err, ConfigError::NoCommand);
    }

    #[test]
    fn test_overrides_empty_by_default() {
        assert!(Overrides::default().is_empty());
    }

    #[test]
    fn test_to_toml_uses_signal_names() {
        let overrides = Overrides {
            warn_time: Some(TimeSpec {
                seconds: 1,
                micros: 250_000,
            }),
            ..Default::default()
        };
        let config = Config::resolve(overrides, false, true, cmd(&["sleep", "5"])).unwrap();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("warn_signal = \"TERM\""));
        assert!(toml.contains("kill_signal = \"KILL\""));
        assert!(toml.contains("warn_time = \"1.25\""));
        assert!(toml.contains("kill_time = \"120\""));
        assert!(toml.contains("quiet = true"));
        assert!(toml.contains("command = [\"sleep\", \"5\"]"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_to_toml_renders_unnamed_signal_as_number() {
        let overrides = Overrides {
            kill_signal: Some(35),
            ..Default::default()
        };
        let config = Config::resolve(overrides, false, false, cmd(&["true"])).unwrap();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("kill_signal = \"35\""));
    }
}
