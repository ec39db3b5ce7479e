mod child;
mod config;
mod events;
mod exit_code;
mod propagate;
mod signals;
mod supervisor;
mod timer;

use clap::error::ErrorKind;
use clap::Parser;
use config::{Config, Overrides, TimeSpec};
use propagate::Exit;
use std::io::IsTerminal;
use std::process::ExitCode;
use supervisor::SuperviseError;
use tracing_subscriber::EnvFilter;

/// Run a command with a time limit: after the warning time the command gets
/// the warning signal, and if it is still running after the kill time it gets
/// the kill signal.
#[derive(Parser, Debug)]
#[command(name = "timelimit", version, about)]
pub struct Cli {
    /// Warning signal, by name or number
    #[arg(short = 's', value_name = "WSIG", env = "WARNSIG", value_parser = signals::parse_signal)]
    warn_signal: Option<i32>,

    /// Seconds to wait before sending the warning signal
    #[arg(short = 't', value_name = "WTIME", env = "WARNTIME", value_parser = config::parse_time)]
    warn_time: Option<TimeSpec>,

    /// Kill signal, by name or number
    #[arg(short = 'S', value_name = "KSIG", env = "KILLSIG", value_parser = signals::parse_signal)]
    kill_signal: Option<i32>,

    /// Seconds to wait after the warning signal before sending the kill signal
    #[arg(short = 'T', value_name = "KTIME", env = "KILLTIME", value_parser = config::parse_time)]
    kill_time: Option<TimeSpec>,

    /// If the command is killed by a signal, kill ourselves with the same signal
    #[arg(short = 'p')]
    propagate: bool,

    /// Quiet: do not report which signals are sent
    #[arg(short = 'q')]
    quiet: bool,

    /// List the known signal names and exit
    #[arg(short = 'l')]
    list_signals: bool,

    /// List the supported features and exit
    #[arg(long)]
    features: bool,

    /// Validate the options, print the resolved settings and exit without running
    #[arg(long)]
    dry_run: bool,

    /// Command to run, with its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required_unless_present_any = ["features", "list_signals"]
    )]
    command: Vec<String>,
}

fn features_line() -> String {
    let mut line = format!("Features: timelimit={}", env!("CARGO_PKG_VERSION"));
    if config::SUBSECOND {
        line.push_str(" subsecond=1.0");
    }
    line
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .init();
}

/// Supervise the child, reap it and turn its disposition into our exit.
fn run(config: &Config) -> Result<ExitCode, SuperviseError> {
    let pid = supervisor::supervise(config)?;
    let disposition = child::reap(pid)?;
    tracing::debug!(?disposition, propagate = config.propagate, "child finished");
    match propagate::resolve(disposition, config.propagate) {
        Exit::Code(code) => Ok(ExitCode::from(code)),
        Exit::Raise(sig) => propagate::raise_signal(sig),
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            _ => {
                let _ = e.print();
                return ExitCode::from(exit_code::USAGE);
            }
        },
    };

    init_logging();
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.features {
        println!("{}", features_line());
        return ExitCode::from(exit_code::OK);
    }
    if cli.list_signals {
        println!("{}", signals::names().join(" "));
        return ExitCode::from(exit_code::OK);
    }

    let overrides = Overrides {
        warn_signal: cli.warn_signal,
        warn_time: cli.warn_time,
        kill_signal: cli.kill_signal,
        kill_time: cli.kill_time,
    };
    let using_defaults = overrides.is_empty();

    let config = match Config::resolve(overrides, cli.propagate, cli.quiet, cli.command) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if using_defaults && !config.quiet {
        tracing::warn!(
            "using defaults: warntime={}, warnsig={}, killtime={}, killsig={}",
            config.warn_time,
            config.warn_signal,
            config.kill_time,
            config.kill_signal
        );
    }

    if cli.dry_run {
        return match config.to_toml() {
            Ok(toml) => {
                print!("{toml}");
                ExitCode::from(exit_code::OK)
            }
            Err(e) => {
                tracing::error!("could not render the configuration: {e}");
                ExitCode::from(exit_code::SOFTWARE)
            }
        };
    }

    match run(&config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
