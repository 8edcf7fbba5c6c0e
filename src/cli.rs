//! Command-line interface for shell-relay.
//!
//! Uses lexopt for minimal binary size overhead (~34KB).

use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Machine to run the command on (defaults to the configured default).
    pub machine: Option<String>,
    /// Command timeout in seconds (overrides config).
    pub timeout_secs: Option<u64>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Probe every pooled machine instead of running a command.
    pub check: bool,
    /// Command line to run, joined with spaces.
    pub command: Vec<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

impl Args {
    /// The command line to execute, if one was given.
    pub fn command_line(&self) -> Option<String> {
        if self.command.is_empty() {
            None
        } else {
            Some(self.command.join(" "))
        }
    }
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('m') | Long("machine") => {
                result.machine = Some(parser.value()?.parse()?);
            }
            Short('t') | Long("timeout") => {
                let value: String = parser.value()?.parse()?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| ArgsError::InvalidValue("timeout", value.clone()))?;
                if secs == 0 {
                    return Err(ArgsError::InvalidValue("timeout", value));
                }
                result.timeout_secs = Some(secs);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Long("check") => {
                result.check = true;
            }
            Value(val) => {
                // Everything from the first positional on belongs to the command.
                result.command.push(val.to_string_lossy().into_owned());
                result.command.extend(
                    parser
                        .raw_args()?
                        .map(|raw| raw.to_string_lossy().into_owned()),
                );
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    if result.check && !result.command.is_empty() {
        return Err(ArgsError::Conflict("--check", "COMMAND"));
    }

    Ok(result)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"shell-relay {version}
Sandboxed command and file execution on local, SSH and WinRM machines

USAGE:
    shell-relay [OPTIONS] [COMMAND]...
    shell-relay [OPTIONS] --check

OPTIONS:
    -c, --config <FILE>     Path to configuration file (JSON)
    -m, --machine <NAME>    Target machine [default: configured default]
    -t, --timeout <SECS>    Command timeout in seconds [default: 60]
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
        --check             Probe every configured machine and exit
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    SHELL_RELAY_WORKSPACE   Local working directory (overrides config)
    SHELL_RELAY_TIMEOUT     Command timeout in seconds (overrides config)
    SHELL_RELAY_LOG_LEVEL   Log level (overrides config)
    RUST_LOG                Alternative log level setting
    SSH_SERVER_HOST         Define an SSH machine (see SSH_SERVER_* / SSH_*)
    WINRM_SERVER_HOST       Define a WinRM machine (see WINRM_SERVER_* / WINRM_*)

EXAMPLES:
    # Run on the local machine
    shell-relay uname -a

    # Run on a configured remote machine
    shell-relay -c machines.json -m db -- df -h

    # Check every connection
    shell-relay -c machines.json --check
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("shell-relay {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Two options that cannot be combined.
    Conflict(&'static str, &'static str),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::Conflict(a, b) => write!(f, "{} cannot be combined with {}", a, b),
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("shell-relay")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_default_args() {
        let result = parse_args_from(args(&[])).unwrap();
        assert!(result.config.is_none());
        assert!(result.machine.is_none());
        assert!(!result.check);
        assert!(result.command_line().is_none());
    }

    #[test]
    fn test_machine_and_timeout() {
        let result = parse_args_from(args(&["-m", "db", "-t", "5", "uptime"])).unwrap();
        assert_eq!(result.machine, Some("db".to_string()));
        assert_eq!(result.timeout_secs, Some(5));
        assert_eq!(result.command_line(), Some("uptime".to_string()));
    }

    #[test]
    fn test_command_keeps_its_flags() {
        let result = parse_args_from(args(&["ls", "-la", "/tmp"])).unwrap();
        assert_eq!(result.command_line(), Some("ls -la /tmp".to_string()));
    }

    #[test]
    fn test_double_dash() {
        let result = parse_args_from(args(&["-m", "web", "--", "df", "-h"])).unwrap();
        assert_eq!(result.command_line(), Some("df -h".to_string()));
    }

    #[test]
    fn test_config_file() {
        let result = parse_args_from(args(&["-c", "/etc/relay.json"])).unwrap();
        assert_eq!(result.config, Some(PathBuf::from("/etc/relay.json")));
    }

    #[test]
    fn test_check_flag() {
        let result = parse_args_from(args(&["--check"])).unwrap();
        assert!(result.check);
    }

    #[test]
    fn test_check_conflicts_with_command() {
        assert!(parse_args_from(args(&["--check", "uptime"])).is_err());
    }

    #[test]
    fn test_help_flag() {
        let result = parse_args_from(args(&["-h"])).unwrap();
        assert!(result.help);

        let result = parse_args_from(args(&["--help"])).unwrap();
        assert!(result.help);
    }

    #[test]
    fn test_version_flag() {
        let result = parse_args_from(args(&["-V"])).unwrap();
        assert!(result.version);
    }

    #[test]
    fn test_log_level() {
        let result = parse_args_from(args(&["-l", "debug"])).unwrap();
        assert_eq!(result.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_invalid_timeout() {
        assert!(parse_args_from(args(&["-t", "soon"])).is_err());
        assert!(parse_args_from(args(&["-t", "0"])).is_err());
    }

    #[test]
    fn test_unknown_option() {
        assert!(parse_args_from(args(&["--bogus"])).is_err());
    }
}
