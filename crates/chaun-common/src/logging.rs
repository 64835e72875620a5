//! Logging setup for the worker and its CLI.
//!
//! Output goes to stderr: the CLI prints its reports on stdout and those
//! must stay machine-readable.

use std::fmt as std_fmt;
use std::io::IsTerminal;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::CommonError;

/// HTTP stack crates that are noisy below `warn`.
pub const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON, for log shippers.
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl std_fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std_fmt::Formatter<'_>) -> std_fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(CommonError::InvalidArgument(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level for every target without a directive.
    pub level: Level,
    pub format: LogFormat,
    /// Extra `target=level` directives, applied after the defaults.
    pub directives: Vec<String>,
    /// Print file and line of each event.
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            directives: Vec::new(),
            source_location: false,
        }
    }
}

impl LogConfig {
    /// Level from a `-v` count: 0 info, 1 debug, 2+ trace with source locations.
    pub fn from_verbosity(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            level,
            source_location: verbosity >= 2,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Filter used when `RUST_LOG` is unset.
    ///
    /// At trace level the HTTP stack is left unfiltered.
    pub fn filter_spec(&self) -> String {
        let mut parts = vec![self.level.as_str().to_ascii_lowercase()];
        if self.level != Level::TRACE {
            parts.extend(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()));
        }
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter, CommonError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(self.filter_spec())
                .map_err(|e| CommonError::InvalidArgument(format!("log filter: {}", e))),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), CommonError> {
    let filter = config.env_filter()?;
    let ansi = std::io::stderr().is_terminal();

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(ansi)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_ansi(ansi)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| CommonError::Logging(e.to_string()))
}
