// SPDX-License-Identifier: MIT
//! Diagnostics for the generator itself.
//!
//! Two independent outputs exist:
//!
//! * [`init_logging`] – installs the global `tracing` subscriber used for
//!   structured diagnostics (worker lifecycle, export failures, final counts).
//! * [`ConsoleOutput`] – plain progress lines for a human watching the terminal
//!   (banner, overridden settings, "Logs generated: N").
//!
//! With `terminal-output` enabled (the default) diagnostics are compact
//! single-line records on stderr so they do not interleave with progress lines
//! on stdout. With it disabled, progress lines are suppressed and diagnostics
//! become JSON objects on stdout, suitable for log shippers.
//!
//! # Level
//! `RUST_LOG`, when set, wins over the configured `log-level`. Level names are
//! case-insensitive; `warning` is accepted for `warn`. An unknown level falls
//! back to `info`.
//!
//! # Example
//! ```no_run
//! use trazr_gen::logging::{init_logging, LoggingConfig};
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LoggingConfig::default())?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```
use std::fmt::Display;

use anyhow::Result;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::config::Config;

const BANNER: &str = r"
 _
| |_ _ __ __ _ _________      __ _  ___ _ __
| __| '__/ _` |_  /  __|____ / _` |/ _ \ '_ \
| |_| | | (_| |/ /| |  |____| (_| |  __/ | | |
 \__|_|  \__,_/___|_|        \__, |\___|_| |_|
                             |___/
";

/// Settings for [`init_logging`].
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Minimum level: `debug`, `info`, `warn` or `error`.
    pub level: String,
    /// Compact stderr output when true, JSON on stdout otherwise.
    pub terminal_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            terminal_output: true,
        }
    }
}

impl From<&Config> for LoggingConfig {
    fn from(config: &Config) -> Self {
        Self {
            level: config.log_level.clone(),
            terminal_output: config.terminal_output,
        }
    }
}

/// Normalizes a configured level name into an `EnvFilter` directive.
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" | "panic" => "error",
        _ => "info",
    }
}

/// Install the global diagnostics subscriber.
///
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(&cfg.level)));

    if cfg.terminal_output {
        let layer = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact();
        Registry::default().with(filter).with(layer).try_init()?;
    } else {
        let layer = fmt::layer().json().with_current_span(false).with_writer(std::io::stdout);
        Registry::default().with(filter).with(layer).try_init()?;
    }
    Ok(())
}

/// Human-facing progress output on stdout, silent when disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleOutput {
    enabled: bool,
}

impl ConsoleOutput {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn println(&self, line: impl Display) {
        if self.enabled {
            println!("{line}");
        }
    }

    pub fn errorln(&self, line: impl Display) {
        if self.enabled {
            eprintln!("{line}");
        }
    }

    pub fn banner(&self) {
        self.println(BANNER);
        self.println(format_args!("trazr-gen {}", env!("CARGO_PKG_VERSION")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_normalized() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("fatal"), "error");
        assert_eq!(level_directive("chatty"), "info");
    }

    #[test]
    fn logging_installs_once() {
        let cfg = LoggingConfig {
            level: "debug".into(),
            terminal_output: false,
        };
        assert!(init_logging(&cfg).is_ok());
        assert!(init_logging(&cfg).is_err());
    }

    #[test]
    fn logging_config_follows_the_run_config() {
        let mut config = Config::default();
        config.log_level = "error".into();
        config.terminal_output = false;
        let cfg = LoggingConfig::from(&config);
        assert_eq!(cfg.level, "error");
        assert!(!cfg.terminal_output);
    }
}
