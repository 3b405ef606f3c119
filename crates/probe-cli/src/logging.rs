//! Logging initialization

use anyhow::{Context, Result};
use probe_core::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Args, LogFormat};

/// Crates whose logs are ours
const OWN_TARGETS: &[&str] = &["probe_core", "netprobe"];

/// Protocol libraries, kept quiet below -vvv
const LIBRARY_TARGETS: &[&str] = &["hyper", "rustls", "tokio_rustls", "hickory_proto"];

/// Level for our own crates: command line first, then configuration
fn own_level(args: &Args, config: &LoggingConfig) -> Level {
    if args.quiet {
        return Level::ERROR;
    }
    match args.verbose {
        0 => config.level.parse().unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Filter directives used when `RUST_LOG` is not set
fn directives(args: &Args, config: &LoggingConfig) -> String {
    let own = own_level(args, config);
    let library = if args.verbose >= 3 { own } else { Level::WARN.min(own) };

    let mut out = vec![Level::WARN.min(own).to_string().to_lowercase()];
    out.extend(LIBRARY_TARGETS.iter().map(|t| format!("{t}={}", library.to_string().to_lowercase())));
    out.extend(OWN_TARGETS.iter().map(|t| format!("{t}={}", own.to_string().to_lowercase())));
    out.join(",")
}

fn format_of(args: &Args, config: &LoggingConfig) -> LogFormat {
    match args.log_format {
        Some(format) => format,
        None if config.json_format => LogFormat::Json,
        None => LogFormat::Text,
    }
}

/// Initialize logging from the command line and the `[logging]` section.
///
/// Logs go to stderr so that stdout carries the measurement only.
/// `RUST_LOG`, when set, replaces the computed filter.
pub fn init(args: &Args, config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(args, config)).context("Invalid log filter")?,
    };
    let log_file = args
        .log_file
        .as_ref()
        .map(|path| std::fs::File::create(path).with_context(|| format!("Failed to create log file: {path}")))
        .transpose()?;

    match format_of(args, config) {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(args.verbose >= 2)
                    .with_thread_ids(args.verbose >= 3)
                    .with_file(args.verbose >= 3)
                    .with_line_number(args.verbose >= 3),
            );
            match log_file {
                Some(file) => subscriber.with(fmt::layer().with_ansi(false).with_writer(file)).init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr));
            match log_file {
                Some(file) => subscriber.with(fmt::layer().json().with_writer(file)).init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr));
            match log_file {
                Some(file) => subscriber.with(fmt::layer().compact().with_ansi(false).with_writer(file)).init(),
                None => subscriber.init(),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["netprobe"];
        full.extend_from_slice(argv);
        full.extend_from_slice(&["config", "paths"]);
        Args::parse_from(full)
    }

    #[test]
    fn test_default_directives() {
        let filter = directives(&args(&[]), &LoggingConfig::default());
        assert_eq!(
            filter,
            "warn,hyper=warn,rustls=warn,tokio_rustls=warn,hickory_proto=warn,probe_core=info,netprobe=info"
        );
        assert!(EnvFilter::try_new(filter).is_ok());
    }

    #[test]
    fn test_verbose_keeps_libraries_quiet() {
        let filter = directives(&args(&["-vv"]), &LoggingConfig::default());
        assert!(filter.contains("probe_core=trace"));
        assert!(filter.contains("hyper=warn"));

        let filter = directives(&args(&["-vvv"]), &LoggingConfig::default());
        assert!(filter.contains("hyper=trace"));
    }

    #[test]
    fn test_quiet_wins() {
        let filter = directives(&args(&["-q", "-v"]), &LoggingConfig::default());
        assert!(filter.starts_with("error,"));
        assert!(filter.contains("probe_core=error"));
    }

    #[test]
    fn test_config_level_and_format() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json_format: true,
        };
        assert_eq!(own_level(&args(&[]), &config), Level::DEBUG);
        assert!(matches!(format_of(&args(&[]), &config), LogFormat::Json));
        assert!(matches!(format_of(&args(&["--log-format", "compact"]), &config), LogFormat::Compact));

        let bogus = LoggingConfig {
            level: "loud".to_string(),
            json_format: false,
        };
        assert_eq!(own_level(&args(&[]), &bogus), Level::INFO);
        assert!(matches!(format_of(&args(&[]), &bogus), LogFormat::Text));
    }
}
