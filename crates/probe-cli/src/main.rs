//! netprobe CLI
//!
//! Command-line interface for measuring DNS, TCP, TLS, QUIC and HTTP
//! reachability of a URL.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use args::Args;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging; a broken config file is reported by the command itself
    let logging_config = commands::config::load_config(args.config.as_deref())
        .map(|config| config.logging)
        .unwrap_or_default();
    logging::init(&args, &logging_config)?;

    if !args.quiet {
        print_banner();
    }

    let result = run(args);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args) -> Result<()> {
    match args.command {
        commands::Command::Measure(measure_args) => {
            commands::measure::execute(measure_args, args.config.as_deref(), args.quiet)
        }
        commands::Command::Config(config_args) => commands::config::execute(config_args),
    }
}

fn print_banner() {
    use colored::Colorize;

    eprintln!();
    eprintln!(
        "{} {}",
        "netprobe".green().bold(),
        env!("CARGO_PKG_VERSION").white()
    );
    eprintln!("{}", "network interference measurements".cyan());
    eprintln!();
}
