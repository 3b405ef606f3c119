//! CLI commands

pub mod config;
pub mod measure;

use clap::Subcommand;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Measure a URL (main command)
    Measure(measure::MeasureArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}
