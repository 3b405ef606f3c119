//! Config command - configuration management

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use probe_core::config::Config;
use std::path::{Path, PathBuf};
use tracing::info;

/// Files looked up, in order, when no configuration is given
pub const CONFIG_CANDIDATES: &[&str] = &["netprobe.toml", "config.toml"];

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Config file to show (default: detect)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "netprobe.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate
        file: PathBuf,
    },

    /// Show config file locations
    Paths,
}

/// Execute config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show { file } => show_config(file.as_deref()),
        ConfigAction::Generate { output } => generate_config(&output),
        ConfigAction::Validate { file } => validate_config(&file).map(|_| ()),
        ConfigAction::Paths => {
            show_paths();
            Ok(())
        }
    }
}

/// The configuration in `path`, or in the first candidate file found, or
/// the defaults
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.map(Path::to_path_buf).or_else(find_config_file);
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let config = Config::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn show_config(file: Option<&Path>) -> Result<()> {
    let config = load_config(file)?;
    let toml_str = config.to_toml().context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let toml_str = Config::default().to_toml().context("Failed to serialize config")?;
    let content = format!(
        "# netprobe configuration\n\
         # Every key is optional; missing keys take the values below\n\n\
         {toml_str}"
    );

    std::fs::write(output, content).with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!("Generated config file: {}", output.display());
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: &Path) -> Result<Config> {
    let config = Config::load(file).with_context(|| format!("Failed to load config from {}", file.display()))?;
    config.validate().context("Configuration validation failed")?;

    println!("{} Configuration is valid", "✓".green());
    println!("  DNS timeout: {:?}", config.timeouts.dns());
    println!("  UDP resolver: {}", config.pipeline.udp_resolver);
    println!("  Parallelism: {}", config.pipeline.parallelism);
    println!("  Max body: {} bytes", config.pipeline.max_body_bytes);
    Ok(config)
}

fn show_paths() {
    println!("Configuration file search paths:");
    println!();
    for (i, candidate) in CONFIG_CANDIDATES.iter().enumerate() {
        println!("  {}. ./{candidate}", i + 1);
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netprobe.toml");
        generate_config(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# netprobe configuration"));

        let config = validate_config(&path).unwrap();
        assert_eq!(config.pipeline.udp_resolver, "8.8.8.8:53");
    }

    #[test]
    fn test_load_explicit_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[timeouts]\ndns_ms = 0\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("timeouts.dns_ms"));
    }

    #[test]
    fn test_load_missing_config() {
        assert!(load_config(Some(Path::new("/nonexistent/netprobe.toml"))).is_err());
    }
}
