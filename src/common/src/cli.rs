use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command line arguments for the s3tail binary
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<CommonCommands>,
}

#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Poll the bucket until stopped (default behavior)
    #[default]
    Start,
    /// Run a single pass and exit
    Once,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show tracker location and number of tracked keys
    Status,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments.
    ///
    /// Logs go to stderr; stdout carries the emitted events.
    pub fn init_logging(args: &CommonArgs) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("s3tail Configuration:");
            println!("=====================");
            println!("Bucket: {}", config.bucket);
            println!("Prefix: {}", config.prefix().unwrap_or("(all keys)"));
            println!("Storage DSN: {}", config.source_dsn());
            println!("Poll interval: {:?}", config.poll_interval);
            println!("Codec: {:?}", config.codec);

            if config.archive_enabled() {
                println!(
                    "Archive: after {:?} to {} (prefix: {})",
                    config.archive_after.unwrap_or_default(),
                    config.archive_destination().unwrap_or_default(),
                    config.archive_prefix().unwrap_or("none")
                );
            } else {
                println!("Archive: disabled");
            }

            match &config.tracker_location {
                Some(location) => println!("Tracker location: {}", location.display()),
                None => println!("Tracker location: derived from bucket and prefix"),
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");
        config.validate().context("Invalid configuration")?;
        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle CLI commands that don't need the ingester.
    ///
    /// Returns true when the command was fully handled.
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                println!("Configuration is valid");
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start | CommonCommands::Once | CommonCommands::Status => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
