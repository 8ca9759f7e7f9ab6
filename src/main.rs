use anyhow::Result;
use clap::{Parser, Subcommand};
use anyhow::Context;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claimfleet::config::{Config, LoggingConfig};

mod commands;

#[derive(Parser)]
#[command(
    name = "claimfleet",
    version,
    about = "Operator tools for the claimfleet scheduler",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json), overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Config file supplying the logging section
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the jobs stored in a session file
    Inspect {
        /// Session file path
        #[arg(short, long, default_value = "data/session_state.json")]
        session: PathBuf,

        /// Number of rotated backups to fall back on
        #[arg(long, default_value = "3")]
        backups: usize,

        /// Heartbeat file to report on
        #[arg(long)]
        heartbeat: Option<PathBuf>,

        /// Print the queue as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Classify a failure and show the recovery plan
    Classify {
        /// HTTP status code
        #[arg(short, long)]
        status: Option<u16>,

        /// Error message text
        #[arg(short, long)]
        message: Option<String>,

        /// Page content excerpt
        #[arg(short, long)]
        content: Option<String>,

        /// Retry count before this failure
        #[arg(short, long, default_value = "0")]
        retry_count: u32,
    },

    /// Validate a TOML configuration file
    CheckConfig {
        /// Config file path
        #[arg(default_value = "claimfleet.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = Config::load(cli.config.as_deref())?.logging;
    if let Some(format) = cli.log_format.clone() {
        logging.format = format;
    }
    if cli.verbose {
        logging.level = String::from("debug");
    }

    // Initialize tracing/logging
    setup_tracing(&logging)?;

    match cli.command {
        Commands::Inspect {
            session,
            backups,
            heartbeat,
            json,
        } => {
            tracing::debug!(
                session = %session.display(),
                backups = %backups,
                "Starting inspect command"
            );
            commands::inspect(session, backups, heartbeat, json)?;
        }

        Commands::Classify {
            status,
            message,
            content,
            retry_count,
        } => {
            tracing::debug!(status = ?status, retry_count = %retry_count, "Starting classify command");
            commands::classify(status, message, content, retry_count)?;
        }

        Commands::CheckConfig { path } => {
            tracing::debug!(path = %path.display(), "Starting check-config command");
            commands::check_config(&path)?;
        }
    }

    Ok(())
}

/// Filter directive: our crate at the configured level, dependencies at warn
fn filter_directive(level: &str) -> String {
    format!("claimfleet={level},warn")
}

fn setup_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(filter_directive(&logging.level))
        .with_context(|| format!("Invalid log level '{}'", logging.level))?;

    match logging.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        "text" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
        other => anyhow::bail!("Unknown log format '{other}' (expected text or json)"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_follows_level() {
        assert_eq!(filter_directive("debug"), "claimfleet=debug,warn");
        assert!(tracing_subscriber::EnvFilter::try_new(filter_directive("info")).is_ok());
    }

    #[test]
    fn test_cli_overrides_parse() {
        let cli = Cli::parse_from([
            "claimfleet",
            "--log-format",
            "json",
            "--config",
            "fleet.toml",
            "classify",
            "-s",
            "429",
        ]);
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert_eq!(cli.config, Some(PathBuf::from("fleet.toml")));
    }
}
