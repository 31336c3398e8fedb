//! CLI command definitions and parsing
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vanflow-collector",
    version,
    author = "neur0map",
    about = "Correlates vanflow topology and biflow records into connections and metrics",
    long_about = "vanflow-collector keeps an indexed view of the application network topology, \
                  resolves both endpoints of every transport and application flow, and publishes \
                  the resulting connection records and traffic metrics."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/vanflow-collector/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Feed a JSON-lines ingest log through a collector and summarize the result
    Replay {
        /// Ingest log, one `{"op": ...}` object per line
        file: PathBuf,

        /// How long to let background reconciliation run after the last line
        #[arg(short, long, default_value = "5s")]
        settle: String,

        /// Output format for the summary
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Record counts per type
    Text,
    /// Record counts and every derived connection as JSON
    Json,
    /// Prometheus text exposition of the collector metrics
    Prometheus,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_replay_defaults() {
        let cli = Cli::parse_from(["vanflow-collector", "replay", "events.jsonl"]);
        match cli.command {
            Commands::Replay {
                file,
                settle,
                format,
            } => {
                assert_eq!(file, PathBuf::from("events.jsonl"));
                assert_eq!(settle, "5s");
                assert_eq!(format, OutputFormat::Text);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_replay_prometheus_format() {
        let cli = Cli::parse_from([
            "vanflow-collector",
            "replay",
            "events.jsonl",
            "--format",
            "prometheus",
            "--settle",
            "500ms",
        ]);
        assert!(matches!(
            cli.command,
            Commands::Replay {
                format: OutputFormat::Prometheus,
                ..
            }
        ));
    }
}
