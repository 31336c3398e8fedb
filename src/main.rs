use prometheus::{Encoder, Registry, TextEncoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vanflow_collector::cli::{Cli, Commands, ConfigAction, OutputFormat};
use vanflow_collector::collector::{Collector, Ingest};
use vanflow_collector::config::{parse_duration, CollectorConfig, ConfigValidator};
use vanflow_collector::error::{CollectorError, Result};
use vanflow_collector::records::{ConnectionRecord, Record};
use vanflow_collector::store::indexers::TYPE_INDEX;
use vanflow_collector::store::Entry;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    match cli.command {
        Commands::Replay {
            file,
            settle,
            format,
        } => {
            cmd_replay(cli.config, &file, &settle, format)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose {
        "vanflow_collector=debug"
    } else {
        "vanflow_collector=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Summaries go to stdout, keep logs out of the way
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_replay(
    config_path: Option<PathBuf>,
    file: &Path,
    settle: &str,
    format: OutputFormat,
) -> Result<()> {
    let config = load_config(config_path)?;
    let settle = parse_duration(settle)?;
    let events = read_ingest_log(file)?;
    tracing::info!("Replaying {} events from {}", events.len(), file.display());

    let registry = Registry::new();
    let collector = Arc::new(Collector::new(config, &registry)?);

    let rt = tokio::runtime::Runtime::new().map_err(|e| CollectorError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })?;
    let output = rt.block_on(async {
        let cancel = CancellationToken::new();
        let running = tokio::spawn(collector.clone().run(cancel.clone()));

        for (line, event) in events {
            if let Err(e) = collector.ingest(event) {
                tracing::warn!("Skipping line {}: {}", line, e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settle) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, summarizing early");
            }
        }

        // Shutdown drops every flow, so summarize first
        let output = render_summary(&collector, &registry, format);
        cancel.cancel();
        if let Err(e) = running.await {
            tracing::error!("Collector task failed: {}", e);
        }
        output
    })?;

    print!("{}", output);
    Ok(())
}

/// Parse every non-empty line of an ingest log, keeping line numbers
fn read_ingest_log(file: &Path) -> Result<Vec<(usize, Ingest)>> {
    let content = std::fs::read_to_string(file).map_err(|e| CollectorError::Io {
        source: e,
        context: format!("Failed to read ingest log: {}", file.display()),
    })?;

    let mut events = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(line).map_err(|e| CollectorError::Json {
            source: e,
            context: format!("{}:{}", file.display(), idx + 1),
        })?;
        events.push((idx + 1, event));
    }
    Ok(events)
}

fn render_summary(collector: &Collector, registry: &Registry, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => {
            let mut out = String::new();
            for (kind, count) in collector.summary() {
                out.push_str(&format!("{:<24} {}\n", kind, count));
            }
            let (transport, app) = collector.connections().tracked_flows();
            out.push_str(&format!("\nTracked flows: {} transport, {} application\n", transport, app));
            out.push_str(&format!("Pending pairs: {}\n", collector.pairs().pending()));
            Ok(out)
        }
        OutputFormat::Json => {
            let connections: Vec<ConnectionRecord> = collector
                .records()
                .index(
                    TYPE_INDEX,
                    &Entry::exemplar(ConnectionRecord::default().into()),
                )
                .into_iter()
                .filter_map(|entry| match entry.record {
                    Record::Connection(connection) => Some(connection),
                    _ => None,
                })
                .collect();
            let summary = serde_json::json!({
                "records": collector.summary(),
                "connections": connections,
            });
            let mut out = serde_json::to_string_pretty(&summary).map_err(|e| CollectorError::Json {
                source: e,
                context: "Failed to serialize summary".to_string(),
            })?;
            out.push('\n');
            Ok(out)
        }
        OutputFormat::Prometheus => {
            let mut buffer = Vec::new();
            TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
            Ok(String::from_utf8_lossy(&buffer).into_owned())
        }
    }
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path)?;
            let value = toml::Value::try_from(&config)?;

            let shown = match section {
                Some(section) => value
                    .get(&section)
                    .cloned()
                    .ok_or_else(|| CollectorError::InvalidConfigValue {
                        path: section.clone(),
                        message: "No such section".to_string(),
                    })?,
                None => value,
            };
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => CollectorConfig::default_path()?,
            };
            let config = CollectorConfig::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            println!("  Source: {}", config.collector.source_ref());
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => CollectorConfig::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CollectorError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            CollectorConfig::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>) -> Result<CollectorConfig> {
    let path = match config_path {
        Some(path) => path,
        None => CollectorConfig::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'vanflow-collector config init' to create one."
        );
        let mut config = CollectorConfig::default();
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    CollectorConfig::load(&path)
}
