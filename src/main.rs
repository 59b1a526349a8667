use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use callkeep_settings::{load_settings_from_path, settings_path, CallkeepSettings, LoggingSettings};
use callkeep_telemetry::{init_telemetry, parse_level, LogQuery, SqliteLogSink, TelemetryConfig};

mod scenario;

use scenario::{JsonLinesHost, Scenario};

/// Call-service lifecycle orchestrator.
#[derive(Debug, Parser)]
#[command(name = "callkeep", version)]
struct Cli {
    /// Settings file. Defaults to `~/.callkeep/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a JSON scenario and print host reactions as JSON lines.
    Run {
        #[arg(long)]
        scenario: PathBuf,
    },
    /// Print the effective settings.
    CheckSettings,
    /// Print persisted warnings and errors as JSON lines, newest first.
    Logs {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        conversation_id: Option<String>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

fn telemetry_config(logging: &LoggingSettings) -> TelemetryConfig {
    let defaults = TelemetryConfig::default();
    let log_level = parse_level(&logging.level).unwrap_or_else(|| {
        eprintln!("unknown log level {:?}, using {}", logging.level, defaults.log_level);
        defaults.log_level
    });
    TelemetryConfig {
        log_level,
        json: logging.json,
        log_to_sqlite: logging.persist_warnings,
        log_db_path: logging.log_db_path.clone().unwrap_or(defaults.log_db_path),
        module_levels: logging
            .modules
            .iter()
            .filter_map(|(module, level)| match parse_level(level) {
                Some(level) => Some((module.clone(), level)),
                None => {
                    eprintln!("unknown log level {level:?} for {module}, ignored");
                    None
                }
            })
            .collect(),
    }
}

fn print_logs(sink: &SqliteLogSink, query: &LogQuery, out: &mut impl Write) -> anyhow::Result<usize> {
    let records = sink.query(query).context("querying persisted logs")?;
    for record in &records {
        serde_json::to_writer(&mut *out, record)?;
        writeln!(out)?;
    }
    Ok(records.len())
}

fn load(cli: &Cli) -> anyhow::Result<CallkeepSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    load_settings_from_path(&path).with_context(|| format!("loading settings from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    match cli.command {
        Command::CheckSettings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Run { scenario } => {
            let telemetry = init_telemetry(telemetry_config(&settings.logging))?;
            let scenario = Scenario::from_file(&scenario)?;
            tracing::info!(steps = scenario.steps.len(), "replaying scenario");

            let config = callkeep_service::engine_config(&settings.orchestrator);
            let host = Arc::new(JsonLinesHost::new(std::io::stdout()));
            scenario::run(scenario, config, host).await?;

            match telemetry.logs().map(SqliteLogSink::count).transpose() {
                Ok(Some(persisted)) => tracing::info!(persisted, "scenario finished"),
                Ok(None) => tracing::info!("scenario finished"),
                Err(e) => tracing::info!(error = %e, "scenario finished, log count unavailable"),
            }
        }
        Command::Logs {
            user_id,
            conversation_id,
            level,
            limit,
        } => {
            let mut config = telemetry_config(&settings.logging);
            config.log_to_sqlite = true;
            let telemetry = init_telemetry(config)?;
            let Some(sink) = telemetry.logs() else {
                anyhow::bail!("log database could not be opened");
            };
            let query = LogQuery {
                level,
                user_id,
                conversation_id,
                limit: Some(limit),
                ..LogQuery::default()
            };
            print_logs(sink, &query, &mut std::io::stdout().lock())?;
        }
    }
    Ok(())
}
