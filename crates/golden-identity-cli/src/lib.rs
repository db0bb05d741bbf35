//! Command surface for the golden identity engine.
//!
//! [`run_cli`] executes a parsed [`Cli`] against a `SQLite` store. Command
//! output is JSON on stdout; logs go to stderr through `tracing`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use golden_identity_core::{
    now_utc, parse_rfc3339_utc, CandidatePair, EngineConfig, GlobalCustomerId,
    IdentityInputRecord,
};
use golden_identity_store_sqlite::{
    parse_json_array, IntegrityCheck, IntegrityIssueSeverity, SqliteGoldenStore, Stage,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gid")]
#[command(about = "Golden customer identity resolution CLI")]
pub struct Cli {
    #[arg(long, default_value = "./golden_identity.sqlite3")]
    db: PathBuf,

    /// JSON engine configuration; defaults to the built-in v1 rules.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive. `RUST_LOG` takes precedence when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Import {
        #[command(subcommand)]
        command: ImportCommand,
    },
    Run(RunArgs),
    Show {
        #[command(subcommand)]
        command: ShowCommand,
    },
    Check(CheckArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ImportCommand {
    /// Replace staged identity inputs from a JSON array.
    Inputs(ImportArgs),
    /// Replace staged blocked pairs from a JSON array.
    Pairs(ImportArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(value_enum)]
    stage: StageArg,
    /// Pass timestamp (RFC3339, UTC). Defaults to the current time.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StageArg {
    Score,
    Resolve,
    Golden,
    History,
    Events,
    Conflicts,
    All,
}

#[derive(Debug, Subcommand)]
pub enum ShowCommand {
    Mapping(GlobalIdFilter),
    Candidates,
    Proposals,
    Retired,
    Golden(GlobalIdFilter),
    History(GlobalIdFilter),
    Events(GlobalIdFilter),
    Conflicts(GlobalIdFilter),
    Runs(RunsArgs),
}

#[derive(Debug, Args)]
pub struct GlobalIdFilter {
    #[arg(long)]
    global_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunsArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the built-in engine configuration.
    Default,
}

#[derive(Debug, Serialize)]
struct ImportReport {
    kind: &'static str,
    imported: usize,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store migration, or the
/// command fails, including a failed pipeline stage or an unhealthy check.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_level);

    if let Command::Config { command } = &cli.command {
        return run_config(command);
    }

    let config = load_config(cli.config.as_deref())?;
    let mut store = SqliteGoldenStore::open(&cli.db)?;
    store.migrate()?;
    debug!(db = %cli.db.display(), "store ready");

    match cli.command {
        Command::Import { command } => run_import(command, &mut store),
        Command::Run(args) => run_stage(&args, &config, &mut store),
        Command::Show { command } => run_show(command, &store),
        Command::Check(args) => run_check(&args, &store),
        Command::Config { command } => run_config(&command),
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A host that already installed a subscriber keeps it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::v1());
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    EngineConfig::from_json(&value)
        .with_context(|| format!("config file {} was rejected", path.display()))
}

fn run_import(command: ImportCommand, store: &mut SqliteGoldenStore) -> Result<()> {
    let report = match command {
        ImportCommand::Inputs(args) => {
            let raw = read_file(&args.file)?;
            let inputs: Vec<IdentityInputRecord> = parse_json_array(&raw, "identity input")?;
            ImportReport {
                kind: "inputs",
                imported: store.replace_identity_inputs(&inputs)?,
            }
        }
        ImportCommand::Pairs(args) => {
            let raw = read_file(&args.file)?;
            let pairs: Vec<CandidatePair> = parse_json_array(&raw, "blocked pair")?;
            ImportReport {
                kind: "pairs",
                imported: store.replace_blocked_pairs(&pairs)?,
            }
        }
    };

    print_json(&report)
}

fn run_stage(args: &RunArgs, config: &EngineConfig, store: &mut SqliteGoldenStore) -> Result<()> {
    let now = parse_optional_utc(args.now.as_deref())?;

    let stage = match args.stage {
        StageArg::Score => Stage::Score,
        StageArg::Resolve => Stage::Resolve,
        StageArg::Golden => Stage::Golden,
        StageArg::History => Stage::History,
        StageArg::Events => Stage::Events,
        StageArg::Conflicts => Stage::Conflicts,
        StageArg::All => {
            let report = store.run_pipeline(config, now)?;
            print_json(&report)?;
            return match report.failure {
                Some(failure) => Err(anyhow!(
                    "pipeline failed at stage {}: {}",
                    failure.stage.as_str(),
                    failure.error
                )),
                None => Ok(()),
            };
        }
    };

    let report = store.run_stage(stage, config, now)?;
    print_json(&report)
}

fn run_show(command: ShowCommand, store: &SqliteGoldenStore) -> Result<()> {
    match command {
        ShowCommand::Mapping(filter) => {
            print_json(&store.list_identity_map(parse_global_id(filter.global_id.as_deref())?)?)
        }
        ShowCommand::Candidates => print_json(&store.list_match_candidates()?),
        ShowCommand::Proposals => print_json(&store.list_merge_proposals()?),
        ShowCommand::Retired => print_json(&store.list_retired_ids()?),
        ShowCommand::Golden(filter) => {
            print_json(&store.list_golden_records(parse_global_id(filter.global_id.as_deref())?)?)
        }
        ShowCommand::History(filter) => {
            print_json(&store.list_history(parse_global_id(filter.global_id.as_deref())?)?)
        }
        ShowCommand::Events(filter) => {
            print_json(&store.list_change_events(parse_global_id(filter.global_id.as_deref())?)?)
        }
        ShowCommand::Conflicts(filter) => {
            print_json(&store.list_conflicts(parse_global_id(filter.global_id.as_deref())?)?)
        }
        ShowCommand::Runs(args) => print_json(&store.list_stage_runs(args.limit)?),
    }
}

fn run_check(args: &CheckArgs, store: &SqliteGoldenStore) -> Result<()> {
    let check = store.check_integrity()?;
    if args.json {
        print_json(&check)?;
    } else {
        print_integrity_check(&check);
    }

    if !check.healthy {
        return Err(anyhow!(
            "integrity check failed: {}",
            check
                .issues
                .iter()
                .filter(|item| item.severity == IntegrityIssueSeverity::Error)
                .map(|item| format!("{}:{}", item.code, item.message))
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }

    Ok(())
}

fn run_config(command: &ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Default => print_json(&EngineConfig::v1()),
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!(err.to_string())),
        None => Ok(now_utc()),
    }
}

fn parse_global_id(raw: Option<&str>) -> Result<Option<GlobalCustomerId>> {
    raw.map(GlobalCustomerId::parse)
        .transpose()
        .map_err(|err| anyhow!(err.to_string()))
}

fn print_integrity_check(check: &IntegrityCheck) {
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    for (table, count) in &check.table_counts {
        println!("{table}={count}");
    }
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    IntegrityIssueSeverity::Warning => "warning",
                    IntegrityIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }
}
