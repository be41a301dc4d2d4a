//! CLI for leselern.
//!
//! Exposes strategy selection, signal recording, model maintenance and
//! action ingestion over a local SQLite database. Results go to stdout as
//! JSON; logs go to stderr.

mod ingest;
mod simulate;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use ingest::{IngestMode, IngestState, IngestSummary};
use leselern_bandits::SqliteBackend;
use leselern_core::Context;
use leselern_feedback::{ActionType, EngineConfig, RecommendationEngine, SqliteSignalLog};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SQLite database holding models and signals
    #[arg(long, env = "LESELERN_DB", default_value = "data/leselern.db", global = true)]
    db: PathBuf,

    /// Engine configuration (JSON); missing fields use defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct ContextArgs {
    #[arg(long)]
    mood: Option<String>,
    #[arg(long)]
    situation: Option<String>,
    #[arg(long)]
    goal: Option<String>,
    /// morning, afternoon, evening or night
    #[arg(long)]
    time_of_day: Option<String>,
    /// 0 = Sunday
    #[arg(long)]
    day_of_week: Option<u8>,
}

impl From<ContextArgs> for Context {
    fn from(args: ContextArgs) -> Self {
        Context {
            mood: args.mood,
            situation: args.situation,
            goal: args.goal,
            time_of_day: args.time_of_day,
            day_of_week: args.day_of_week,
            custom_text: None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Engine(EngineCommand),
    /// Run synthetic traffic against an in-memory engine
    Simulate {
        #[arg(long, default_value = "3")]
        identities: u32,
        #[arg(long, default_value = "500")]
        rounds: u32,
        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

/// Commands that operate on the SQLite-backed engine.
#[derive(Subcommand)]
enum EngineCommand {
    /// Pick the recommendation strategy for a reader in a context
    Select {
        #[arg(long)]
        identity: String,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Record that a book was shown under a strategy
    Impression {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        book: String,
        #[arg(long)]
        arm: String,
        #[arg(long, default_value = "1")]
        rank: u32,
        #[arg(long, default_value = "0")]
        score: f64,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Record a reader action and attribute it to recent impressions
    Action {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        book: String,
        /// click, save, unsave, rate, engaged_view, dismiss or share
        #[arg(long = "type")]
        action_type: ActionType,
        /// Rating for `rate`
        #[arg(long)]
        value: Option<f64>,
    },
    /// Apply a reward to one strategy directly
    Update {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        arm: String,
        #[arg(long, allow_hyphen_values = true)]
        reward: f64,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Show per-strategy learning state of a reader
    Stats {
        #[arg(long)]
        identity: String,
    },
    /// Move models and signals of an anonymous identity to an authenticated one
    Migrate {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Delete learned models of a reader
    Reset {
        #[arg(long)]
        identity: String,
        /// Only this strategy
        #[arg(long)]
        arm: Option<String>,
    },
    /// Attribute actions in a time window to still unattributed impressions
    Reprocess {
        /// RFC 3339 start (default: lookback before --to)
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 end (default: now)
        #[arg(long)]
        to: Option<String>,
    },
    /// Ingest reader actions from a file or an HTTP feed
    Ingest {
        #[command(subcommand)]
        source: IngestSource,
    },
}

#[derive(Subcommand)]
enum IngestSource {
    /// Ingest from an HTTP action feed
    Http {
        /// Feed base URL
        #[arg(long, env = "LESELERN_FEED_URL")]
        url: String,

        /// Explicit cursor start - overrides state
        #[arg(long)]
        cursor: Option<u64>,

        /// Limit of events to fetch per batch
        #[arg(long, default_value = "100")]
        limit: u32,

        /// Maximum number of batches to consume in one run
        #[arg(long, default_value = "10")]
        max_batches: u32,

        /// Path to the state file
        #[arg(long, default_value = "data/leselern.ingest.http.state.json")]
        state_file: PathBuf,
    },
    /// Ingest from a local JSONL file
    File {
        /// Input file path
        #[arg(long)]
        path: PathBuf,

        /// Start from line number (0-based)
        #[arg(long)]
        line_offset: Option<u64>,

        /// Path to the state file
        #[arg(long, default_value = "data/leselern.ingest.file.state.json")]
        state_file: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

fn open_engine(db: &Path, config: EngineConfig) -> Result<RecommendationEngine> {
    let backend = SqliteBackend::open(db)
        .with_context(|| format!("Failed to open model store {}", db.display()))?;
    let signals = SqliteSignalLog::open(db)
        .with_context(|| format!("Failed to open signal log {}", db.display()))?;
    Ok(RecommendationEngine::builder(config).build(Arc::new(backend), Arc::new(signals))?)
}

fn parse_time(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).with_context(|| format!("Invalid RFC 3339 time '{raw}'"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImpressionRecorded {
    impression_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetResult {
    removed: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            identities,
            rounds,
            seed,
        } => print_json(&simulate::run(config, identities, rounds, seed)?),
        Commands::Engine(command) => {
            let lookback = config.attribution.lookback();
            let engine = open_engine(&cli.db, config)?;
            run_engine_command(&engine, command, lookback)
        }
    }
}

fn run_engine_command(
    engine: &RecommendationEngine,
    command: EngineCommand,
    lookback: time::Duration,
) -> Result<()> {
    match command {
        EngineCommand::Select { identity, context } => {
            print_json(&engine.select_strategy(&context.into(), &identity))
        }
        EngineCommand::Impression {
            identity,
            book,
            arm,
            rank,
            score,
            context,
        } => {
            let impression_id =
                engine.record_impression(&identity, &book, &context.into(), &arm, rank, score)?;
            print_json(&ImpressionRecorded { impression_id })
        }
        EngineCommand::Action {
            identity,
            book,
            action_type,
            value,
        } => print_json(&engine.record_action(&identity, &book, action_type, value)?),
        EngineCommand::Update {
            identity,
            arm,
            reward,
            context,
        } => print_json(&engine.update_model(&arm, &context.into(), reward, &identity)?),
        EngineCommand::Stats { identity } => print_json(&engine.get_stats(&identity)),
        EngineCommand::Migrate { from, to } => print_json(&engine.migrate_identity(&from, &to)?),
        EngineCommand::Reset { identity, arm } => {
            let removed = engine.reset(&identity, arm.as_deref())?;
            print_json(&ResetResult { removed })
        }
        EngineCommand::Reprocess { from, to } => {
            let to = match to {
                Some(raw) => parse_time(&raw)?,
                None => OffsetDateTime::now_utc(),
            };
            let from = match from {
                Some(raw) => parse_time(&raw)?,
                None => to - lookback,
            };
            if from > to {
                anyhow::bail!("--from must not be after --to");
            }
            print_json(&engine.reprocess(from, to)?)
        }
        EngineCommand::Ingest { source } => print_json(&run_ingest(engine, source)?),
    }
}

fn run_ingest(engine: &RecommendationEngine, source: IngestSource) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    match source {
        IngestSource::Http {
            url,
            cursor,
            limit,
            max_batches,
            state_file,
        } => {
            let token = std::env::var("LESELERN_FEED_TOKEN").ok();
            let mut current_cursor = cursor.unwrap_or(0);

            if cursor.is_none() {
                if let Ok(Some(state)) = IngestState::load(&state_file, IngestMode::Http) {
                    current_cursor = state.cursor;
                    info!(cursor = current_cursor, "resuming from state cursor");
                }
            }

            loop {
                if summary.batches >= max_batches {
                    info!(max_batches, "max batches reached");
                    break;
                }
                let fetched = ingest::fetch_http(
                    &url,
                    Some(current_cursor),
                    limit,
                    token.as_deref(),
                    OffsetDateTime::now_utc(),
                );
                let has_more = ingest::process_ingest(
                    engine,
                    fetched,
                    &state_file,
                    &mut current_cursor,
                    IngestMode::Http,
                    &mut summary,
                )?;
                if !has_more {
                    break;
                }
            }
            summary.cursor = current_cursor;
        }
        IngestSource::File {
            path,
            line_offset,
            state_file,
        } => {
            let mut current_cursor = line_offset.unwrap_or(0);

            if line_offset.is_none() {
                if let Ok(Some(state)) = IngestState::load(&state_file, IngestMode::File) {
                    current_cursor = state.cursor;
                    info!(cursor = current_cursor, "resuming from file offset");
                }
            }

            ingest::process_ingest(
                engine,
                ingest::fetch_file(&path, current_cursor, OffsetDateTime::now_utc()),
                &state_file,
                &mut current_cursor,
                IngestMode::File,
                &mut summary,
            )?;
            summary.cursor = current_cursor;
        }
    }
    Ok(summary)
}
