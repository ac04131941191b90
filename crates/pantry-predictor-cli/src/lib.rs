//! Operator command surface for the consumption cycle predictor.
//!
//! Host tooling should embed predictor operations through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//!
//! Every command prints one JSON document on stdout.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use pantry_predictor_core::{format_timestamp, now_utc, parse_timestamp, EventInput};
use pantry_predictor_store_sqlite::SqlitePredictorStore;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "pantry-predictor")]
#[command(about = "Consumption cycle predictor CLI")]
pub struct Cli {
    #[arg(long, default_value = "./pantry_predictor.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply schema migrations and seed the canonical category priors.
    Migrate,
    /// Submit one household event.
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    /// Read the current forecast for a key without mutating state.
    Forecast(ForecastArgs),
    /// Reinitialise a key from its category prior.
    Reset(KeyArgs),
    /// Run the daily anniversary reconciliation sweep.
    WeeklyTick(WeeklyTickArgs),
    /// Recompute decayed forecasts for every key of a household.
    RefreshForecasts(RefreshForecastsArgs),
    /// Rebuild every state row from the event log.
    Replay,
    Projector {
        #[command(subcommand)]
        command: Box<ProjectorCommand>,
    },
    /// List the event log for a key.
    Events(EventsArgs),
    /// Show the stored predictor state for a key.
    State(KeyArgs),
    /// List forecast snapshots for a key.
    Forecasts(EventsArgs),
    /// Tombstone a key after external household/product deletion.
    DeleteKey(KeyArgs),
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Purchase(EventArgs),
    Repurchase(EventArgs),
    Empty(EventArgs),
    Trash(TrashArgs),
    Feedback(FeedbackArgs),
    Consume(ConsumeArgs),
    ManualSet(ManualSetArgs),
}

#[derive(Debug, Args)]
pub struct EventArgs {
    #[arg(long)]
    household: String,
    #[arg(long)]
    product: String,
    #[arg(long)]
    category: Option<String>,
    /// Event timestamp (RFC3339; defaults to now).
    #[arg(long)]
    at: Option<String>,
    /// Caller idempotency key (defaults to a fresh ULID).
    #[arg(long)]
    idempotency_key: Option<String>,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
pub struct TrashArgs {
    #[command(flatten)]
    event: EventArgs,
    /// TASTE, EXPIRED, RAN_OUT, or OTHER.
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
pub struct FeedbackArgs {
    #[command(flatten)]
    event: EventArgs,
    /// Any UI spelling: MORE/LESS, up/down, "Will Last More"/"Will Last Less".
    #[arg(long)]
    direction: String,
}

#[derive(Debug, Args)]
pub struct ConsumeArgs {
    #[command(flatten)]
    event: EventArgs,
    #[arg(long)]
    delta_days: Option<f64>,
    #[arg(long)]
    ratio: Option<f64>,
}

#[derive(Debug, Args)]
pub struct ManualSetArgs {
    #[command(flatten)]
    event: EventArgs,
    #[arg(long)]
    days_left: f64,
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    #[arg(long)]
    household: String,
    #[arg(long)]
    product: String,
}

#[derive(Debug, Args)]
pub struct ForecastArgs {
    #[command(flatten)]
    key: KeyArgs,
    /// Forecast as of this timestamp (defaults to now).
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct WeeklyTickArgs {
    /// Sweep as of this timestamp (defaults to now). Idempotent per UTC day.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct RefreshForecastsArgs {
    #[arg(long)]
    household: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ProjectorCommand {
    Status,
    Check,
}

/// Runs a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the database cannot be opened or the command fails;
/// rejection codes from the predictor surface as `code: message`.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Runs one command against the store at `db`.
///
/// # Errors
/// See [`run_cli`].
pub fn run_command_with_db(db: &Path, command: Command) -> Result<()> {
    let mut store = SqlitePredictorStore::open(db)?;
    store.migrate()?;

    match command {
        Command::Migrate => {
            print_json(&serde_json::json!({ "status": "migrated" }))?;
        }
        Command::Event { command } => {
            let input = event_input_from_command(*command)?;
            let receipt = store
                .submit_event(&input)
                .map_err(|err| anyhow!("{}: {err}", err.code()))?;
            print_json(&receipt)?;
        }
        Command::Forecast(args) => {
            let at = args.at.as_deref().map(parse_timestamp).transpose()?;
            let forecast = store
                .forecast(&args.key.household, &args.key.product, at)
                .map_err(|err| anyhow!("{}: {err}", err.code()))?;
            print_json(&forecast)?;
        }
        Command::Reset(args) => {
            let receipt = store
                .reset(&args.household, &args.product)
                .map_err(|err| anyhow!("{}: {err}", err.code()))?;
            print_json(&receipt)?;
        }
        Command::WeeklyTick(args) => {
            let now = match args.now.as_deref() {
                Some(raw) => parse_timestamp(raw)?,
                None => now_utc(),
            };
            let report = store.run_weekly_tick(now)?;
            print_json(&report)?;
        }
        Command::RefreshForecasts(args) => {
            let at = match args.at.as_deref() {
                Some(raw) => parse_timestamp(raw)?,
                None => now_utc(),
            };
            let refreshed = store.refresh_forecasts(&args.household, at)?;
            print_json(&serde_json::json!({ "household_id": args.household, "refreshed": refreshed }))?;
        }
        Command::Replay => {
            let report = store.replay()?;
            print_json(&report)?;
        }
        Command::Projector { command } => match *command {
            ProjectorCommand::Status => print_json(&store.projector_status()?)?,
            ProjectorCommand::Check => print_json(&store.projector_check()?)?,
        },
        Command::Events(args) => {
            let entries =
                store.list_events_for_key(&args.key.household, &args.key.product, args.limit)?;
            print_json(&entries)?;
        }
        Command::State(args) => {
            let snapshot = store
                .get_state(&args.household, &args.product)?
                .ok_or_else(|| anyhow!("unknown_entity: no predictor state for {}:{}", args.household, args.product))?;
            print_json(&snapshot)?;
        }
        Command::Forecasts(args) => {
            let rows = store.list_forecasts_for_key(
                &args.key.household,
                &args.key.product,
                args.limit,
            )?;
            print_json(&rows)?;
        }
        Command::DeleteKey(args) => {
            let removed = store.delete_key(&args.household, &args.product)?;
            print_json(&serde_json::json!({
                "household_id": args.household,
                "product_id": args.product,
                "removed_state": removed
            }))?;
        }
    }

    Ok(())
}

fn event_input_from_command(command: EventCommand) -> Result<EventInput> {
    let (base, kind, reason, direction, delta_days, ratio, days_left_target) = match command {
        EventCommand::Purchase(args) => (args, "purchase", None, None, None, None, None),
        EventCommand::Repurchase(args) => (args, "repurchase", None, None, None, None, None),
        EventCommand::Empty(args) => (args, "empty", None, None, None, None, None),
        EventCommand::Trash(args) => {
            (args.event, "trash", Some(args.reason), None, None, None, None)
        }
        EventCommand::Feedback(args) => {
            (args.event, "adjust_feedback", None, Some(args.direction), None, None, None)
        }
        EventCommand::Consume(args) => {
            (args.event, "consume", None, None, args.delta_days, args.ratio, None)
        }
        EventCommand::ManualSet(args) => {
            (args.event, "manual_set", None, None, None, None, Some(args.days_left))
        }
    };

    let timestamp = match base.at.as_deref() {
        Some(raw) => {
            // normalise up front so the stored payload is canonical
            format_timestamp(parse_timestamp(raw)?).map_err(|err| anyhow!(err.to_string()))?
        }
        None => format_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
    };

    Ok(EventInput {
        idempotency_key: base.idempotency_key.unwrap_or_else(|| Ulid::new().to_string()),
        household_id: base.household,
        product_id: base.product,
        category_id: base.category,
        timestamp,
        kind: kind.to_string(),
        reason,
        direction,
        delta_days,
        ratio,
        days_left_target,
        note: base.note,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{body}");
    Ok(())
}
