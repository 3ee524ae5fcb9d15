//! Command surface for the review scheduler.
//!
//! Hosts can embed the scheduler through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for a single [`Command`] against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteReviewProcessor`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use review_scheduler_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AuditPolicy, ItemId, Ladder, LadderConfig,
    LearnerId, Outcome, PairKey, ProcessorOptions, ProgressRecord, ReviewProcessor,
    ReviewSubmission,
};
use review_scheduler_store_sqlite::{SqliteReviewStore, SqliteStoreOptions};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

pub type SqliteReviewProcessor =
    ReviewProcessor<Arc<SqliteReviewStore>, Arc<SqliteReviewStore>>;

#[derive(Debug, Parser)]
#[command(name = "srs")]
#[command(about = "Spaced-repetition review scheduler")]
pub struct Cli {
    #[arg(long, default_value = "./review_scheduler.sqlite3")]
    db: PathBuf,

    /// Ladder configuration JSON; the standard ladder is used when absent.
    #[arg(long)]
    ladder: Option<PathBuf>,

    #[arg(long, default_value_t = 5_000)]
    lock_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    busy_timeout_ms: u64,

    #[arg(long, value_enum, default_value_t = AuditPolicyArg::BestEffort)]
    audit_policy: AuditPolicyArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Track(TrackArgs),
    Untrack(PairArgs),
    Review(ReviewArgs),
    Preview(PreviewArgs),
    Due(DueArgs),
    Progress {
        #[command(subcommand)]
        command: Box<ProgressCommand>,
    },
    Summary(SummaryArgs),
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Ladder {
        #[command(subcommand)]
        command: Box<LadderCommand>,
    },
}

#[derive(Debug, Args)]
pub struct PairArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    item: String,
}

#[derive(Debug, Args)]
pub struct TrackArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReviewArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    outcome: OutcomeArg,
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct DueArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    now: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Debug, Subcommand)]
pub enum ProgressCommand {
    Show(PairArgs),
}

#[derive(Debug, Args)]
pub struct SummaryArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    learner: String,
    /// Restrict to one item; all of the learner's events otherwise.
    #[arg(long)]
    item: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum LadderCommand {
    Show(LadderShowArgs),
}

#[derive(Debug, Args)]
pub struct LadderShowArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    Correct,
    Incorrect,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AuditPolicyArg {
    BestEffort,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

/// Everything a command needs besides the database path.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub ladder: Ladder,
    pub processor: ProcessorOptions,
    pub store: SqliteStoreOptions,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            ladder: Ladder::standard(),
            processor: ProcessorOptions::default(),
            store: SqliteStoreOptions::default(),
        }
    }
}

impl RunSettings {
    /// Resolves global flags, loading and validating the ladder file if given.
    ///
    /// # Errors
    /// Returns an error when the ladder file cannot be read or is invalid.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Ok(Self {
            ladder: load_ladder(cli.ladder.as_deref())?,
            processor: ProcessorOptions {
                lock_timeout: Duration::from_millis(cli.lock_timeout_ms),
                audit_policy: match cli.audit_policy {
                    AuditPolicyArg::BestEffort => AuditPolicy::BestEffort,
                    AuditPolicyArg::Required => AuditPolicy::Required,
                },
            },
            store: SqliteStoreOptions {
                busy_timeout: Duration::from_millis(cli.busy_timeout_ms),
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct UntrackReport {
    learner_id: LearnerId,
    item_id: ItemId,
    removed: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when settings resolution, store setup, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = RunSettings::from_cli(&cli)?;
    run_command_with_db(&cli.db, cli.command, &settings)
}

/// Executes one command using the provided `SQLite` DB path.
///
/// `ladder show` never touches the database.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, command: Command, settings: &RunSettings) -> Result<()> {
    if let Command::Ladder { command } = command {
        return run_ladder(*command, &settings.ladder);
    }

    let store = Arc::new(SqliteReviewStore::open_with_options(db_path, settings.store)?);
    store.migrate()?;
    debug!(
        db = %db_path.display(),
        ladder_version = settings.ladder.version(),
        "review store opened"
    );
    let processor = ReviewProcessor::with_options(
        settings.ladder.clone(),
        Arc::clone(&store),
        Arc::clone(&store),
        settings.processor,
    );
    run_command(command, &processor)
}

/// Executes one command against an existing processor.
///
/// # Errors
/// Returns an error when argument parsing, validation, or persistence fails.
pub fn run_command(command: Command, processor: &SqliteReviewProcessor) -> Result<()> {
    match command {
        Command::Track(args) => {
            let (learner_id, item_id) = parse_pair(&args.pair)?;
            let now = parse_optional_utc(args.now.as_deref())?;
            let record = processor.track(learner_id, item_id, now)?;
            print_json(&record)
        }
        Command::Untrack(args) => {
            let (learner_id, item_id) = parse_pair(&args)?;
            let removed = processor.untrack(learner_id, item_id)?;
            print_json(&UntrackReport {
                learner_id,
                item_id,
                removed,
            })
        }
        Command::Review(args) => {
            let (learner_id, item_id) = parse_pair(&args.pair)?;
            let submission = ReviewSubmission {
                learner_id,
                item_id,
                outcome: map_outcome(args.outcome),
                response_latency_ms: args.latency_ms,
                now: parse_optional_utc(args.now.as_deref())?,
            };
            let record = processor.submit(&submission)?;
            print_json(&record)
        }
        Command::Preview(args) => {
            let (learner_id, item_id) = parse_pair(&args.pair)?;
            let as_of = parse_optional_utc(args.as_of.as_deref())?;
            print_json(&processor.preview(learner_id, item_id, as_of)?)
        }
        Command::Due(args) => {
            let learner_id = parse_learner(&args.learner)?;
            let now = parse_optional_utc(args.now.as_deref())?;
            let due = processor.due_items(learner_id, now, args.limit)?;
            match args.format {
                OutputFormat::Json => print_json(&due),
                OutputFormat::Table => print_due_table(now, &due),
            }
        }
        Command::Progress { command } => match *command {
            ProgressCommand::Show(args) => {
                let (learner_id, item_id) = parse_pair(&args)?;
                print_json(&processor.progress(learner_id, item_id)?)
            }
        },
        Command::Summary(args) => {
            let learner_id = parse_learner(&args.learner)?;
            let as_of = parse_optional_utc(args.as_of.as_deref())?;
            print_json(&processor.summary(learner_id, as_of)?)
        }
        Command::Events { command } => run_events(*command, processor.store()),
        Command::Ladder { command } => run_ladder(*command, processor.ladder()),
    }
}

fn run_events(command: EventsCommand, store: &SqliteReviewStore) -> Result<()> {
    match command {
        EventsCommand::List(args) => {
            let learner_id = parse_learner(&args.learner)?;
            let events = match args.item.as_deref() {
                Some(raw) => store.list_events(PairKey::new(learner_id, parse_item(raw)?), args.limit)?,
                None => store.list_learner_events(learner_id, args.limit)?,
            };
            print_json(&events)
        }
    }
}

fn run_ladder(command: LadderCommand, ladder: &Ladder) -> Result<()> {
    match command {
        LadderCommand::Show(args) => match args.format {
            OutputFormat::Json => print_json(&ladder.to_config()),
            OutputFormat::Table => {
                print_ladder_table(ladder);
                Ok(())
            }
        },
    }
}

fn load_ladder(path: Option<&Path>) -> Result<Ladder> {
    let Some(path) = path else {
        return Ok(Ladder::standard());
    };

    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read ladder file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("ladder file {} must be valid JSON", path.display()))?;
    let config = LadderConfig::from_json(&value)
        .with_context(|| format!("invalid ladder file {}", path.display()))?;
    Ok(Ladder::from_config(&config)?)
}

fn parse_pair(args: &PairArgs) -> Result<(LearnerId, ItemId)> {
    Ok((parse_learner(&args.learner)?, parse_item(&args.item)?))
}

fn parse_learner(raw: &str) -> Result<LearnerId> {
    LearnerId::parse(raw).with_context(|| format!("invalid --learner value: {raw}"))
}

fn parse_item(raw: &str) -> Result<ItemId> {
    ItemId::parse(raw).with_context(|| format!("invalid --item value: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn map_outcome(value: OutcomeArg) -> Outcome {
    match value {
        OutcomeArg::Correct => Outcome::Correct,
        OutcomeArg::Incorrect => Outcome::Incorrect,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_due_table(as_of: OffsetDateTime, records: &[ProgressRecord]) -> Result<()> {
    println!("as_of: {}", format_rfc3339(as_of)?);
    println!(
        "{:<26} {:<16} {:<30} {:>7} {:>9}",
        "item_id", "level", "next_review_at", "correct", "incorrect"
    );
    println!("{}", "-".repeat(92));

    for record in records {
        println!(
            "{:<26} {:<16} {:<30} {:>7} {:>9}",
            record.item_id,
            record.level.as_str(),
            format_rfc3339(record.next_review_at)?,
            record.correct_total,
            record.incorrect_total
        );
    }
    Ok(())
}

fn print_ladder_table(ladder: &Ladder) {
    println!("ladder_version: {}", ladder.version());
    println!(
        "{:<16} {:<14} {:>9} {:>9} {:<16}",
        "level", "tier", "interval", "threshold", "demote_to"
    );
    println!("{}", "-".repeat(68));

    for rule in ladder.rules() {
        println!(
            "{:<16} {:<14} {:>9} {:>9} {:<16}",
            rule.level.as_str(),
            rule.level.tier().as_str(),
            format_interval(rule.interval_seconds),
            rule.advance_threshold,
            rule.demote_to.as_str()
        );
    }
}

fn format_interval(seconds: i64) -> String {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    if seconds % DAY == 0 {
        format!("{}d", seconds / DAY)
    } else if seconds % HOUR == 0 {
        format!("{}h", seconds / HOUR)
    } else if seconds % MINUTE == 0 {
        format!("{}m", seconds / MINUTE)
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_scheduler_core::{Level, ProgressStore};
    use serde_json::json;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(std::iter::once("srs").chain(args.iter().copied()))?;
        run_cli(cli)
    }

    fn temp_path(label: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("srs-{label}-{}.{extension}", Ulid::new()))
    }

    fn write_config(path: &Path, config: &LadderConfig) {
        let body = match serde_json::to_string(config) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode ladder: {err}"),
        };
        if let Err(err) = fs::write(path, body) {
            panic!("failed to write {}: {err}", path.display());
        }
    }

    const LEARNER: &str = "01J0SQQP7M70P6Y3R4T8D8G8M2";
    const ITEM: &str = "01J0SQQP7M70P6Y3R4T8D8G8M3";

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        let value = parse_optional_utc(Some("2026-02-07T12:00:00+02:00"));
        assert!(value.is_err());
    }

    #[test]
    fn interval_labels_use_largest_whole_unit() {
        assert_eq!(format_interval(4 * 3_600), "4h");
        assert_eq!(format_interval(120 * 86_400), "120d");
        assert_eq!(format_interval(90), "90s");
        assert_eq!(format_interval(1_800), "30m");
    }

    #[test]
    fn missing_ladder_flag_uses_standard_ladder() {
        assert_eq!(must(load_ladder(None)), Ladder::standard());
    }

    #[test]
    fn ladder_file_is_validated() {
        let path = temp_path("ladder", "json");
        let mut config = LadderConfig::standard();
        config.levels[1].interval_seconds = 86_400;
        config.levels[2].interval_seconds = 2 * 86_400;
        write_config(&path, &config);
        let ladder = must(load_ladder(Some(&path)));
        assert_eq!(ladder.rule(Level::Learning1).interval_seconds, 86_400);

        config.levels[3].interval_seconds = 0;
        write_config(&path, &config);
        let err = match load_ladder(Some(&path)) {
            Ok(_) => panic!("expected invalid ladder"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("interval_seconds"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn settings_map_global_flags() {
        let cli = must(
            Cli::try_parse_from([
                "srs",
                "--lock-timeout-ms",
                "250",
                "--busy-timeout-ms",
                "750",
                "--audit-policy",
                "required",
                "ladder",
                "show",
            ])
            .map_err(Into::into),
        );
        let settings = must(RunSettings::from_cli(&cli));
        assert_eq!(settings.processor.lock_timeout, Duration::from_millis(250));
        assert_eq!(settings.processor.audit_policy, AuditPolicy::Required);
        assert_eq!(settings.store.busy_timeout, Duration::from_millis(750));
    }

    #[test]
    fn ladder_show_does_not_create_database() {
        let db_path = temp_path("ladder-only", "sqlite3");
        let db = db_path.to_string_lossy().to_string();
        must(execute_cli(&["--db", &db, "ladder", "show", "--format", "table"]));
        assert!(!db_path.exists());
    }

    #[test]
    fn track_review_and_show_round_trip_through_sqlite() {
        let db_path = temp_path("flow", "sqlite3");
        let db = db_path.to_string_lossy().to_string();

        must(execute_cli(&[
            "--db", &db, "track", "--learner", LEARNER, "--item", ITEM, "--now",
            "2026-02-07T12:00:00Z",
        ]));
        must(execute_cli(&[
            "--db", &db, "review", "--learner", LEARNER, "--item", ITEM, "--outcome", "correct",
            "--latency-ms", "1500", "--now", "2026-02-07T16:00:00Z",
        ]));

        let store = must(SqliteReviewStore::open(&db_path));
        let key = PairKey::new(must(parse_learner(LEARNER)), must(parse_item(ITEM)));
        let record = match store.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => panic!("record should be tracked"),
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(record.level, Level::Learning1);
        let reviewed_at = must(parse_optional_utc(Some("2026-02-07T16:00:00Z")));
        assert_eq!(record.last_reviewed_at, Some(reviewed_at));
        assert_eq!(
            must(serde_json::to_value(&record).map_err(Into::into))["next_review_at"],
            json!("2026-02-08T00:00:00Z")
        );
        drop(store);

        let err = execute_cli(&[
            "--db", &db, "track", "--learner", LEARNER, "--item", ITEM,
        ]);
        assert!(err.is_err());

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn review_of_untracked_item_fails() {
        let db_path = temp_path("untracked", "sqlite3");
        let db = db_path.to_string_lossy().to_string();
        let err = match execute_cli(&[
            "--db", &db, "review", "--learner", LEARNER, "--item", ITEM, "--outcome", "incorrect",
        ]) {
            Ok(()) => panic!("expected not found"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("no progress record"));
        let _ = fs::remove_file(&db_path);
    }
}
