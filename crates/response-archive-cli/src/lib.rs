//! Operator command surface for the response archive.
//!
//! The archive is in-memory, so every invocation starts empty and replays a
//! JSON Lines operation script (`--script`) before answering the requested
//! query. Host tools can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_script`] to replay a script body into an existing [`RunArchive`].
//! - [`execute_command`] to answer a query against an existing archive.

use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use response_archive_core::{
    ArchiveConfig, ArchiveError, DelegationInput, DelegationUpdate, EventInput,
    ModeratorNoteInput, RollbackOptions, RunId, SafetyUpdate, StartRunInput, StatusUpdate,
};
use response_archive_store::RunArchive;
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGING: Once = Once::new();

#[derive(Debug, Parser)]
#[command(name = "ra")]
#[command(about = "Response archive operator CLI")]
pub struct Cli {
    /// JSON Lines file of archive operations replayed before the command runs.
    #[arg(long)]
    script: Option<PathBuf>,

    /// JSON archive configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormatArg {
        self.log_format
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replays the script and prints the archive summary.
    Replay(ReplayArgs),
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    Timeline(TimelineArgs),
    Rollback {
        #[command(subcommand)]
        command: RollbackCommand,
    },
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Prune runs outside the configured retention window before reporting.
    #[arg(long)]
    enforce_retention: bool,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    List,
    Show(RunShowArgs),
}

#[derive(Debug, Args)]
pub struct RunShowArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
pub struct TimelineArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    at_sequence: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum RollbackCommand {
    /// Computes the rolled-back timeline without changing the archive.
    Preview(RollbackArgs),
    /// Commits the rollback and prints the resulting timeline.
    Apply(RollbackArgs),
}

#[derive(Debug, Args)]
pub struct RollbackArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    sequence: Option<u64>,
    #[arg(long)]
    tool_call_id: Option<String>,
    #[arg(long)]
    operator: Option<String>,
    #[arg(long)]
    reason: Option<String>,
}

impl RollbackArgs {
    fn options(&self) -> RollbackOptions {
        RollbackOptions {
            sequence: self.sequence,
            tool_call_id: self.tool_call_id.clone(),
            operator: self.operator.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// One line of a replay script, tagged by `"op"`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ScriptOp {
    StartRun(StartRunInput),
    UpdateStatus(StatusUpdate),
    RecordEvent {
        run_id: RunId,
        #[serde(flatten)]
        event: EventInput,
    },
    UpdateSafety {
        run_id: RunId,
        #[serde(flatten)]
        update: SafetyUpdate,
    },
    AddModeratorNote {
        run_id: RunId,
        #[serde(flatten)]
        note: ModeratorNoteInput,
    },
    RecordDelegation {
        run_id: RunId,
        #[serde(flatten)]
        delegation: DelegationInput,
    },
    UpdateDelegation {
        run_id: RunId,
        call_id: String,
        #[serde(flatten)]
        update: DelegationUpdate,
    },
    Rollback {
        run_id: RunId,
        #[serde(flatten)]
        options: RollbackOptions,
    },
    DeleteRun {
        run_id: RunId,
    },
    PruneOlderThan {
        #[serde(with = "time::serde::rfc3339")]
        cutoff: OffsetDateTime,
    },
}

impl ScriptOp {
    fn name(&self) -> &'static str {
        match self {
            Self::StartRun(_) => "start_run",
            Self::UpdateStatus(_) => "update_status",
            Self::RecordEvent { .. } => "record_event",
            Self::UpdateSafety { .. } => "update_safety",
            Self::AddModeratorNote { .. } => "add_moderator_note",
            Self::RecordDelegation { .. } => "record_delegation",
            Self::UpdateDelegation { .. } => "update_delegation",
            Self::Rollback { .. } => "rollback",
            Self::DeleteRun { .. } => "delete_run",
            Self::PruneOlderThan { .. } => "prune_older_than",
        }
    }
}

/// Installs the global `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` selects levels (default `warn`). Later calls are no-ops.
pub fn init_logging(format: LogFormatArg) {
    LOGGING.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        match format {
            LogFormatArg::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormatArg::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Executes the parsed CLI: builds an archive, replays the script, answers
/// the command on stdout.
///
/// # Errors
/// Returns an error when the config or script cannot be loaded, a script
/// line fails, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let archive = RunArchive::new(config)?;

    if let Some(path) = &cli.script {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        let applied = run_script(&archive, &body)?;
        info!(applied, script = %path.display(), "script replayed");
    }

    let output = execute_command(cli.command, &archive)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Replays a JSON Lines script into `archive`, returning how many operations
/// were applied. Blank lines are skipped.
///
/// # Errors
/// Returns an error naming the 1-based line number of the first line that
/// fails to decode or apply. Earlier lines stay applied.
pub fn run_script(archive: &RunArchive, body: &str) -> Result<usize> {
    let mut applied = 0;
    for (index, line) in body.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let op: ScriptOp = serde_json::from_str(line)
            .with_context(|| format!("script line {line_no}: invalid operation"))?;
        let name = op.name();
        apply_op(archive, op)
            .with_context(|| format!("script line {line_no}: {name} failed"))?;
        debug!(line = line_no, op = name, "script operation applied");
        applied += 1;
    }
    Ok(applied)
}

/// Answers one query against an already-populated archive.
///
/// # Errors
/// Returns an error when a referenced run is missing or the archive
/// operation fails.
pub fn execute_command(command: Command, archive: &RunArchive) -> Result<Value> {
    match command {
        Command::Replay(args) => {
            if args.enforce_retention {
                let pruned = archive.enforce_retention()?;
                info!(pruned, "retention enforced");
            }
            Ok(serde_json::to_value(archive.status()?)?)
        }
        Command::Runs { command } => match command {
            RunsCommand::List => Ok(serde_json::to_value(archive.list_runs()?)?),
            RunsCommand::Show(args) => {
                let run_id = RunId::from(args.run_id);
                let run = archive
                    .get_run(&run_id)?
                    .ok_or(ArchiveError::RunNotFound { run_id })?;
                Ok(serde_json::to_value(run)?)
            }
        },
        Command::Timeline(args) => {
            let run_id = RunId::from(args.run_id);
            let snapshot = match args.at_sequence {
                Some(through) => archive.snapshot_at(&run_id, through)?,
                None => archive.get_timeline(&run_id)?,
            }
            .ok_or(ArchiveError::RunNotFound { run_id })?;
            Ok(serde_json::to_value(snapshot)?)
        }
        Command::Rollback { command } => {
            let view = match command {
                RollbackCommand::Preview(args) => {
                    archive.preview_rollback(&RunId::from(args.run_id.as_str()), &args.options())?
                }
                RollbackCommand::Apply(args) => {
                    archive.rollback(&RunId::from(args.run_id.as_str()), &args.options())?
                }
            };
            Ok(serde_json::to_value(view)?)
        }
    }
}

fn apply_op(archive: &RunArchive, op: ScriptOp) -> Result<()> {
    match op {
        ScriptOp::StartRun(input) => {
            archive.start_run(input)?;
        }
        ScriptOp::UpdateStatus(update) => {
            archive.update_status(update)?;
        }
        ScriptOp::RecordEvent { run_id, event } => {
            archive.record_event(&run_id, event)?;
        }
        ScriptOp::UpdateSafety { run_id, update } => {
            archive.update_safety(&run_id, &update)?;
        }
        ScriptOp::AddModeratorNote { run_id, note } => {
            archive.add_moderator_note(&run_id, note)?;
        }
        ScriptOp::RecordDelegation { run_id, delegation } => {
            archive.record_delegation(&run_id, &delegation)?;
        }
        ScriptOp::UpdateDelegation {
            run_id,
            call_id,
            update,
        } => {
            archive.update_delegation(&run_id, &call_id, &update)?;
        }
        ScriptOp::Rollback { run_id, options } => {
            archive.rollback(&run_id, &options)?;
        }
        ScriptOp::DeleteRun { run_id } => {
            if !archive.delete_run(&run_id)? {
                return Err(anyhow!(ArchiveError::RunNotFound { run_id }));
            }
        }
        ScriptOp::PruneOlderThan { cutoff } => {
            archive.prune_older_than(cutoff)?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ArchiveConfig> {
    let Some(path) = path else {
        return Ok(ArchiveConfig::default());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config {} must be valid JSON", path.display()))?;
    Ok(ArchiveConfig::from_json(&value)?)
}
