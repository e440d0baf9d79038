use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use terra_runner::{AnnotationRunner, RunnerConfig, RunnerError};
use terra_store::{
    Database, GlossaryRepo, RevisionRepo, RunStateRepo, SnapshotRepo, ThreadStateRepo,
};

mod export;

use export::ExportFormat;

const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "terra-annotator", about = "Autonomous glossary annotation harness")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Write logs to a file instead of stderr (for long runs).
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Iterate the corpus and update the glossary.
    Run {
        /// Path to the read-only corpus database.
        #[arg(long, default_value = "corpus.db")]
        corpus_db: PathBuf,
        /// Path to the annotator database.
        #[arg(long, default_value = "annotator.db")]
        annotator_db: PathBuf,
        /// Agent server base URL.
        #[arg(long, default_value = "http://localhost:8080")]
        agent_url: String,
        /// Limit the number of scenes for this run.
        #[arg(long)]
        limit: Option<u64>,
        /// Start from the first post, ignoring the checkpoint.
        #[arg(long)]
        no_resume: bool,
        /// Corpus reader page size.
        #[arg(long, default_value_t = 256)]
        batch_size: usize,
        /// Sampling temperature.
        #[arg(long, default_value_t = 0.4)]
        temperature: f32,
        /// Generation budget per call.
        #[arg(long, default_value_t = 768)]
        max_tokens: u32,
        /// Agent request timeout in seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Max tool call rounds per scene.
        #[arg(long, default_value_t = 10)]
        max_tool_rounds: usize,
        /// Context budget in tokens.
        #[arg(long, default_value_t = 98_304)]
        context_budget: usize,
        /// Also checkpoint every N scenes within a thread.
        #[arg(long)]
        checkpoint_every: Option<u32>,
    },
    /// Show run status and glossary summary.
    Status {
        #[arg(long, default_value = "annotator.db")]
        annotator_db: PathBuf,
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Inspect entries, snapshots, and threads.
    Inspect {
        #[arg(long, default_value = "annotator.db")]
        annotator_db: PathBuf,
        #[command(subcommand)]
        target: InspectTarget,
    },
    /// Export the glossary to JSON or YAML.
    Export {
        #[arg(long, default_value = "annotator.db")]
        annotator_db: PathBuf,
        /// Export format: json or yaml.
        #[arg(long, default_value = "json")]
        format: String,
        /// Output path (default: glossary_YYYY-MM-DD.<format>).
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Filter by status: confirmed, tentative, or all.
        #[arg(long, default_value = "all")]
        status: String,
        /// Filter by tags (entries must carry every tag).
        #[arg(long, num_args = 1..)]
        tags: Vec<String>,
    },
}

#[derive(Subcommand)]
enum InspectTarget {
    /// List recent snapshots.
    Snapshots {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Filter by type: checkpoint, curator_fork, manual.
        #[arg(long)]
        snapshot_type: Option<String>,
    },
    /// Show one snapshot in detail.
    Snapshot { id: i64 },
    /// List recent entries.
    Entries {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one entry in detail, with its revision history.
    Entry { id: i64 },
    /// Show per-thread progress.
    Thread { id: i64 },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    init_tracing(&cli.log_level, cli.log_file.as_deref());

    match run_command(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CommandError::Runner(e)) => {
            error!(error = %e, "run failed");
            ExitCode::from(e.exit_code() as u8)
        }
        Err(CommandError::Storage(e)) => {
            error!(error = %e, "storage failure");
            ExitCode::from(2)
        }
        Err(CommandError::Usage(message)) => {
            eprintln!("error: {message}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

#[derive(Debug)]
enum CommandError {
    Runner(RunnerError),
    Storage(terra_store::StoreError),
    Usage(String),
}

impl From<RunnerError> for CommandError {
    fn from(e: RunnerError) -> Self {
        Self::Runner(e)
    }
}

impl From<terra_store::StoreError> for CommandError {
    fn from(e: terra_store::StoreError) -> Self {
        Self::Storage(e)
    }
}

fn init_tracing(level: &str, log_file: Option<&std::path::Path>) {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default filter is valid");

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("failed to open log file");
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

async fn run_command(command: Command) -> Result<(), CommandError> {
    match command {
        Command::Run {
            corpus_db,
            annotator_db,
            agent_url,
            limit,
            no_resume,
            batch_size,
            temperature,
            max_tokens,
            timeout,
            max_tool_rounds,
            context_budget,
            checkpoint_every,
        } => {
            let config = RunnerConfig {
                corpus_db,
                annotator_db,
                agent_url,
                temperature,
                max_tokens,
                request_timeout_secs: timeout,
                resume: !no_resume,
                max_tool_rounds,
                context_budget,
                batch_size,
                checkpoint_every_scenes: checkpoint_every,
            };
            let mut runner = AnnotationRunner::new(config)?;

            // SIGINT/SIGTERM request a stop at the next phase boundary.
            let cancel = runner.cancel_token();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                info!("shutdown signal received; stopping at next boundary");
                cancel.cancel();
            });

            let result = runner.run(limit).await?;
            println!(
                "Processed {} scenes, {} posts across {} threads",
                result.scenes_processed, result.posts_processed, result.threads_completed
            );
            println!(
                "Created {} entries, updated {}; {} tool calls",
                result.entries_created, result.entries_updated, result.tool_calls_total
            );
            if result.stopped_early {
                println!("Run stopped early; restart to continue from the checkpoint.");
            }
            Ok(())
        }
        Command::Status { annotator_db, format } => status(&annotator_db, &format),
        Command::Inspect { annotator_db, target } => inspect(&annotator_db, target),
        Command::Export {
            annotator_db,
            format,
            output,
            status,
            tags,
        } => {
            let format = match format.as_str() {
                "json" => ExportFormat::Json,
                "yaml" => ExportFormat::Yaml,
                other => return Err(CommandError::Usage(format!("unknown export format '{other}'"))),
            };
            let output = output.unwrap_or_else(|| {
                let date = chrono::Utc::now().format("%Y-%m-%d");
                PathBuf::from(format!("glossary_{date}.{}", format.extension()))
            });

            let db = open_existing(&annotator_db)?;
            let glossary = GlossaryRepo::new(db);
            let count =
                export::export_glossary(&glossary, format, Some(status.as_str()), &tags, &output)
                    .map_err(|e| match e {
                        export::ExportError::Store(e) => CommandError::Storage(e),
                        other => CommandError::Usage(other.to_string()),
                    })?;
            println!("Exported {count} entries to {}", output.display());
            Ok(())
        }
    }
}

fn open_existing(path: &std::path::Path) -> Result<Database, CommandError> {
    if !path.exists() {
        return Err(CommandError::Usage(format!(
            "database not found: {}",
            path.display()
        )));
    }
    Ok(Database::open(path)?)
}

fn status(annotator_db: &std::path::Path, format: &str) -> Result<(), CommandError> {
    let db = open_existing(annotator_db)?;
    let run_state = RunStateRepo::new(db.clone()).get()?;
    let glossary = GlossaryRepo::new(db.clone());
    let snapshots = SnapshotRepo::new(db);

    let entry_count = glossary.count()?;
    let by_status = glossary.count_by_status()?;
    let snapshot_count = snapshots.count()?;
    let by_type = snapshots.count_by_type()?;

    if format == "json" {
        let data = serde_json::json!({
            "run_state": {
                "last_post_id": run_state.last_post_id,
                "last_thread_id": run_state.last_thread_id,
                "current_snapshot_id": run_state.current_snapshot_id,
                "run_started_at": run_state.run_started_at,
                "run_updated_at": run_state.run_updated_at,
            },
            "stats": {
                "posts_processed": run_state.total_posts_processed,
                "entries_created": run_state.total_entries_created,
                "entries_updated": run_state.total_entries_updated,
            },
            "glossary": {
                "total": entry_count,
                "by_status": by_status.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
            },
            "snapshots": {
                "total": snapshot_count,
                "by_type": by_type.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&data).expect("status encodes"));
        return Ok(());
    }

    let count_for = |pairs: &[(String, i64)], key: &str| {
        pairs.iter().find(|(k, _)| k == key).map(|(_, v)| *v).unwrap_or(0)
    };
    println!("Run State:");
    println!("  Last post:       {}", display_opt(run_state.last_post_id));
    println!("  Last thread:     {}", display_opt(run_state.last_thread_id));
    println!("  Started:         {}", run_state.run_started_at.as_deref().unwrap_or("N/A"));
    println!("  Updated:         {}", run_state.run_updated_at.as_deref().unwrap_or("N/A"));
    println!();
    println!("Stats:");
    println!("  Posts processed: {}", run_state.total_posts_processed);
    println!("  Entries created: {}", run_state.total_entries_created);
    println!("  Entries updated: {}", run_state.total_entries_updated);
    println!();
    println!("Glossary:");
    println!("  Total entries:   {entry_count}");
    println!("  Confirmed:       {}", count_for(&by_status, "confirmed"));
    println!("  Tentative:       {}", count_for(&by_status, "tentative"));
    println!();
    println!("Snapshots:");
    println!("  Total:           {snapshot_count}");
    println!("  Checkpoints:     {}", count_for(&by_type, "checkpoint"));
    println!("  Curator forks:   {}", count_for(&by_type, "curator_fork"));
    println!("  Manual:          {}", count_for(&by_type, "manual"));
    Ok(())
}

fn inspect(annotator_db: &std::path::Path, target: InspectTarget) -> Result<(), CommandError> {
    let db = open_existing(annotator_db)?;
    match target {
        InspectTarget::Snapshots { limit, snapshot_type } => {
            let type_filter = match snapshot_type.as_deref() {
                None => None,
                Some(raw) => Some(raw.parse().map_err(CommandError::Usage)?),
            };
            let listed = SnapshotRepo::new(db).list_recent(limit, type_filter)?;
            if listed.is_empty() {
                println!("No snapshots found.");
                return Ok(());
            }
            println!("{:>5}  {:<14}  {:>6}  {:>7}  Created At", "ID", "Type", "Thread", "Entries");
            println!("{}", "-".repeat(70));
            for s in listed {
                println!(
                    "{:>5}  {:<14}  {:>6}  {:>7}  {}",
                    s.id,
                    s.snapshot_type.to_string(),
                    s.last_thread_id,
                    s.glossary_entry_count,
                    s.created_at
                );
            }
        }
        InspectTarget::Snapshot { id } => {
            let repo = SnapshotRepo::new(db);
            let snapshot = repo
                .get(id)?
                .ok_or_else(|| CommandError::Usage(format!("snapshot {id} not found")))?;
            let context = repo.get_context(id)?;
            let entries = repo.get_entries(id)?;

            println!("Snapshot #{}", snapshot.id);
            println!("{}", "=".repeat(40));
            println!("Type:            {}", snapshot.snapshot_type);
            println!("Created:         {}", snapshot.created_at);
            println!("Last post:       {}", snapshot.last_post_id);
            println!("Last thread:     {}", snapshot.last_thread_id);
            println!("Thread position: {}", snapshot.thread_position);
            println!("Entry count:     {}", snapshot.glossary_entry_count);
            println!("Token count:     {}", display_opt(snapshot.context_token_count));
            if let Some(ctx) = context {
                println!();
                println!("Context:");
                println!("  System prompt:        {} chars", ctx.system_prompt.len());
                println!(
                    "  Cumulative summary:   {} chars",
                    ctx.cumulative_summary.as_deref().map(str::len).unwrap_or(0)
                );
                println!("  Chunk summaries:      {}", ctx.chunk_summaries.len());
                println!("  Thread summaries:     {}", ctx.thread_summaries.len());
                println!("  Conversation history: {} turns", ctx.conversation_history.len());
                println!("  Current thread:       {}", display_opt(ctx.current_thread_id));
            }
            println!();
            println!("Captured {} entry states", entries.len());
        }
        InspectTarget::Entries { limit, status } => {
            let mut entries = GlossaryRepo::new(db).all_entries()?;
            entries.sort_by_key(|e| std::cmp::Reverse(e.id));
            if let Some(status) = &status {
                entries.retain(|e| e.status.to_string() == *status);
            }
            entries.truncate(limit);

            if entries.is_empty() {
                println!("No entries found.");
                return Ok(());
            }
            println!("{:>5}  {:<25}  {:<10}  Tags", "ID", "Term", "Status");
            println!("{}", "-".repeat(70));
            for e in entries {
                let term = if e.term.chars().count() > 25 {
                    format!("{}...", e.term.chars().take(22).collect::<String>())
                } else {
                    e.term.clone()
                };
                println!(
                    "{:>5}  {:<25}  {:<10}  {}",
                    e.id,
                    term,
                    e.status.to_string(),
                    e.tags.join(", ")
                );
            }
        }
        InspectTarget::Entry { id } => {
            let entry = GlossaryRepo::new(db.clone())
                .get(id)?
                .ok_or_else(|| CommandError::Usage(format!("entry {id} not found")))?;
            let history = RevisionRepo::new(db).history(id, 20)?;

            println!("Entry #{}: {}", entry.id, entry.term);
            println!("{}", "=".repeat(40));
            println!("Status:          {}", entry.status);
            println!(
                "Tags:            {}",
                if entry.tags.is_empty() { "none".to_string() } else { entry.tags.join(", ") }
            );
            println!(
                "First seen:      post {}, thread {}",
                entry.first_seen_post_id, entry.first_seen_thread_id
            );
            println!(
                "Last updated:    post {}, thread {}",
                entry.last_updated_post_id, entry.last_updated_thread_id
            );
            println!("Created:         {}", entry.created_at);
            println!("Updated:         {}", entry.updated_at);
            println!();
            println!("Definition:");
            println!("{}", "-".repeat(40));
            println!("{}", entry.definition);
            println!();
            println!("Recent revisions: {}", history.len());
            for revision in history {
                println!("  [{}] {} <- {}", revision.changed_at, revision.field_name, revision.new_value);
            }
        }
        InspectTarget::Thread { id } => {
            let thread_state = ThreadStateRepo::new(db.clone()).get(id)?;
            let entries = GlossaryRepo::new(db.clone()).get_by_thread(id)?;
            let snapshots = SnapshotRepo::new(db).list_by_thread(id)?;

            println!("Thread #{id}");
            println!("{}", "=".repeat(40));
            match thread_state {
                Some(state) => {
                    println!("Status:          {}", state.status);
                    println!("Posts processed: {}", state.posts_processed);
                    println!("Entries created: {}", state.entries_created);
                    println!("Entries updated: {}", state.entries_updated);
                    println!("Started:         {}", state.started_at.as_deref().unwrap_or("N/A"));
                    println!("Completed:       {}", state.completed_at.as_deref().unwrap_or("N/A"));
                    if let Some(summary) = state.summary {
                        println!();
                        println!("Summary:");
                        println!("{}", "-".repeat(40));
                        println!("{summary}");
                    }
                }
                None => println!("No state recorded for this thread."),
            }
            println!();
            println!("Entries first seen in this thread: {}", entries.len());
            println!("Snapshots for this thread: {}", snapshots.len());
            for s in snapshots.iter().take(5) {
                println!("  #{} ({}) - {}", s.id, s.snapshot_type, s.created_at);
            }
            if snapshots.len() > 5 {
                println!("  ... and {} more", snapshots.len() - 5);
            }
        }
    }
    Ok(())
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    }
}
