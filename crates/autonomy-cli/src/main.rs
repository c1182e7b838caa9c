use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use autonomy_core::config::resolve_config;
use autonomy_core::engine::{Engine, EngineError, Operation, Outcome, Severity};
use autonomy_core::field_cache::FieldCache;
use autonomy_core::hierarchy::SyncOptions;
use autonomy_core::mutation::FeedbackSeverity;
use autonomy_core::paths::{default_repo_name, find_repo_root, state_dir};
use autonomy_core::store::LocalIssueStore;
use autonomy_core::task::Task;
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod render;
mod version;

#[derive(Parser)]
#[command(name = "autonomy", version, about = "Task-board autonomy engine")]
struct Cli {
    /// Repository root (defaults to the nearest ancestor with .autonomy.toml, .autonomy or .git)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Repository as owner/name (defaults to local/<root dir>)
    #[arg(long, global = true, env = "AUTONOMY_REPO")]
    repo: Option<String>,

    /// Who is acting; recorded on every mutation
    #[arg(long, global = true, env = "AUTONOMY_ACTOR")]
    actor: Option<String>,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging unless AUTONOMY_LOG is set
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Top open task with its ranking explanation
    Next {
        /// Only tasks assigned to the acting user
        #[arg(long)]
        me: bool,
    },
    /// Per-signal score breakdown for one task
    Explain { id: String },
    /// Resequence the board by score; pinned tasks stay put
    Rerank {
        #[arg(long)]
        dry_run: bool,
    },
    /// Close a task and/or record completion notes
    Update {
        id: String,
        #[arg(long)]
        done: bool,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Exempt a task from reranking
    Pin { id: String },
    /// Remove a pin
    Unpin { id: String },
    /// Parent/child linking
    Hierarchy {
        #[command(subcommand)]
        command: HierarchyCommand,
    },
    /// Backlog hygiene scan
    Doctor {
        #[command(subcommand)]
        command: DoctorCommand,
    },
    /// Revert a committed mutation by hash (prefix of 7+ characters)
    Undo {
        hash: String,
        #[arg(long = "commit-window")]
        commit_window: Option<usize>,
    },
    /// Record why a mutation was reverted
    Feedback {
        hash: String,
        #[arg(long)]
        reason: String,
        /// low | medium | high
        #[arg(long, default_value = "medium")]
        severity: String,
        #[arg(long = "flow-area")]
        flow_area: Option<String>,
    },
    /// Recent mutations, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Seed the local issue snapshot from a JSON array of tasks
    Import { file: PathBuf },
    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum HierarchyCommand {
    /// Link unparented tasks to their declared parents
    Sync {
        #[arg(long, conflicts_with = "force")]
        dry_run: bool,
        /// Create parents even for groups at or under the threshold
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum DoctorCommand {
    /// Scan and report; --apply labels flagged tasks
    Run {
        #[arg(long)]
        apply: bool,
    },
    /// Scan and apply labels (scheduled run)
    Nightly,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate configuration and show where each section came from
    Check,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("AUTONOMY_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json = cli.json;
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let severity = err
                .downcast_ref::<EngineError>()
                .map(EngineError::severity)
                .unwrap_or(Severity::Error);
            if severity == Severity::Critical {
                error!(error = %err, "critical failure; board may not match the mutation log");
            }
            if json {
                println!(
                    "{}",
                    json!({ "ok": false, "error": format!("{:#}", err), "severity": severity })
                );
            } else {
                eprintln!("{}: {:#}", severity.as_str(), err);
            }
            match severity {
                Severity::Critical => ExitCode::from(3),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn resolve_root(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(root) => Ok(root),
        None => {
            let cwd = std::env::current_dir().context("current directory")?;
            Ok(find_repo_root(&cwd).unwrap_or(cwd))
        }
    }
}

fn resolve_actor(explicit: Option<String>, fallback: &str) -> String {
    explicit
        .or_else(|| std::env::var("USER").ok())
        .map(|actor| actor.trim().to_string())
        .filter(|actor| !actor.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn run(cli: Cli) -> Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };
    let root = resolve_root(cli.root)?;
    let repo = cli.repo.unwrap_or_else(|| default_repo_name(&root));
    let state = state_dir(&root);

    let op = match command {
        Command::Version => {
            println!("autonomy {}", version::FULL);
            return Ok(());
        }
        Command::Config {
            command: ConfigCommand::Check,
        } => return config_check(&root, cli.json),
        Command::Import { file } => return import(&root, &state, &repo, &file, cli.json),
        Command::Next { me } => Operation::Next { me },
        Command::Explain { id } => Operation::Explain { task_id: id },
        Command::Rerank { dry_run } => Operation::Rerank { dry_run },
        Command::Update { id, done, notes } => Operation::Update {
            task_id: id,
            done,
            notes,
        },
        Command::Pin { id } => Operation::Pin { task_id: id },
        Command::Unpin { id } => Operation::Unpin { task_id: id },
        Command::Hierarchy {
            command: HierarchyCommand::Sync { dry_run, force },
        } => Operation::Sync(SyncOptions { dry_run, force }),
        Command::Doctor { command } => match command {
            DoctorCommand::Run { apply } => Operation::Scan { apply },
            DoctorCommand::Nightly => Operation::Scan { apply: true },
        },
        Command::Undo {
            hash,
            commit_window,
        } => Operation::Undo {
            hash,
            window: commit_window,
        },
        Command::Feedback {
            hash,
            reason,
            severity,
            flow_area,
        } => Operation::Feedback {
            hash,
            reason,
            severity: FeedbackSeverity::parse(&severity).ok_or_else(|| {
                EngineError::Validation(format!(
                    "invalid severity '{}': expected low, medium or high",
                    severity
                ))
            })?,
            flow_area,
        },
        Command::History { limit } => Operation::History { limit },
    };

    let fallback_actor = match &op {
        Operation::Scan { apply: true } => "autonomy-doctor",
        _ => "cli",
    };
    let actor = resolve_actor(cli.actor, fallback_actor);
    let engine = Engine::open_local(&root, &state, &repo)?;
    let ctx = engine.context(&actor, Utc::now());
    let outcome = engine.run(op, &ctx)?;
    emit(&outcome, cli.json)
}

fn emit(outcome: &Outcome, json: bool) -> Result<()> {
    if json {
        let mut value = serde_json::to_value(outcome)?;
        if let Value::Object(map) = &mut value {
            map.insert("ok".to_string(), Value::Bool(true));
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", render::outcome_text(outcome));
        if let Outcome::Next {
            notice: Some(notice),
            ..
        } = outcome
        {
            eprintln!("notice: {}", notice);
        }
    }
    Ok(())
}

fn config_check(root: &Path, json: bool) -> Result<()> {
    let config = resolve_config(root).map_err(EngineError::from)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "ok": true,
                "sources": config.sources,
                "ranking": config.ranking,
                "doctor": config.doctor,
                "hierarchy": config.hierarchy,
                "undo": config.undo,
                "retry": config.retry,
                "store": config.store,
            }))?
        );
        return Ok(());
    }
    println!("config ok");
    for (section, source) in &config.sources {
        println!("  {:<10} {}", section, source);
    }
    Ok(())
}

fn import(root: &Path, state: &Path, repo: &str, file: &Path, json: bool) -> Result<()> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse tasks from {}", file.display()))?;
    let config = resolve_config(root).map_err(EngineError::from)?;
    let store = LocalIssueStore::open(
        state,
        repo,
        Arc::new(FieldCache::new(config.store.field_cache_ttl())),
    )
    .map_err(EngineError::from)?;
    let count = store.import(tasks).map_err(EngineError::from)?;
    if json {
        println!("{}", json!({ "ok": true, "imported": count, "repo": repo }));
    } else {
        println!("Imported {} task(s) into {}", count, repo);
    }
    Ok(())
}
