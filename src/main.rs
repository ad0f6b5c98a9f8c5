//! # Recall Harness CLI
//!
//! `recall` — the command-line surface over the memory engine: ingest
//! agent transcripts, compact them into tier files, assemble a context
//! bundle for the next agent turn, and drive the `ralph` PRD iteration
//! loop.
//!
//! ## Architecture
//!
//! ```text
//! Ingesters → Pipeline → Extractor → Compaction → { Retrieval, Ralph loop }
//! ```
//!
//! See [`recall_harness`] for the library surface this binary wires
//! together.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::TimeZone;
use clap::{Parser, Subcommand};

use recall_harness::compaction::CompactionEngine;
use recall_harness::config::{self, Config};
use recall_harness::db;
use recall_harness::extract::TranscriptExtractor;
use recall_harness::ingest::jsonl::JsonlIngester;
use recall_harness::ingest::nested_json::NestedJsonIngester;
use recall_harness::ingest::workspace_sqlite::WorkspaceSqliteIngester;
use recall_harness::ingest::IngesterRegistry;
use recall_harness::llm;
use recall_harness::migrate;
use recall_harness::models::Scope;
use recall_harness::pipeline::{IngestionPipeline, SyncFilters};
use recall_harness::progress::ProgressMode;
use recall_harness::ralph::loop_driver::ProgressEvent;
use recall_harness::ralph::{hooks, PrdArchive, RalphLoopDriver};
use recall_harness::retrieval::RetrievalEngine;
use recall_harness::storage::{SqliteStore, Store};
use recall_harness::storage_remote::RemoteStore;

/// Messages batched per LLM extraction call when no override is configured.
const DEFAULT_EXTRACT_BATCH_SIZE: usize = 20;

/// Written to `.agent/config.yaml` on `recall init` when nothing exists yet.
/// The filename keeps the `.yaml` extension used throughout the host
/// tooling this crate integrates with; the contents are TOML, matching
/// every other config surface in the crate.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Recall Harness configuration (TOML syntax).

[llm]
provider = "anthropic"
model = "claude-3-5-haiku-latest"

[compaction]
max_sessions_before_compact = 5

[retrieval]

[storage]

[ralph]
enabled = false
"#;

#[derive(Parser)]
#[command(
    name = "recall",
    about = "Recall Harness — a per-repository persistent memory engine for AI coding agents",
    version
)]
struct Cli {
    /// Path to the repository root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Path to the config file, relative to `--repo` if not absolute
    #[arg(long, global = true, default_value = ".agent/config.yaml")]
    config: PathBuf,

    /// Tenant ID for multi-tenant shared storage (defaults to "default")
    #[arg(long, global = true)]
    tenant: Option<String>,

    /// Project ID for multi-tenant shared storage (defaults to "default")
    #[arg(long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize `.agent/` and the local database
    Init,

    /// Ingest new transcripts from the configured agent sources
    Sync {
        /// Only process sessions modified after this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,

        /// Restrict to specific ingester sources (codex, opencode, cursor)
        #[arg(long, value_delimiter = ',')]
        source: Option<Vec<String>>,

        /// Restrict to specific source session IDs
        #[arg(long, value_delimiter = ',')]
        session_id: Option<Vec<String>>,

        /// Limit the number of sessions processed
        #[arg(long)]
        limit: Option<usize>,

        /// Show what would be processed without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Clear checkpoints (narrowed by --source/--session-id when given)
        /// before syncing, forcing incremental re-extraction from scratch
        #[arg(long)]
        reset_checkpoints: bool,

        /// Clear processed-session markers and checkpoints for the scope
        /// before syncing, forcing every session to be fully reprocessed
        #[arg(long)]
        reset_full: bool,
    },

    /// Run the compaction engine: synthesize tier files and index chunks
    Compact {
        /// Lower the pattern-promotion threshold to 1 occurrence
        #[arg(long)]
        force: bool,
    },

    /// Assemble and print a context bundle for a task
    Context {
        /// The task description driving retrieval
        task: String,
    },

    /// Search indexed chunks directly
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Manage the guardrail hooks installed into the host settings file
    Hooks {
        #[command(subcommand)]
        action: HooksAction,
    },

    /// Manage and drive the `ralph` PRD iteration loop
    Ralph {
        #[command(subcommand)]
        action: RalphAction,
    },
}

#[derive(Subcommand)]
enum HooksAction {
    /// Generate the hook scripts and register them in the settings file
    Install {
        /// Path to the host settings JSON file (e.g. `.claude/settings.json`)
        settings: PathBuf,
    },
    /// Remove Ralph's hook entries from the settings file
    Uninstall {
        settings: PathBuf,
    },
}

#[derive(Subcommand)]
enum RalphAction {
    /// Enable the iteration loop
    Enable,
    /// Disable the iteration loop
    Disable,
    /// Run iterations until the PRD is exhausted, the budget is spent, or `--max` is reached
    Run {
        #[arg(long)]
        max: Option<u32>,
    },
    /// Archive completed PRD items into the searchable archive
    Archive,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo_root = cli.repo.canonicalize().unwrap_or(cli.repo.clone());
    let agent_dir = repo_root.join(".agent");
    let config_path = if cli.config.is_absolute() {
        cli.config.clone()
    } else {
        repo_root.join(&cli.config)
    };

    let scope = match (&cli.tenant, &cli.project) {
        (Some(tenant), Some(project)) => Scope::new(tenant.clone(), project.clone()),
        (Some(tenant), None) => Scope::new(tenant.clone(), "default"),
        (None, Some(project)) => Scope::new("default", project.clone()),
        (None, None) => Scope::default_scope(),
    };

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(&agent_dir)?;
            if !config_path.exists() {
                std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)?;
            }
            let db_path = db::default_db_path(&repo_root);
            let pool = db::connect(&db_path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Initialized {} and {}", agent_dir.display(), db_path.display());
        }

        Commands::Sync {
            since,
            source,
            session_id,
            limit,
            dry_run,
            reset_checkpoints,
            reset_full,
        } => {
            let cfg = load_or_default(&config_path)?;
            let store = open_store(&repo_root, &cfg).await?;
            let llm_provider = llm::create_provider(&cfg.llm)?;
            let extractor = Arc::new(TranscriptExtractor::new(Arc::from(llm_provider), DEFAULT_EXTRACT_BATCH_SIZE));
            let registry = build_ingester_registry(&repo_root);
            let pipeline = IngestionPipeline::new(store, registry, extractor)
                .with_progress(ProgressMode::default_for_tty().reporter());

            let filters = SyncFilters {
                since: since
                    .map(|s| parse_since_date(&s))
                    .transpose()
                    .context("--since must be YYYY-MM-DD")?,
                sources: source,
                session_ids: session_id,
                max_sessions: limit,
                dry_run,
                reset_checkpoints,
                reset_full,
            };
            let report = pipeline.sync(&scope, &filters).await?;
            println!(
                "sync: {} discovered, {} processed, {} skipped, {} learnings extracted ({} LLM requests)",
                report.sessions_discovered,
                report.sessions_processed,
                report.sessions_skipped,
                report.learnings_extracted,
                report.llm_requests,
            );
            for err in &report.errors {
                eprintln!("sync warning: {err}");
            }
        }

        Commands::Compact { force } => {
            let cfg = load_or_default(&config_path)?;
            let store = open_store(&repo_root, &cfg).await?;
            let llm_provider = llm::create_provider(&cfg.llm)?;
            let engine = CompactionEngine::new(
                store,
                &agent_dir,
                Arc::from(llm_provider),
                cfg.compaction.clone(),
                cfg.retrieval.clone(),
            );
            let result = engine.compact(&scope, force).await?;
            println!(
                "compact: guardrails_updated={} style_updated={} recent_updated={} chunks_indexed={}",
                result.guardrails_updated,
                result.style_updated,
                result.recent_updated,
                result.chunks_indexed,
            );
        }

        Commands::Context { task } => {
            let cfg = load_or_default(&config_path)?;
            let store = open_store(&repo_root, &cfg).await?;
            let engine = RetrievalEngine::new(store, &agent_dir, cfg.retrieval.clone());
            let bundle = engine.assemble_bundle(&scope, &task).await?;
            println!("{bundle}");
        }

        Commands::Search { query, limit } => {
            let cfg = load_or_default(&config_path)?;
            let store = open_store(&repo_root, &cfg).await?;
            let engine = RetrievalEngine::new(store, &agent_dir, cfg.retrieval.clone());
            let results = engine.search(&scope, &query).await?;
            for entry in results.into_iter().take(limit) {
                println!("{:.3}  {}", entry.score, entry.chunk.content.replace('\n', " "));
            }
        }

        Commands::Hooks { action } => match action {
            HooksAction::Install { settings } => {
                let tiers = recall_harness::tier_store::TierWriter::new(
                    &agent_dir,
                    recall_harness::tier_store::WritePolicy::default(),
                );
                let guardrails_text = tiers.read_tier(recall_harness::models::TierFile::Guardrails)?;

                let paths = hooks::get_hook_paths(&agent_dir);
                let patterns = hooks::generate_pre_tool_script(&guardrails_text, &paths.pre_tool_path, None)?;
                hooks::generate_post_tool_script(&paths.post_tool_path, &paths.events_path)?;
                hooks::generate_notification_script(&paths.notification_path)?;

                hooks::install_hooks(
                    &settings,
                    &paths.pre_tool_path.to_string_lossy(),
                    &paths.post_tool_path.to_string_lossy(),
                    Some(&paths.notification_path.to_string_lossy()),
                )?;
                println!("Installed {} guardrail patterns into {}", patterns.len(), settings.display());
            }
            HooksAction::Uninstall { settings } => {
                let changed = hooks::uninstall_hooks(&settings)?;
                println!(
                    "{} hooks from {}",
                    if changed { "Removed" } else { "No" },
                    settings.display()
                );
            }
        },

        Commands::Ralph { action } => {
            let cfg = load_or_default(&config_path)?;
            let driver = RalphLoopDriver::new(&agent_dir, cfg.ralph.clone());

            match action {
                RalphAction::Enable => {
                    let state = driver.enable()?;
                    println!("ralph enabled (status={:?})", state.status);
                }
                RalphAction::Disable => {
                    let state = driver.disable()?;
                    println!("ralph disabled (status={:?})", state.status);
                }
                RalphAction::Run { max } => {
                    let max_iterations = max.unwrap_or(cfg.ralph.max_iterations);
                    match cfg
                        .ralph
                        .external_script
                        .clone()
                        .or_else(|| default_ralph_script_path(&repo_root))
                    {
                        Some(script_path) => {
                            run_ralph_external_script(&driver, &script_path, max_iterations).await?;
                        }
                        None => {
                            run_ralph_loop(&driver, max_iterations).await?;
                        }
                    }
                }
                RalphAction::Archive => {
                    let store = open_store(&repo_root, &cfg).await?;
                    let archive = PrdArchive::new(&agent_dir, Some(store));
                    let archived = archive
                        .archive_completed_from_prd(&scope, &agent_dir.join("ralph").join("prd.json"), 0)
                        .await?;
                    println!("archived {} completed PRD item(s)", archived.len());
                }
            }
        }
    }

    Ok(())
}

fn load_or_default(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        config::load_config(config_path)
    } else {
        Ok(config::default_config())
    }
}

async fn open_store(repo_root: &Path, cfg: &Config) -> Result<Arc<dyn Store>> {
    let db_path = db::default_db_path(repo_root);
    let pool = db::connect(&db_path).await?;
    migrate::run_migrations(&pool).await?;
    let local = SqliteStore::new(pool);

    if cfg.storage.is_shared() {
        Ok(Arc::new(RemoteStore::new(cfg.storage.shared.clone(), local)?))
    } else {
        Ok(Arc::new(local))
    }
}

/// Home directory for the current user, used to locate each coding
/// agent's default transcript directory. No `dirs`-style crate is in
/// the dependency tree, so this resolves `$HOME` directly; callers can
/// override any individual path via `--repo` and future per-source
/// flags if the default doesn't fit their setup.
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn build_ingester_registry(repo_root: &Path) -> IngesterRegistry {
    let mut registry = IngesterRegistry::new();

    if let Some(home) = home_dir() {
        let codex_sessions = home.join(".codex").join("sessions");
        registry.register(Box::new(JsonlIngester::new(repo_root.to_path_buf(), codex_sessions)));

        let opencode_dir = home.join(".local").join("share").join("opencode");
        registry.register(Box::new(NestedJsonIngester::new(
            repo_root.to_path_buf(),
            opencode_dir,
        )));
    }

    let cursor_storage = cursor_storage_dir();
    registry.register(Box::new(WorkspaceSqliteIngester::new(
        repo_root.to_path_buf(),
        cursor_storage,
        false,
    )));

    registry
}

#[cfg(target_os = "macos")]
fn cursor_storage_dir() -> PathBuf {
    home_dir()
        .unwrap_or_default()
        .join("Library/Application Support/Cursor/User/workspaceStorage")
}

#[cfg(target_os = "linux")]
fn cursor_storage_dir() -> PathBuf {
    home_dir()
        .unwrap_or_default()
        .join(".config/Cursor/User/workspaceStorage")
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn cursor_storage_dir() -> PathBuf {
    home_dir().unwrap_or_default().join("Cursor/User/workspaceStorage")
}

fn parse_since_date(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let date = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")?;
    Ok(chrono::Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()))
}

/// Conventional locations for an external Ralph loop script, checked when
/// `ralph.external_script` isn't set in config. Mirrors the original
/// implementation's `get_default_script_path` search order.
fn default_ralph_script_path(repo_root: &Path) -> Option<PathBuf> {
    for candidate in [
        repo_root.join("scripts").join("ralph-loop.sh"),
        repo_root.join(".agent").join("scripts").join("ralph-loop.sh"),
    ] {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

async fn run_ralph_external_script(
    driver: &RalphLoopDriver,
    script_path: &Path,
    max_iterations: u32,
) -> Result<()> {
    println!("ralph: delegating to external loop script {}", script_path.display());
    let cancel = AtomicBool::new(false);
    let progress = |event: ProgressEvent| {
        if let ProgressEvent::OutputLine(line) = event {
            println!("  {line}");
        }
    };
    let exit_code = driver
        .run_external_script(script_path, max_iterations, &progress, &cancel)
        .await?;
    if exit_code != 0 {
        anyhow::bail!("ralph loop script exited with status {exit_code}");
    }
    Ok(())
}

async fn run_ralph_loop(driver: &RalphLoopDriver, max_iterations: u32) -> Result<()> {
    let cancel = AtomicBool::new(false);
    let progress = |event: ProgressEvent| match event {
        ProgressEvent::IterationStarted { iteration, item_id } => {
            println!("[{iteration}] starting on {item_id}");
        }
        ProgressEvent::OutputLine(line) => {
            println!("  {line}");
        }
        ProgressEvent::AgentComplete { exit_code } => {
            println!("  agent exited {exit_code}");
        }
        ProgressEvent::ValidationComplete { success, hint } => {
            println!(
                "  validation {}{}",
                if success { "passed" } else { "failed" },
                hint.map(|h| format!(": {h}")).unwrap_or_default()
            );
        }
        ProgressEvent::IterationComplete { outcome, duration_seconds } => {
            println!("  done: {outcome:?} in {duration_seconds:.1}s");
        }
        ProgressEvent::BudgetExceeded { spent_usd, budget_usd } => {
            eprintln!("budget exceeded: spent ${spent_usd:.2} of ${budget_usd:.2}");
        }
    };

    for _ in 0..max_iterations.max(1) {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match driver.run_iteration(&progress, &cancel).await {
            Ok(_) => continue,
            Err(err) => {
                eprintln!("ralph loop stopped: {err}");
                break;
            }
        }
    }
    Ok(())
}
