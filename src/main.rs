// Remedian - autonomous static-analysis remediation agent

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use remedian::agent::service::AgentService;
use remedian::agent::store::SessionStore;
use remedian::agent::types::{AgentConfig, SessionStatus};
use remedian::agent::{AgentTuning, RemediationAgent};
use remedian::analysis::{AnalysisRunner, AnalyzerConfig};
use remedian::config::CONFIG;
use remedian::file_ops::{FileMutator, MutatorConfig};
use remedian::fixer::FixGenerator;
use remedian::ledger::{ChangeLedger, MemoryLogCache};
use remedian::llm::HttpChatClient;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "remedian")]
#[command(about = "Autonomous static-analysis remediation agent")]
#[command(version)]
struct Cli {
    /// Project root to operate on (default: current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a remediation session and follow it to completion (default)
    Run {
        /// Analysis strictness level
        #[arg(short, long)]
        level: Option<u8>,

        /// Iteration budget for the scan-fix loop
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Apply fixes immediately instead of staging them for review
        #[arg(long)]
        auto_apply: bool,

        /// Paths to scan, relative to the project root
        paths: Vec<String>,
    },

    /// List recent sessions
    Sessions {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List fixes staged for review in a session
    Changes { session_id: String },

    /// Apply a staged fix to disk
    Approve { change_id: i64 },

    /// Discard a staged fix
    Reject { change_id: i64 },

    /// Restore the backup of an applied fix
    Revert { change_id: i64 },
}

async fn build_service(root: &PathBuf) -> Result<AgentService> {
    let db = remedian::db::create_pool(&CONFIG.database_url).await?;
    remedian::db::init_schema(&db).await?;

    let store = SessionStore::new(db.clone());
    let ledger = Arc::new(ChangeLedger::new(
        db,
        Arc::new(MemoryLogCache::new()),
        CONFIG.last_log_ttl,
    ));
    let mutator = Arc::new(FileMutator::new(MutatorConfig::from_global(root)));
    let analyzer = Arc::new(AnalysisRunner::new(AnalyzerConfig::from_global(root)));

    let collaborator = HttpChatClient::from_global()?;
    if !collaborator.is_available() {
        anyhow::bail!("no LLM API key configured; set ANTHROPIC_API_KEY");
    }
    let fixer = FixGenerator::new(Arc::new(collaborator));

    let agent = Arc::new(RemediationAgent::new(
        store.clone(),
        ledger.clone(),
        analyzer,
        fixer,
        mutator.clone(),
        AgentTuning::from_global(),
    ));
    Ok(AgentService::new(store, ledger, mutator, agent))
}

async fn run_session(
    service: &AgentService,
    level: Option<u8>,
    max_iterations: Option<u32>,
    auto_apply: bool,
    paths: Vec<String>,
) -> Result<()> {
    let config = AgentConfig::new(
        level.unwrap_or(CONFIG.minimum_level),
        max_iterations.unwrap_or(CONFIG.default_max_iterations),
    )
    .with_auto_apply(auto_apply || CONFIG.auto_apply)
    .with_paths(paths);

    let session_id = service.start(config).await?;
    println!("Session started: {session_id}");

    // Stream log entries until the loop reaches a terminal state.
    let mut cursor = 0i64;
    loop {
        for entry in service.logs_after(&session_id, cursor).await? {
            println!("[{}] {}", entry.log_type, entry.message);
            cursor = entry.id;
        }
        let session = service.status(&session_id).await?;
        if session.status.is_terminal() {
            for entry in service.logs_after(&session_id, cursor).await? {
                println!("[{}] {}", entry.log_type, entry.message);
                cursor = entry.id;
            }
            println!(
                "Session {}: {} ({} scans, {} issues found, {} fixed)",
                session.id,
                session.status.as_str(),
                session.total_scans,
                session.total_issues_found,
                session.total_issues_fixed,
            );
            if session.status == SessionStatus::Failed {
                if let Some(message) = session.error_message {
                    eprintln!("Error: {message}");
                }
                std::process::exit(1);
            }
            let pending = service.pending_changes(&session_id).await?;
            if !pending.is_empty() {
                println!("{} fix(es) awaiting review:", pending.len());
                for change in pending {
                    println!(
                        "  #{} {} - {}",
                        change.id,
                        change.file_path,
                        change.summary.unwrap_or_default()
                    );
                }
                println!("Use `remedian approve <id>` or `remedian reject <id>`.");
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let root = match cli.path {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    info!(root = %root.display(), "Remedian starting");

    let service = build_service(&root).await?;

    match cli.command {
        None => run_session(&service, None, None, false, Vec::new()).await?,
        Some(Commands::Run {
            level,
            max_iterations,
            auto_apply,
            paths,
        }) => run_session(&service, level, max_iterations, auto_apply, paths).await?,
        Some(Commands::Sessions { limit }) => {
            for session in service.list(limit).await? {
                println!(
                    "{}  {:<9}  iter {}/{}  found {}  fixed {}",
                    session.id,
                    session.status.as_str(),
                    session.current_iteration,
                    session.max_iterations,
                    session.total_issues_found,
                    session.total_issues_fixed,
                );
            }
        }
        Some(Commands::Changes { session_id }) => {
            let pending = service.pending_changes(&session_id).await?;
            if pending.is_empty() {
                println!("No pending changes.");
            }
            for change in pending {
                println!(
                    "#{} {} - {}",
                    change.id,
                    change.file_path,
                    change.summary.unwrap_or_default()
                );
            }
        }
        Some(Commands::Approve { change_id }) => {
            service.approve_change(change_id).await?;
            println!("Change {change_id} applied.");
        }
        Some(Commands::Reject { change_id }) => {
            service.reject_change(change_id).await?;
            println!("Change {change_id} rejected.");
        }
        Some(Commands::Revert { change_id }) => {
            service.revert_change(change_id).await?;
            println!("Change {change_id} reverted.");
        }
    }

    Ok(())
}
