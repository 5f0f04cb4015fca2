use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use mailvault::config::AppConfig;
use mailvault::context::AppContext;
use mailvault::core::identity;
use mailvault::core::{
    BackupOrchestrator, BackupRequest, BackupTarget, ContentType, ResolvePolicy,
    RestoreOrchestrator, RestoreRequest, Session, TimeRange,
};
use mailvault::db::{self, SessionStore};
use mailvault::logging::{self, LogConfig};
use mailvault::process::{self, Detached};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::{Builder, Runtime};
use tracing::error;

#[derive(Parser)]
#[command(name = "mailvault")]
#[command(about = "Mailbox backup and restore for the mail platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging, mirrored to stdout
    #[arg(long, global = true)]
    debug: bool,

    /// Use simulated collaborators instead of the mail platform
    #[arg(long, global = true)]
    simulation: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a full backup
    Backup(BackupArgs),
    /// Restore one account from a backup session
    Restore(RestoreArgs),
    /// Abort the running backup session
    Abort { label: String },
    /// List backup sessions
    Sessions {
        label: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
#[group(id = "what", required = true, multiple = false)]
struct BackupTargetArgs {
    /// Back up every account
    #[arg(long)]
    all: bool,

    /// Back up a comma-separated list of accounts
    #[arg(short = 'a', long, value_name = "ACCOUNTS")]
    accounts: Option<String>,

    /// Back up the directory service only
    #[arg(long)]
    ldap: bool,
}

#[derive(Args)]
struct BackupArgs {
    #[command(flatten)]
    what: BackupTargetArgs,

    /// Content to back up (default: all)
    #[arg(long, value_enum, value_delimiter = ',')]
    ctypes: Vec<ContentType>,

    /// Start of the time range, YYYYmmddHHMMSS
    #[arg(long)]
    from_time: Option<String>,

    /// End of the time range, YYYYmmddHHMMSS (default: now)
    #[arg(long, requires = "from_time")]
    to_time: Option<String>,

    /// Backup root (default from configuration)
    #[arg(long)]
    target: Option<PathBuf>,

    /// Run in the foreground
    #[arg(long)]
    sync: bool,
}

impl BackupArgs {
    fn request(&self) -> Result<BackupRequest> {
        let target = if self.what.all {
            BackupTarget::All
        } else if self.what.ldap {
            BackupTarget::DirectoryOnly
        } else {
            BackupTarget::parse(self.what.accounts.as_deref().unwrap_or_default())?
        };

        let range = match &self.from_time {
            Some(from) => Some(TimeRange::parse(from, self.to_time.as_deref(), Local::now())?),
            None => None,
        };

        Ok(BackupRequest {
            target,
            types: self.ctypes.clone(),
            range,
        })
    }
}

#[derive(Args)]
struct RestoreArgs {
    /// Account whose archive is restored
    #[arg(short = 'a', long)]
    account: String,

    /// Session label holding the archive
    #[arg(long)]
    label: String,

    /// Account receiving the content (default: the source account)
    #[arg(long)]
    dest_account: Option<String>,

    #[arg(long, value_enum, default_value_t = ResolvePolicy::Ignore)]
    resolve: ResolvePolicy,

    /// Folder to restore into
    #[arg(long)]
    dest_folder: Option<String>,

    /// Content to restore (default: all)
    #[arg(long, value_enum, value_delimiter = ',')]
    ctypes: Vec<ContentType>,

    /// Backup root (default from configuration)
    #[arg(long)]
    target: Option<PathBuf>,

    /// Run in the foreground
    #[arg(long)]
    sync: bool,
}

#[derive(Serialize)]
struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    backup_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<bool>,
}

/// Set in the background child. Its errors go to the log only.
static DETACHED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "mailvault failed");
            if !DETACHED.load(Ordering::Relaxed) {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let target = match &cli.command {
        Commands::Backup(args) => args.target.clone(),
        Commands::Restore(args) => args.target.clone(),
        _ => None,
    };
    let overrides = ConfigOverrides {
        backup_root: target,
        verbose: cli.debug.then_some(true),
        simulation: cli.simulation.then_some(true),
    };
    let config = AppConfig::new(cli.config.as_deref(), Some(&overrides))?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
        file: config.log_file.clone(),
    })?;

    match cli.command {
        Commands::Backup(args) => run_backup(config, args),
        Commands::Restore(args) => run_restore(config, args),
        Commands::Abort { label } => run_abort(config, &label),
        Commands::Sessions { label, json } => run_sessions(config, label.as_deref(), json),
    }
}

/// Runtime for the foreground part of a command. It is dropped before
/// detaching so that the fork happens single-threaded.
fn planning_runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn run_runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Forks into the background unless `sync`. Returns false in the parent,
/// which should exit.
fn continue_in_background(sync: bool, what: &str) -> Result<bool> {
    if sync {
        return Ok(true);
    }
    match process::detach()? {
        Detached::Parent { child } => {
            println!("{} started in background (pid {})", what, child);
            Ok(false)
        }
        Detached::Child => {
            DETACHED.store(true, Ordering::Relaxed);
            Ok(true)
        }
    }
}

fn run_backup(config: AppConfig, args: BackupArgs) -> Result<()> {
    identity::check_run_as(config.run_as_user.as_deref())?;
    let request = args.request()?;
    let metadata_store = config.metadata_store.clone();
    let ctx = AppContext::from_config(config)?;
    let orchestrator = BackupOrchestrator::new(ctx);

    // The planning runtime is dropped at the end of this statement, which
    // joins its worker threads.
    let plan = planning_runtime()?.block_on(orchestrator.plan(request))?;
    println!("{}", plan.label);

    if !continue_in_background(args.sync, "Backup")? {
        return Ok(());
    }

    run_runtime()?.block_on(async {
        process::cancel_on_termination(orchestrator.cancellation_token())?;
        let store = SessionStore::open(&metadata_store).await?;
        let result = orchestrator.run(&store, &plan).await;
        store.close().await?;
        let session = result?;
        if args.sync {
            println!("{}: {}", session.label, session.status);
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn run_restore(config: AppConfig, args: RestoreArgs) -> Result<()> {
    identity::check_run_as(config.run_as_user.as_deref())?;
    let ctx = AppContext::from_config(config)?;
    let orchestrator = RestoreOrchestrator::new(ctx);

    let request = RestoreRequest {
        label: args.label,
        source_account: args.account,
        dest_account: args.dest_account,
        resolve: args.resolve,
        dest_folder: args.dest_folder,
        types: args.ctypes,
    };

    let plan = planning_runtime()?.block_on(orchestrator.plan(request))?;

    if !continue_in_background(args.sync, "Restore")? {
        return Ok(());
    }

    run_runtime()?.block_on(orchestrator.run(&plan))?;
    Ok(())
}

fn run_abort(config: AppConfig, label: &str) -> Result<()> {
    identity::check_run_as(config.run_as_user.as_deref())?;
    let grace = config.abort_grace();

    run_runtime()?.block_on(async {
        let store = SessionStore::open(&config.metadata_store).await?;
        let outcome = mailvault::core::abort(&store, label, grace).await;
        store.close().await?;
        println!("{}", outcome?);
        Ok::<(), anyhow::Error>(())
    })
}

#[derive(Serialize)]
struct SessionView<'a> {
    #[serde(flatten)]
    session: &'a Session,
    interrupted: bool,
}

fn run_sessions(config: AppConfig, label: Option<&str>, json: bool) -> Result<()> {
    planning_runtime()?.block_on(async {
        let store = SessionStore::open(&config.metadata_store).await?;
        let sessions = match label {
            Some(label) => store
                .session(label)
                .await?
                .with_context(|| format!("label does not exist: {}", label))
                .map(|session| vec![session])?,
            None => store.sessions().await?,
        };
        let holder = store.live_lock_holder().await?;
        store.close().await?;

        let views: Vec<SessionView> = sessions
            .iter()
            .map(|session| SessionView {
                session,
                interrupted: db::is_interrupted(session, holder.as_ref()),
            })
            .collect();

        if json {
            println!("{}", serde_json::to_string_pretty(&views)?);
            return Ok(());
        }

        for view in &views {
            let session = view.session;
            let status = if view.interrupted {
                "interrupted".to_string()
            } else {
                session.status.to_string()
            };
            println!(
                "{}  {:<21}  {}  {}  {}/{} ok, {} failed",
                session.label,
                status,
                format_time(Some(session.start_time)),
                format_time(session.end_time),
                session.accounts.len(),
                session.total_accounts,
                session.fail_accounts.len()
            );
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn format_time(time: Option<DateTime<Local>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".repeat(19))
}
