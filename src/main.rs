//! scanwarden - command-line entry point.
//!
//! # Overview
//!
//! Initializes:
//! - Logging infrastructure (file rotation + console output on stderr)
//! - Tokio async runtime (4 worker threads for downloads and scanner processes)
//! - Configuration loading ([`ConfigManager`])
//! - One [`WorkspaceContext`] per invocation
//!
//! # Execution Flow
//!
//! 1. Parse arguments and initialize logging → `<log dir>/scanwarden.<date>`
//! 2. Create tokio runtime with 4 worker threads
//! 3. Load `scanwarden.yaml` layered under `SCANWARDEN_*` variables
//! 4. Run the subcommand against a workspace context
//! 5. Shut the context down (watcher, then queue, then scanner processes)
//! 6. Shutdown tokio runtime with 5s timeout

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use scanwarden::models::OutcomeSummary;
use scanwarden::queue::TaskKind;
use scanwarden::services::http::build_client;
use scanwarden::services::{ReleaseSource, VersionResolver};
use scanwarden::{
    APP_NAME, ConfigManager, ScanCategory, ScanOutcome, ScanSettings, StateChange, TaskHandle,
    TaskState, VERSION, WorkspaceContext,
};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "scanwarden", version, about = "Manage the Snyk CLI and run scans against a workspace")]
struct Cli {
    /// Directory holding scanwarden.yaml, install state and downloaded binaries
    #[arg(long, global = true, default_value = "scanwarden-data")]
    config_dir: Utf8PathBuf,

    /// Directory for rotating log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: Utf8PathBuf,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download and install the latest scanner release
    Install,
    /// Run the periodic update check now, if it is due
    Update,
    /// Scan a workspace and print a summary per category
    Scan {
        workspace: Utf8PathBuf,
        /// Categories to run (oss, code, iac, container); defaults to the enabled ones
        #[arg(long = "category", short = 'c')]
        categories: Vec<ScanCategory>,
    },
    /// Scan a workspace, then rescan categories as files change until Ctrl-C
    Watch { workspace: Utf8PathBuf },
    /// Show the installed and latest scanner versions
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match scanwarden::logging::setup_logging(&cli.log_dir, cli.debug, true) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    // Create tokio runtime for downloads and scanner subprocesses
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("scanwarden-worker")
        .build()?;

    tracing::info!("Tokio runtime initialized with {} worker threads", 4);

    let config = ConfigManager::new(&cli.config_dir)?;
    let settings = config.load_settings()?;

    let result = runtime.block_on(dispatch(cli.command, settings, &config));

    // Shutdown the tokio runtime gracefully
    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Shutdown complete");

    result
}

async fn dispatch(command: Command, settings: ScanSettings, config: &ConfigManager) -> Result<ExitCode> {
    let (ctx, outcome) = match command {
        Command::Version => return version(config, &settings).await,
        Command::Install => {
            let ctx = WorkspaceContext::new(current_dir()?, settings, config)?;
            let outcome = install(&ctx).await;
            (ctx, outcome)
        }
        Command::Update => {
            let ctx = WorkspaceContext::new(current_dir()?, settings, config)?;
            let outcome = update(&ctx).await;
            (ctx, outcome)
        }
        Command::Scan { workspace, categories } => {
            let ctx = WorkspaceContext::new(resolve_workspace(&workspace)?, settings, config)?;
            let outcome = scan(&ctx, &categories).await;
            (ctx, outcome)
        }
        Command::Watch { workspace } => {
            let ctx = WorkspaceContext::new(resolve_workspace(&workspace)?, settings, config)?;
            let outcome = watch(&ctx).await;
            (ctx, outcome)
        }
    };

    ctx.shutdown().await;
    outcome
}

fn current_dir() -> Result<Utf8PathBuf> {
    let dir = std::env::current_dir().context("Failed to read the current directory")?;
    Utf8PathBuf::from_path_buf(dir).map_err(|p| anyhow::anyhow!("Non UTF-8 path: {}", p.display()))
}

fn resolve_workspace(workspace: &Utf8Path) -> Result<Utf8PathBuf> {
    let canonical = workspace
        .canonicalize_utf8()
        .with_context(|| format!("Workspace not found: {}", workspace))?;
    if !canonical.is_dir() {
        bail!("Workspace is not a directory: {}", canonical);
    }
    Ok(canonical)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

async fn install(ctx: &WorkspaceContext) -> Result<ExitCode> {
    let handle = ctx.install_latest()?;
    let state = handle.wait().await;
    report_task(&handle, &state);

    let installed = ctx.installed_state();
    if let (TaskState::Succeeded, Some(version)) = (&state, installed.version.as_deref()) {
        println!("Installed Snyk CLI {} at {}", version, ctx.binary_path());
    }
    Ok(exit_code(state == TaskState::Succeeded))
}

async fn update(ctx: &WorkspaceContext) -> Result<ExitCode> {
    let Some(handle) = ctx.check_for_updates()? else {
        println!("Automatic binary management is disabled; nothing to do");
        return Ok(ExitCode::SUCCESS);
    };
    let state = handle.wait().await;
    report_task(&handle, &state);

    match ctx.installed_state().version {
        Some(version) => println!("Installed version: {}", version),
        None => println!("No scanner installed"),
    }
    Ok(exit_code(state == TaskState::Succeeded))
}

fn report_task(handle: &TaskHandle, state: &TaskState) {
    match state {
        TaskState::Succeeded => tracing::info!("{} finished", handle.title()),
        TaskState::Failed(message) => eprintln!("{} failed: {}", handle.title(), message),
        TaskState::Cancelled => eprintln!("{} was cancelled", handle.title()),
        TaskState::Queued | TaskState::Running => {}
    }
}

async fn run_scans(ctx: &WorkspaceContext, categories: &[ScanCategory]) -> Result<Vec<ScanCategory>> {
    let handles = if categories.is_empty() {
        ctx.scan_enabled()?
    } else {
        categories
            .iter()
            .map(|c| ctx.request_scan(*c))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut ran = Vec::with_capacity(handles.len());
    for handle in handles {
        handle.wait().await;
        if let TaskKind::Scan(category) = handle.kind() {
            ran.push(category);
        }
    }
    Ok(ran)
}

fn print_outcome(category: ScanCategory, outcome: &ScanOutcome) {
    println!("{}: {}", category.display_name(), outcome.summary());
    for issue in outcome.issues() {
        println!("  [{:?}] {} ({})", issue.severity, issue.title, issue.location);
    }
    if let Some((message, path)) = outcome.error() {
        if message.lines().count() > 1 {
            println!("  {} at {}", message.trim(), path);
        }
    }
}

async fn scan(ctx: &WorkspaceContext, categories: &[ScanCategory]) -> Result<ExitCode> {
    let ran = run_scans(ctx, categories).await?;
    if ran.is_empty() {
        println!("No scan categories enabled");
        return Ok(ExitCode::SUCCESS);
    }

    let mut all_ok = true;
    println!("Results for {}", ctx.workspace());
    for category in ran {
        match ctx.result(category) {
            Some(entry) => {
                all_ok &= !matches!(
                    entry.outcome,
                    ScanOutcome::StructuredError { .. } | ScanOutcome::UnstructuredError { .. }
                );
                print_outcome(category, &entry.outcome);
            }
            None => {
                all_ok = false;
                println!("{}: no result", category.display_name());
            }
        }
    }
    Ok(exit_code(all_ok))
}

async fn watch(ctx: &WorkspaceContext) -> Result<ExitCode> {
    // Subscribe before the first scan so no event is missed
    let mut events = ctx.subscribe();
    ctx.watch_filesystem()?;
    if let Some(handle) = ctx.check_for_updates()? {
        tracing::debug!("Queued {}", handle.title());
    }
    ctx.scan_enabled()?;
    println!("Watching {} (Ctrl-C to stop)", ctx.workspace());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(StateChange::ResultsStale { category, paths }) => {
                    println!("{} results stale ({} changed files), rescanning", category.display_name(), paths.len());
                    ctx.request_scan(category)?;
                }
                Ok(StateChange::ScanFinished { category, outcome }) => match outcome {
                    OutcomeSummary::Succeeded { issue_count } => {
                        println!("{}: {} issues", category.display_name(), issue_count)
                    }
                    OutcomeSummary::Failed { message } => {
                        println!("{}: error: {}", category.display_name(), message)
                    }
                    OutcomeSummary::Cancelled => println!("{}: cancelled", category.display_name()),
                },
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} state events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn version(config: &ConfigManager, settings: &ScanSettings) -> Result<ExitCode> {
    let store = config.install_state_store()?;
    let installed = store.snapshot();
    println!("{} {}", APP_NAME, VERSION);
    match (&installed.version, &installed.path) {
        (Some(version), Some(path)) => println!("Installed Snyk CLI: {} ({})", version, path),
        (Some(version), None) => println!("Installed Snyk CLI: {}", version),
        _ => println!("Installed Snyk CLI: none"),
    }

    let client = build_client(settings).context("Failed to build HTTP client")?;
    let resolver = VersionResolver::new(client, settings.release_metadata_url.clone());
    match resolver.latest_release().await {
        Some(release) => println!("Latest release: {}", release.version()),
        None => println!("Latest release: unavailable"),
    }
    Ok(ExitCode::SUCCESS)
}
