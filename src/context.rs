//! Per-workspace owner of every subsystem.
//!
//! A [`WorkspaceContext`] is built once per workspace and torn down with
//! [`WorkspaceContext::shutdown`], which stops the file watcher, then drains
//! the task queue (killing any live scanner process), in that order.

use crate::cache::{CacheEntry, ChangeFilter, FileChangeWatcher, FileEvent, FsEventSource, ResultCache};
use crate::cache::watcher::DEBOUNCE_WINDOW;
use crate::cancel::CancellationToken;
use crate::config::{ConfigManager, InstallStateStore};
use crate::metrics::Metrics;
use crate::models::{
    InstalledBinaryState, ReleaseInfo, ScanCategory, ScanOutcome, ScanRequest, ScanSettings,
};
use crate::progress::ProgressReporter;
use crate::queue::{QueueError, TaskContext, TaskExit, TaskHandle, TaskKind, TaskQueue};
use crate::services::http::build_client;
use crate::services::{
    BinaryInstall, BinaryInstaller, InstallError, Platform, ProcessRunner, ReleaseSource,
    UpdateOutcome, UpdateScheduler, VersionResolver, build_scan_command,
};
use crate::state::{StateChange, StateManager};
use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::broadcast;

/// Installer wrapper that reports downloads to state and metrics.
struct ObservedInstaller {
    inner: Arc<dyn BinaryInstall>,
    state: StateManager,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl BinaryInstall for ObservedInstaller {
    async fn download_and_install(
        &self,
        release: &ReleaseInfo,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<InstalledBinaryState, InstallError> {
        self.state.start_download();
        let result = self.inner.download_and_install(release, cancel, progress).await;

        match &result {
            Ok(installed) => {
                self.metrics.record_download(true);
                self.state.finish_download(true, installed.version.clone());
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.metrics.record_download(false);
                    tracing::error!("Scanner download failed: {}", e);
                }
                self.state.finish_download(false, None);
            }
        }
        result
    }
}

/// Everything one workspace needs, wired together.
pub struct WorkspaceContext {
    workspace: Utf8PathBuf,
    settings: Arc<ScanSettings>,
    binary_path: Utf8PathBuf,
    store: Arc<InstallStateStore>,
    scheduler: Arc<UpdateScheduler>,
    runner: ProcessRunner,
    queue: Arc<TaskQueue>,
    cache: Arc<ResultCache>,
    watcher: FileChangeWatcher,
    fs_source: Mutex<Option<FsEventSource>>,
    state: StateManager,
    metrics: Arc<Metrics>,
    shut_down: AtomicBool,
}

impl WorkspaceContext {
    /// Build a context with the HTTP resolver and installer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        workspace: impl Into<Utf8PathBuf>,
        settings: ScanSettings,
        config: &ConfigManager,
    ) -> Result<Self> {
        let platform = Platform::current().context("Cannot pick a scanner artifact for this host")?;
        let binary_path = config.binary_path(&settings, platform.file_name());
        let store = Arc::new(config.install_state_store()?);
        let client = build_client(&settings).context("Failed to build HTTP client")?;

        let source: Arc<dyn ReleaseSource> = Arc::new(VersionResolver::new(
            client.clone(),
            settings.release_metadata_url.clone(),
        ));
        let installer: Arc<dyn BinaryInstall> = Arc::new(BinaryInstaller::new(
            client,
            settings.cli_base_download_url.clone(),
            platform,
            binary_path.clone(),
            store.clone(),
        ));

        Ok(Self::with_components(
            workspace.into(),
            settings,
            binary_path,
            store,
            source,
            installer,
        ))
    }

    /// Build a context around caller-supplied release source and installer.
    pub fn with_components(
        workspace: Utf8PathBuf,
        settings: ScanSettings,
        binary_path: Utf8PathBuf,
        store: Arc<InstallStateStore>,
        source: Arc<dyn ReleaseSource>,
        installer: Arc<dyn BinaryInstall>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let state = StateManager::new().with_metrics(metrics.clone());
        state.set_installed_version(store.snapshot().version);

        let installer: Arc<dyn BinaryInstall> = Arc::new(ObservedInstaller {
            inner: installer,
            state: state.clone(),
            metrics: metrics.clone(),
        });
        let scheduler = Arc::new(UpdateScheduler::new(source, installer, store.clone()));

        let cache = Arc::new(ResultCache::with_metrics(metrics.clone()));
        let filter = ChangeFilter::new(workspace.clone(), DEBOUNCE_WINDOW)
            .with_categories(settings.categories.enabled());
        let watcher = FileChangeWatcher::spawn(filter, cache.clone(), state.clone(), Some(metrics.clone()));

        let queue = Arc::new(TaskQueue::new(workspace.as_str()));
        let runner = ProcessRunner::from_settings(&settings);

        tracing::info!("Workspace context ready for {}", workspace);

        Self {
            workspace,
            settings: Arc::new(settings),
            binary_path,
            store,
            scheduler,
            runner,
            queue,
            cache,
            watcher,
            fs_source: Mutex::new(None),
            state,
            metrics,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn binary_path(&self) -> &Utf8Path {
        &self.binary_path
    }

    pub fn installed_state(&self) -> InstalledBinaryState {
        self.store.snapshot()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    /// Enqueue `body`, keeping the queue fields of the workspace state current.
    fn enqueue_tracked<F, Fut>(
        &self,
        kind: TaskKind,
        title: String,
        body: F,
    ) -> Result<TaskHandle, QueueError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskExit> + Send + 'static,
    {
        let queue: Weak<TaskQueue> = Arc::downgrade(&self.queue);
        let state = self.state.clone();
        let task_title = title.clone();

        let handle = self.queue.enqueue(kind, title, move |ctx| async move {
            let pending = || queue.upgrade().map(|q| q.pending_count()).unwrap_or(0);
            state.set_queue(pending(), Some(task_title));
            let exit = body(ctx).await;
            state.set_queue(pending(), None);
            exit
        })?;

        let current = self.queue.current_task().map(|h| h.title().to_string());
        self.state.set_queue(self.queue.pending_count(), current);
        Ok(handle)
    }

    /// Queue a scan of one category.
    ///
    /// If a scan of that category is already waiting, its handle is returned
    /// instead of queueing a second one.
    pub fn request_scan(&self, category: ScanCategory) -> Result<TaskHandle, QueueError> {
        if let Some(waiting) = self
            .queue
            .pending()
            .into_iter()
            .find(|h| h.kind() == TaskKind::Scan(category))
        {
            return Ok(waiting);
        }

        let request = ScanRequest::new(category, self.workspace.clone());
        let job = ScanJob {
            request,
            settings: self.settings.clone(),
            binary_path: self.binary_path.clone(),
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            runner: self.runner.clone(),
            cache: self.cache.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        };

        self.enqueue_tracked(
            TaskKind::Scan(category),
            format!("{} scan", category.display_name()),
            move |ctx| job.run(ctx),
        )
    }

    /// Queue scans of every enabled category.
    pub fn scan_enabled(&self) -> Result<Vec<TaskHandle>, QueueError> {
        self.settings
            .categories
            .enabled()
            .into_iter()
            .map(|category| self.request_scan(category))
            .collect()
    }

    fn binary_present(&self) -> bool {
        self.binary_path.is_file()
    }

    /// Queue an install if no scanner binary is present.
    ///
    /// Returns `None` when the binary already exists.
    pub fn ensure_binary(&self) -> Result<Option<TaskHandle>, QueueError> {
        if self.binary_present() {
            return Ok(None);
        }
        tracing::info!("No scanner at {}, queueing download", self.binary_path);
        self.install_latest().map(Some)
    }

    /// Queue a download of the latest release regardless of schedule.
    pub fn install_latest(&self) -> Result<TaskHandle, QueueError> {
        let scheduler = self.scheduler.clone();
        self.enqueue_tracked(
            TaskKind::Install,
            "Download Snyk CLI".to_string(),
            move |ctx| async move {
                match scheduler.force_install(&ctx.cancel, &ctx.progress).await {
                    Ok(Some(installed)) => {
                        tracing::info!("Installed {:?}", installed.version);
                        TaskExit::Succeeded
                    }
                    Ok(None) => TaskExit::Failed("Could not resolve the latest release".to_string()),
                    Err(e) if e.is_cancelled() => TaskExit::Cancelled,
                    Err(e) => TaskExit::Failed(e.user_message()),
                }
            },
        )
    }

    /// Queue a silent update check.
    ///
    /// Returns `None` when binaries are managed by the user.
    pub fn check_for_updates(&self) -> Result<Option<TaskHandle>, QueueError> {
        if !self.settings.manage_binaries_automatically || self.settings.cli_path.is_some() {
            tracing::debug!("Binary updates are managed manually, skipping check");
            return Ok(None);
        }

        let scheduler = self.scheduler.clone();
        self.enqueue_tracked(
            TaskKind::Install,
            "Check for Snyk CLI updates".to_string(),
            move |ctx| async move {
                match scheduler.silent_update(&ctx.cancel, &ctx.progress).await {
                    Ok(UpdateOutcome::Updated(state)) => {
                        tracing::info!("Scanner updated to {:?}", state.version);
                        TaskExit::Succeeded
                    }
                    Ok(other) => {
                        tracing::debug!("Update check finished: {:?}", other);
                        TaskExit::Succeeded
                    }
                    Err(e) if e.is_cancelled() => TaskExit::Cancelled,
                    Err(e) => TaskExit::Failed(e.user_message()),
                }
            },
        )
        .map(Some)
    }

    /// Fresh cached result for one category.
    pub fn result(&self, category: ScanCategory) -> Option<CacheEntry> {
        self.cache.get(category, &self.workspace)
    }

    /// All cached entries of this workspace, obsolete ones included.
    pub fn results(&self) -> Vec<CacheEntry> {
        self.cache.entries(&self.workspace)
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Feed a batch of file events to the watcher without blocking.
    pub fn submit_file_events(&self, batch: Vec<FileEvent>) -> bool {
        self.watcher.submit(batch)
    }

    /// Wait until submitted file events have been applied.
    pub async fn flush_file_events(&self) {
        self.watcher.flush().await;
    }

    /// Start forwarding OS file events for the workspace.
    pub fn watch_filesystem(&self) -> Result<()> {
        let source = FsEventSource::start(&self.workspace, self.watcher.sink())?;
        *self.fs_source.lock().unwrap() = Some(source);
        Ok(())
    }

    /// Cancel the running task and drop pending ones; the queue stays usable.
    pub async fn stop(&self) {
        self.queue.stop().await;
        self.state.queue_stopped();
    }

    /// Tear down: file watcher, then task queue, then subprocesses.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down workspace context for {}", self.workspace);

        let fs_source = self.fs_source.lock().unwrap().take();
        drop(fs_source);
        self.watcher.shutdown().await;

        // Cancelling the running task kills its scanner process
        self.queue.shutdown().await;
        self.state.queue_stopped();

        self.metrics.log_summary();
    }
}

/// Everything a queued scan needs, owned by the task.
struct ScanJob {
    request: ScanRequest,
    settings: Arc<ScanSettings>,
    binary_path: Utf8PathBuf,
    store: Arc<InstallStateStore>,
    scheduler: Arc<UpdateScheduler>,
    runner: ProcessRunner,
    cache: Arc<ResultCache>,
    state: StateManager,
    metrics: Arc<Metrics>,
}

impl ScanJob {
    async fn run(self, ctx: TaskContext) -> TaskExit {
        let category = self.request.category;
        let workspace = self.request.workspace_path.clone();

        if ctx.cancel.is_cancelled() {
            return TaskExit::Cancelled;
        }

        self.state.start_scan(category);
        let started = Instant::now();

        let outcome = match self.resolve_binary(&ctx).await {
            Ok(binary) => {
                ctx.progress
                    .set_text(format!("Scanning {} ({})", workspace, category.display_name()));
                ctx.progress.set_indeterminate();
                let argv = build_scan_command(&binary, &self.request, &self.settings);
                self.runner
                    .run_scan(&argv, &self.request, self.settings.token.as_ref(), &ctx.cancel)
                    .await
            }
            Err(outcome) => outcome,
        };

        self.metrics.record_scan(
            outcome.is_successful(),
            outcome.is_cancelled(),
            started.elapsed(),
        );
        tracing::info!("{} scan of {}: {}", category, workspace, outcome.summary());

        self.cache.store(category, &workspace, outcome.clone());
        self.state.finish_scan(category, &outcome);

        match outcome {
            ScanOutcome::Success { .. } => TaskExit::Succeeded,
            ScanOutcome::Cancelled => TaskExit::Cancelled,
            other => TaskExit::Failed(other.summary()),
        }
    }

    /// Path of a usable binary, installing one first if allowed.
    ///
    /// Runs on the queue worker, so nothing else can be replacing the binary.
    async fn resolve_binary(&self, ctx: &TaskContext) -> Result<Utf8PathBuf, ScanOutcome> {
        if self.binary_path.is_file() {
            return Ok(self.binary_path.clone());
        }

        let workspace = self.request.workspace_path.clone();
        if !self.settings.auto_download || self.settings.cli_path.is_some() {
            return Err(ScanOutcome::UnstructuredError {
                message: format!(
                    "Snyk CLI is not installed at {}. Enable automatic downloads or point cli_path at an existing binary.",
                    self.binary_path
                ),
                path: workspace,
            });
        }

        ctx.progress.set_text("Downloading Snyk CLI");
        match self.scheduler.force_install(&ctx.cancel, &ctx.progress).await {
            Ok(Some(_)) => {
                let installed = self.store.snapshot().path;
                Ok(installed.unwrap_or_else(|| self.binary_path.clone()))
            }
            Ok(None) => Err(ScanOutcome::UnstructuredError {
                message: "Snyk CLI is not installed and the latest release could not be resolved."
                    .to_string(),
                path: workspace,
            }),
            Err(e) if e.is_cancelled() => Err(ScanOutcome::Cancelled),
            Err(e) => Err(ScanOutcome::UnstructuredError {
                message: e.user_message(),
                path: workspace,
            }),
        }
    }
}
