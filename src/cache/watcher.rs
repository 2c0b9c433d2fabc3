//! Debounced cache invalidation driven by filesystem events.
//!
//! Events arrive in batches, either from [`FsEventSource`] (the OS watcher)
//! or from [`EventSink::submit`]. Per batch the [`ChangeFilter`]:
//!
//! 1. drops repeat events for a path inside the debounce window
//! 2. drops paths outside the workspace or under VCS/IDE metadata directories
//! 3. maps each surviving path to the categories whose result may depend on it
//!
//! The [`FileChangeWatcher`] worker then marks those cache entries obsolete and
//! publishes [`StateChange::ResultsStale`](crate::state::StateChange::ResultsStale).
//! It never triggers a rescan.

use crate::cache::ResultCache;
use crate::metrics::Metrics;
use crate::models::ScanCategory;
use crate::state::StateManager;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Window inside which repeat events for one path are ignored.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(1000);

/// Directories whose contents never affect scan results.
pub const IGNORED_DIRS: [&str; 4] = [".git", ".hg", ".svn", ".idea"];

/// Dependency manifests and lock files read by open-source scans.
pub const OSS_MANIFESTS: &[&str] = &[
    "yarn.lock",
    "package-lock.json",
    "package.json",
    "Gemfile",
    "Gemfile.lock",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "build.sbt",
    "Pipfile",
    "requirements.txt",
    "Gopkg.lock",
    "go.mod",
    "vendor.json",
    "project.assets.json",
    "packages.config",
    "paket.dependencies",
    "composer.lock",
    "Podfile",
    "Podfile.lock",
    "pyproject.toml",
    "poetry.lock",
    ".snyk",
];

pub const IAC_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "tf"];

const CONTAINER_EXTENSIONS: &[&str] = &["yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// One filesystem change, consumed once by the debounce stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: Utf8PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<Utf8PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Per-path debounce with an injectable clock.
#[derive(Debug)]
pub struct DebounceFilter {
    window: Duration,
    last_seen: HashMap<Utf8PathBuf, Instant>,
}

impl DebounceFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// `true` if `path` was not accepted within the window before `now`.
    ///
    /// Suppressed events do not extend the window.
    pub fn accept(&mut self, path: &Utf8Path, now: Instant) -> bool {
        match self.last_seen.get(path) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                self.last_seen.insert(path.to_path_buf(), now);
                true
            }
        }
    }

    /// Forget paths whose window has passed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last_seen
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

/// `true` for paths outside `workspace` or inside an ignored directory.
pub fn is_ignored_path(workspace: &Utf8Path, path: &Utf8Path) -> bool {
    match path.strip_prefix(workspace) {
        Ok(relative) => relative
            .components()
            .any(|c| IGNORED_DIRS.contains(&c.as_str())),
        Err(_) => true,
    }
}

/// Categories whose scan result may depend on `path`.
pub fn affected_categories(path: &Utf8Path) -> Vec<ScanCategory> {
    let file_name = path.file_name().unwrap_or_default();
    let extension = path.extension().map(str::to_ascii_lowercase);
    let has_extension = |list: &[&str]| extension.as_deref().is_some_and(|e| list.contains(&e));

    let mut categories = Vec::with_capacity(4);
    if OSS_MANIFESTS.contains(&file_name) {
        categories.push(ScanCategory::Oss);
    }
    categories.push(ScanCategory::Code);
    if has_extension(IAC_EXTENSIONS) {
        categories.push(ScanCategory::Iac);
    }
    if has_extension(CONTAINER_EXTENSIONS)
        || file_name == "Dockerfile"
        || file_name.starts_with("Dockerfile.")
    {
        categories.push(ScanCategory::Container);
    }
    categories
}

/// Turns event batches into per-category invalidations.
#[derive(Debug)]
pub struct ChangeFilter {
    workspace: Utf8PathBuf,
    categories: Vec<ScanCategory>,
    debounce: DebounceFilter,
}

impl ChangeFilter {
    pub fn new(workspace: impl Into<Utf8PathBuf>, window: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            categories: ScanCategory::ALL.to_vec(),
            debounce: DebounceFilter::new(window),
        }
    }

    /// Only report these categories.
    pub fn with_categories(mut self, categories: Vec<ScanCategory>) -> Self {
        self.categories = categories;
        self
    }

    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    /// Paths per category that invalidate that category's cached result.
    pub fn plan(
        &mut self,
        batch: &[FileEvent],
        now: Instant,
    ) -> BTreeMap<ScanCategory, Vec<Utf8PathBuf>> {
        let mut plan: BTreeMap<ScanCategory, Vec<Utf8PathBuf>> = BTreeMap::new();

        for event in batch {
            if !self.debounce.accept(&event.path, now) {
                tracing::trace!("Debounced {:?} on {}", event.kind, event.path);
                continue;
            }
            if is_ignored_path(&self.workspace, &event.path) {
                continue;
            }

            for category in affected_categories(&event.path) {
                if self.categories.contains(&category) {
                    plan.entry(category).or_default().push(event.path.clone());
                }
            }
        }

        self.debounce.prune(now);
        plan
    }
}

enum Command {
    Batch(Vec<FileEvent>),
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Cloneable, non-blocking entry point for event batches.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventSink {
    /// Hand a batch to the watcher worker. Returns `false` once it has stopped.
    pub fn submit(&self, batch: Vec<FileEvent>) -> bool {
        if batch.is_empty() {
            return true;
        }
        self.tx.send(Command::Batch(batch)).is_ok()
    }
}

/// Async worker applying [`ChangeFilter`] plans to the cache.
pub struct FileChangeWatcher {
    sink: EventSink,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileChangeWatcher {
    pub fn spawn(
        filter: ChangeFilter,
        cache: Arc<ResultCache>,
        state: StateManager,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_watcher(filter, rx, cache, state, metrics));

        Self {
            sink: EventSink { tx },
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn submit(&self, batch: Vec<FileEvent>) -> bool {
        self.sink.submit(batch)
    }

    /// Wait until every batch submitted so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sink.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the worker after it drains what is already queued.
    pub async fn shutdown(&self) {
        let _ = self.sink.tx.send(Command::Stop);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("File watcher worker ended abnormally: {}", e);
            }
        }
    }
}

async fn run_watcher(
    mut filter: ChangeFilter,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cache: Arc<ResultCache>,
    state: StateManager,
    metrics: Option<Arc<Metrics>>,
) {
    tracing::debug!("File watcher started for {}", filter.workspace());

    while let Some(command) = rx.recv().await {
        match command {
            Command::Batch(batch) => {
                let plan = filter.plan(&batch, Instant::now());
                for (category, paths) in plan {
                    let was_fresh = cache.mark_obsolete(category, filter.workspace());
                    if let Some(m) = &metrics {
                        m.record_invalidation();
                    }
                    tracing::debug!(
                        "{} results for {} may be stale ({} changed path(s), cached={})",
                        category,
                        filter.workspace(),
                        paths.len(),
                        was_fresh
                    );
                    state.mark_results_stale(category, paths);
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Stop => break,
        }
    }

    tracing::debug!("File watcher stopped for {}", filter.workspace());
}

/// Bridges the OS file watcher into [`FileEvent`] batches.
///
/// Watching stops when this value is dropped.
pub struct FsEventSource {
    _watcher: notify::RecommendedWatcher,
}

impl FsEventSource {
    pub fn start(workspace: &Utf8Path, sink: EventSink) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    sink.submit(map_notify_event(event));
                }
                Err(e) => tracing::warn!("File watcher error: {}", e),
            }
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(workspace.as_std_path(), RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", workspace))?;
        tracing::info!("Watching {} for changes", workspace);

        Ok(Self { _watcher: watcher })
    }
}

/// Translate one OS event; access and unknown events yield nothing.
pub fn map_notify_event(event: notify::Event) -> Vec<FileEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileEventKind::Created,
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileEventKind::Moved,
        EventKind::Modify(_) => FileEventKind::Modified,
        EventKind::Remove(_) => FileEventKind::Deleted,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter_map(|p| Utf8PathBuf::from_path_buf(p).ok())
        .map(|path| FileEvent { path, kind })
        .collect()
}
