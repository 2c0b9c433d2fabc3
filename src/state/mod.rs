// State management module
//
// This module provides the StateManager which wraps WorkspaceState with
// thread-safe access using Arc<RwLock<T>> and emits change events for the
// presentation layer.

use crate::metrics::Metrics;
use crate::models::{OutcomeSummary, ScanCategory, ScanOutcome, WorkspaceState};
use camino::Utf8PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when state is modified
///
/// These events notify interested parties (UI, CLI output) about state
/// changes without requiring them to poll the state.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A scan of this category started running
    ScanStarted { category: ScanCategory },

    /// A scan of this category finished
    ScanFinished {
        category: ScanCategory,
        outcome: OutcomeSummary,
    },

    /// Binary download started
    DownloadStarted,

    /// Binary download finished
    DownloadFinished { success: bool },

    /// The installed scanner version changed
    InstalledVersionChanged { version: Option<String> },

    /// Cached results of this category may no longer match the workspace
    ResultsStale {
        category: ScanCategory,
        paths: Vec<Utf8PathBuf>,
    },

    /// Queue length or running task changed
    QueueChanged {
        queued: usize,
        current: Option<String>,
    },

    /// The task queue was stopped
    QueueStopped,
}

/// Thread-safe state manager with event emission
///
/// This is the central state component that:
/// - Provides thread-safe access to [`WorkspaceState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`StateChange`] events
/// - Supports subscribing to state changes via tokio broadcast channels
///
/// # Usage
///
/// Always use `StateManager` instead of mutating [`WorkspaceState`] directly:
/// - [`read()`](Self::read) for reading state under the lock
/// - [`update()`](Self::update) for mutations with automatic event emission
/// - [`subscribe()`](Self::subscribe) for listening to state changes
///
/// # Related Types
///
/// - [`crate::models::WorkspaceState`]: The underlying state structure
/// - [`crate::context::WorkspaceContext`]: Drives scans and downloads through this manager
/// - [`crate::cache::FileChangeWatcher`]: Publishes [`StateChange::ResultsStale`]
pub struct StateManager {
    /// The workspace state protected by RwLock for thread-safe access
    state: Arc<RwLock<WorkspaceState>>,

    /// Broadcast channel for emitting state change events
    /// Multiple subscribers can listen for state changes
    state_tx: broadcast::Sender<StateChange>,

    metrics: Option<Arc<Metrics>>,
}

impl StateManager {
    /// Create a new StateManager with default state
    ///
    /// # Returns
    /// A new StateManager with a broadcast channel buffer of 100 events
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(WorkspaceState::default())),
            state_tx,
            metrics: None,
        }
    }

    /// Count broadcasts in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get a read-only snapshot of the current state
    pub fn snapshot(&self) -> WorkspaceState {
        self.state.read().unwrap().clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let busy = state_manager.read(|state| state.is_busy());
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&WorkspaceState) -> R,
    {
        let state = self.state.read().unwrap();
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// This is the primary way to modify state. It:
    /// 1. Captures the old state
    /// 2. Applies the update function
    /// 3. Detects what changed
    /// 4. Emits appropriate events
    ///
    /// # Returns
    /// A vector of StateChange events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut WorkspaceState),
    {
        let mut state = self.state.write().unwrap();
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = Self::detect_changes(&old_state, &state);
        for change in &changes {
            self.emit(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    ///
    /// Returns a receiver that will get notified of all future state changes.
    /// Multiple subscribers can listen simultaneously.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn emit(&self, change: StateChange) {
        // Ignore send errors - it's OK if no one is listening
        let _ = self.state_tx.send(change);
        if let Some(m) = &self.metrics {
            m.record_state_broadcast();
        }
    }

    /// Detect what changed between two states and generate events
    fn detect_changes(old: &WorkspaceState, new: &WorkspaceState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.is_downloading != new.is_downloading {
            if new.is_downloading {
                changes.push(StateChange::DownloadStarted);
            } else {
                changes.push(StateChange::DownloadFinished {
                    success: new.last_download_succeeded.unwrap_or(false),
                });
            }
        }

        if old.installed_version != new.installed_version {
            changes.push(StateChange::InstalledVersionChanged {
                version: new.installed_version.clone(),
            });
        }

        for category in new.running_scans.difference(&old.running_scans) {
            changes.push(StateChange::ScanStarted {
                category: *category,
            });
        }
        for category in old.running_scans.difference(&new.running_scans) {
            changes.push(StateChange::ScanFinished {
                category: *category,
                outcome: new
                    .last_run
                    .get(category)
                    .cloned()
                    .unwrap_or(OutcomeSummary::Cancelled),
            });
        }

        if old.queued_tasks != new.queued_tasks || old.current_task != new.current_task {
            changes.push(StateChange::QueueChanged {
                queued: new.queued_tasks,
                current: new.current_task.clone(),
            });
        }

        changes
    }

    // Convenience methods for common state updates

    pub fn start_scan(&self, category: ScanCategory) -> Vec<StateChange> {
        self.update(|state| {
            state.running_scans.insert(category);
        })
    }

    /// Record a finished scan. A cancelled scan leaves the previous result
    /// and staleness in place.
    pub fn finish_scan(&self, category: ScanCategory, outcome: &ScanOutcome) -> Vec<StateChange> {
        self.update(|state| {
            state.running_scans.remove(&category);
            state.last_run.insert(category, OutcomeSummary::from(outcome));
            if !outcome.is_cancelled() {
                state.last_outcomes.insert(category, OutcomeSummary::from(outcome));
                state.stale_categories.remove(&category);
            }
        })
    }

    pub fn start_download(&self) -> Vec<StateChange> {
        self.update(|state| {
            state.is_downloading = true;
            state.last_download_succeeded = None;
        })
    }

    pub fn finish_download(&self, success: bool, version: Option<String>) -> Vec<StateChange> {
        self.update(|state| {
            state.is_downloading = false;
            state.last_download_succeeded = Some(success);
            if version.is_some() {
                state.installed_version = version;
            }
        })
    }

    pub fn set_installed_version(&self, version: Option<String>) -> Vec<StateChange> {
        self.update(|state| state.installed_version = version)
    }

    pub fn set_queue(&self, queued: usize, current: Option<String>) -> Vec<StateChange> {
        self.update(|state| {
            state.queued_tasks = queued;
            state.current_task = current;
        })
    }

    /// Record that a category's cached results went stale
    pub fn mark_results_stale(
        &self,
        category: ScanCategory,
        paths: Vec<Utf8PathBuf>,
    ) -> Vec<StateChange> {
        let mut changes = self.update(|state| {
            state.stale_categories.insert(category);
        });

        let stale_event = StateChange::ResultsStale { category, paths };
        self.emit(stale_event.clone());
        changes.push(stale_event);

        changes
    }

    /// Record that the queue was stopped and nothing is running
    pub fn queue_stopped(&self) -> Vec<StateChange> {
        let mut changes = self.update(|state| {
            state.queued_tasks = 0;
            state.current_task = None;
            state.running_scans.clear();
            state.is_downloading = false;
        });

        self.emit(StateChange::QueueStopped);
        changes.push(StateChange::QueueStopped);

        changes
    }

    /// Get an Arc reference to the state for use in worker tasks
    pub fn state_arc(&self) -> Arc<RwLock<WorkspaceState>> {
        Arc::clone(&self.state)
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateManager cloneable for sharing across tasks
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
            metrics: self.metrics.clone(),
        }
    }
}
