use crate::models::{ScanCategory, ScanOutcome};
use std::collections::{BTreeMap, BTreeSet};

/// Maximum number of concurrently running tasks per workspace.
///
/// Scans and binary installs share one sequential worker so that a scan can
/// never execute a binary that is halfway through being replaced.
pub const MAX_CONCURRENT_TASKS_PER_WORKSPACE: usize = 1;

/// Short, cloneable description of a category's last result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutcomeSummary {
    Succeeded { issue_count: usize },
    Failed { message: String },
    Cancelled,
}

impl From<&ScanOutcome> for OutcomeSummary {
    fn from(outcome: &ScanOutcome) -> Self {
        match outcome {
            ScanOutcome::Success { issues } => OutcomeSummary::Succeeded {
                issue_count: issues.len(),
            },
            ScanOutcome::StructuredError { message, .. }
            | ScanOutcome::UnstructuredError { message, .. } => OutcomeSummary::Failed {
                message: message.clone(),
            },
            ScanOutcome::Cancelled => OutcomeSummary::Cancelled,
        }
    }
}

/// Snapshot of everything observable about one workspace.
///
/// Wrapped in `Arc<RwLock<_>>` by [`crate::state::StateManager`]; mutate it
/// only through [`StateManager::update`](crate::state::StateManager::update)
/// so change events are emitted.
#[derive(Clone, Debug, Default)]
pub struct WorkspaceState {
    // Binary lifecycle
    pub is_downloading: bool,
    pub installed_version: Option<String>,
    pub last_download_succeeded: Option<bool>,

    // Scans
    pub running_scans: BTreeSet<ScanCategory>,
    /// Last non-cancelled result per category
    pub last_outcomes: BTreeMap<ScanCategory, OutcomeSummary>,
    /// How the most recent run of each category ended, cancellations included
    pub last_run: BTreeMap<ScanCategory, OutcomeSummary>,

    /// Categories whose cached result was invalidated since the last scan
    pub stale_categories: BTreeSet<ScanCategory>,

    // Queue
    pub queued_tasks: usize,
    pub current_task: Option<String>,
}

impl WorkspaceState {
    pub fn is_scanning(&self) -> bool {
        !self.running_scans.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.is_downloading || self.is_scanning() || self.queued_tasks > 0
    }

    /// Categories whose last result was an error.
    pub fn failed_categories(&self) -> Vec<ScanCategory> {
        self.last_outcomes
            .iter()
            .filter(|(_, o)| matches!(o, OutcomeSummary::Failed { .. }))
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn reset_results(&mut self) {
        self.last_outcomes.clear();
        self.last_run.clear();
        self.stale_categories.clear();
    }
}
