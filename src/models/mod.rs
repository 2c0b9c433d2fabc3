//! Data models for scanwarden.
//!
//! - [`ScanSettings`]: user settings loaded from `scanwarden.yaml` and `SCANWARDEN_*` variables
//! - [`InstalledBinaryState`]: persisted record of the installed scanner binary
//! - [`ReleaseInfo`]: latest published release, refreshed per version check
//! - [`ScanRequest`], [`ScanOutcome`], [`ScanIssue`]: one scan and its result
//! - [`WorkspaceState`]: observable per-workspace snapshot behind [`StateManager`](crate::state::StateManager)

pub mod release;
pub mod scan;
pub mod settings;
pub mod workspace_state;

pub use release::{InstalledBinaryState, ReleaseInfo, normalize_version};
pub use scan::{ScanCategory, ScanIssue, ScanOutcome, ScanRequest, Severity};
pub use settings::{EnabledCategories, ScanSettings, Secret};
pub use workspace_state::{MAX_CONCURRENT_TASKS_PER_WORKSPACE, OutcomeSummary, WorkspaceState};
