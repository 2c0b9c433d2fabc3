//! Services module - binary lifecycle and scanner execution.
//!
//! Everything here is framework-agnostic: inputs are explicit parameters,
//! blocking work takes a [`CancellationToken`](crate::cancel::CancellationToken),
//! and nothing knows about the task queue or the cache.
//!
//! # Components
//!
//! - [`VersionResolver`]: asks the release-metadata endpoint for the latest
//!   release (a [`ReleaseSource`]); failures mean "skip this cycle".
//! - [`BinaryInstaller`]: downloads an artifact, checks it against the
//!   published SHA-256 and renames it over the previous binary.
//! - [`UpdateScheduler`]: decides when a silent update check is due and
//!   compares dotted-integer versions.
//! - [`build_scan_command`]: pure argv builder for one scan request.
//! - [`ProcessRunner`]: runs the scanner with the token in its environment,
//!   honouring cancellation and the scan timeout.
//! - [`classify_output`]: turns raw stdout into a
//!   [`ScanOutcome`](crate::models::ScanOutcome).
//!
//! # Usage Example
//!
//! ```ignore
//! use scanwarden::services::{ProcessRunner, build_scan_command};
//!
//! let argv = build_scan_command(&binary, &request, &settings);
//! let outcome = ProcessRunner::from_settings(&settings)
//!     .run_scan(&argv, &request, settings.token.as_ref(), &cancel)
//!     .await;
//! ```

pub mod classify;
pub mod command;
pub mod http;
pub mod installer;
pub mod platform;
pub mod release;
pub mod runner;
pub mod update;

pub use classify::classify_output;
pub use command::build_scan_command;
pub use installer::{BinaryInstall, BinaryInstaller, InstallError, SuggestedAction};
pub use platform::{Platform, PlatformError};
pub use release::{ReleaseSource, VersionResolver};
pub use runner::{ProcessRunner, RunOutput, RunnerError};
pub use update::{UpdateOutcome, UpdateScheduler, is_newer_version, is_update_check_due};
