// scanwarden - Scanner lifecycle manager and scan orchestrator
//
// This is the library crate containing the core business logic and data structures.
// The binary crate (main.rs) provides the command-line entry point.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod progress;
pub mod queue;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use cache::{CacheEntry, ResultCache};
pub use cancel::CancellationToken;
pub use config::ConfigManager;
pub use context::WorkspaceContext;
pub use models::{ScanCategory, ScanOutcome, ScanSettings, WorkspaceState};
pub use queue::{TaskHandle, TaskQueue, TaskState};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
