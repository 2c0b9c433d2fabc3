use crate::models::ScanCategory;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_BASE_DOWNLOAD_URL: &str = "https://static.snyk.io";
pub const DEFAULT_RELEASE_METADATA_URL: &str = "https://api.github.com/repos/snyk/cli/releases/latest";
pub const DEFAULT_RELEASE_CHANNEL: &str = "stable";

/// Authentication secret for the scanner.
///
/// Never printed: `Debug` and `Display` are redacted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Which scan categories run on a full scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnabledCategories {
    pub oss: bool,
    pub code: bool,
    pub iac: bool,
    pub container: bool,
}

impl Default for EnabledCategories {
    fn default() -> Self {
        Self {
            oss: true,
            code: false,
            iac: true,
            container: true,
        }
    }
}

impl EnabledCategories {
    pub fn is_enabled(&self, category: ScanCategory) -> bool {
        match category {
            ScanCategory::Oss => self.oss,
            ScanCategory::Code => self.code,
            ScanCategory::Iac => self.iac,
            ScanCategory::Container => self.container,
        }
    }

    pub fn enabled(&self) -> Vec<ScanCategory> {
        ScanCategory::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }
}

/// User settings consumed by the command builder, installer and runner.
///
/// Loaded from `scanwarden.yaml` layered under `SCANWARDEN_*` environment
/// variables (see [`crate::config::ConfigManager`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Custom API endpoint; `None` means the scanner default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    /// Accept unknown certificate authorities (`--insecure`)
    pub ignore_unknown_ca: bool,

    pub usage_analytics_enabled: bool,

    /// Free-form arguments appended to every scan
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_parameters: Option<String>,

    /// Per-workspace free-form arguments, overriding `additional_parameters`
    pub workspace_parameters: IndexMap<String, String>,

    pub categories: EnabledCategories,

    /// Download the scanner when it is missing
    pub auto_download: bool,

    /// Run silent update checks
    pub manage_binaries_automatically: bool,

    /// Explicit scanner location; defaults to `<config dir>/bin/<platform file>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<Utf8PathBuf>,

    pub cli_base_download_url: String,
    pub cli_release_channel: String,
    pub release_metadata_url: String,

    pub network_timeout_secs: u64,
    pub scan_timeout_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Secret>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            custom_endpoint: None,
            organization: None,
            ignore_unknown_ca: false,
            usage_analytics_enabled: true,
            additional_parameters: None,
            workspace_parameters: IndexMap::new(),
            categories: EnabledCategories::default(),
            auto_download: true,
            manage_binaries_automatically: true,
            cli_path: None,
            cli_base_download_url: DEFAULT_BASE_DOWNLOAD_URL.to_string(),
            cli_release_channel: DEFAULT_RELEASE_CHANNEL.to_string(),
            release_metadata_url: DEFAULT_RELEASE_METADATA_URL.to_string(),
            network_timeout_secs: 30,
            scan_timeout_secs: 720,
            token: None,
        }
    }
}

impl ScanSettings {
    /// Free-form arguments for a workspace, falling back to the global value.
    pub fn additional_parameters_for(&self, workspace: &Utf8Path) -> Option<&str> {
        self.workspace_parameters
            .get(workspace.as_str())
            .or(self.additional_parameters.as_ref())
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Custom endpoint, if one is set and non-blank.
    pub fn endpoint(&self) -> Option<&str> {
        self.custom_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
