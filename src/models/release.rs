use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Latest published scanner release, as returned by the release-metadata endpoint.
///
/// Refreshed on every version check and only kept for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "tag_name")]
    pub tag_name: String,
}

impl ReleaseInfo {
    /// Version number without the leading `v` of the tag.
    pub fn version(&self) -> &str {
        normalize_version(&self.tag_name)
    }
}

/// Strip a single leading `v`: `v1.143.1` -> `1.143.1`.
pub fn normalize_version(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix('v').unwrap_or(tag)
}

/// Persisted description of the installed scanner binary.
///
/// `version` and `path` either both describe the binary currently on disk or
/// are both unset. Only the installer writes them; the update scheduler only
/// touches `last_check_date`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledBinaryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_date: Option<NaiveDate>,

    /// Digest of the binary as verified at install time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl InstalledBinaryState {
    pub fn is_installed(&self) -> bool {
        match &self.path {
            Some(path) => self.version.is_some() && path.exists(),
            None => false,
        }
    }
}
