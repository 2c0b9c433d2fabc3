use crate::cancel::{CancellationToken, Cancelled};
use crate::config::InstallStateStore;
use crate::models::{InstalledBinaryState, ReleaseInfo, normalize_version};
use crate::progress::ProgressReporter;
use crate::services::platform::{Platform, PlatformError};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Network failures are retried this many times after the first attempt.
pub const DEFAULT_MAX_NETWORK_RETRIES: u32 = 2;

/// Cancellation is checked each time this many bytes have been streamed.
const CANCEL_CHECK_INTERVAL: u64 = 64 * 1024;

/// Remedial action offered to the user alongside an install failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestedAction {
    Retry,
    ContactSupport,
}

impl SuggestedAction {
    pub fn label(&self) -> &'static str {
        match self {
            SuggestedAction::Retry => "Retry",
            SuggestedAction::ContactSupport => "Contact support",
        }
    }
}

/// Errors that can occur while downloading and installing the scanner
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Network error after {attempts} attempt(s): {message}")]
    Network { message: String, attempts: u32 },

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Release has no usable version: {0:?}")]
    InvalidRelease(String),

    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist install state: {0:#}")]
    State(anyhow::Error),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Download cancelled")]
    Cancelled,
}

impl From<Cancelled> for InstallError {
    fn from(_: Cancelled) -> Self {
        InstallError::Cancelled
    }
}

impl InstallError {
    fn network(err: reqwest::Error) -> Self {
        InstallError::Network {
            message: err.to_string(),
            attempts: 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Cancelled)
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            InstallError::Network { message, .. } => format!(
                "The download of the Snyk CLI was interrupted by an error ({}). Do you want to try again?",
                message
            ),
            InstallError::HttpStatus { status, .. } => format!(
                "The download request of the current Snyk CLI was not successful (HTTP {}).",
                status
            ),
            InstallError::ChecksumMismatch { expected, actual } => format!(
                "The download of the Snyk CLI was not successful. The integrity check failed (expected {}, got {}).",
                expected, actual
            ),
            InstallError::Cancelled => "The download of the Snyk CLI was cancelled.".to_string(),
            other => other.to_string(),
        }
    }

    pub fn suggested_actions(&self) -> Vec<SuggestedAction> {
        match self {
            InstallError::Network { .. } | InstallError::ChecksumMismatch { .. } => {
                vec![SuggestedAction::Retry, SuggestedAction::ContactSupport]
            }
            InstallError::HttpStatus { .. }
            | InstallError::Platform(_)
            | InstallError::InvalidRelease(_) => vec![SuggestedAction::ContactSupport],
            InstallError::Io { .. } | InstallError::State(_) => vec![SuggestedAction::Retry],
            InstallError::Cancelled => Vec::new(),
        }
    }
}

/// Installs a given release of the scanner binary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BinaryInstall: Send + Sync {
    async fn download_and_install(
        &self,
        release: &ReleaseInfo,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<InstalledBinaryState, InstallError>;
}

/// Artifact URL for a version on a platform: `{base}/cli/v{version}/{file}`.
pub fn artifact_url(base_url: &str, version: &str, platform: Platform) -> String {
    format!(
        "{}/cli/v{}/{}",
        base_url.trim_end_matches('/'),
        version,
        platform.file_name()
    )
}

/// Companion checksum URL published next to every artifact.
pub fn checksum_url(artifact_url: &str) -> String {
    format!("{}.sha256", artifact_url)
}

/// Compare a published checksum document with the digest of the download.
///
/// The first whitespace-separated token of the document is the hex digest;
/// case is ignored.
pub fn verify_checksum(published: &str, actual: &str) -> Result<(), InstallError> {
    let expected = published.split_whitespace().next().unwrap_or_default();
    if !expected.is_empty() && expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(InstallError::ChecksumMismatch {
            expected: expected.to_lowercase(),
            actual: actual.to_lowercase(),
        })
    }
}

/// A fully streamed download waiting for verification.
///
/// Dropping it deletes the temporary file.
pub struct Download {
    pub file: NamedTempFile,
    pub sha256: String,
    pub bytes: u64,
}

/// Downloads, verifies and atomically installs the scanner binary.
///
/// The temporary file is created next to the target so the final rename stays
/// on one filesystem. The previous binary is only ever replaced by that
/// rename, after the checksum matched.
pub struct BinaryInstaller {
    client: reqwest::Client,
    base_url: String,
    platform: Platform,
    target: Utf8PathBuf,
    store: Arc<InstallStateStore>,
    max_network_retries: u32,
}

impl BinaryInstaller {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        platform: Platform,
        target: Utf8PathBuf,
        store: Arc<InstallStateStore>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            platform,
            target,
            store,
            max_network_retries: DEFAULT_MAX_NETWORK_RETRIES,
        }
    }

    pub fn with_max_network_retries(mut self, retries: u32) -> Self {
        self.max_network_retries = retries;
        self
    }

    pub fn target(&self) -> &Utf8Path {
        &self.target
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn artifact_url(&self, version: &str) -> String {
        artifact_url(&self.base_url, version, self.platform)
    }

    /// Run `op`, retrying network failures up to the configured bound.
    ///
    /// Cancellation is checked before every attempt.
    async fn retrying<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, InstallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InstallError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel.check()?;

            match op().await {
                Err(InstallError::Network { message, .. }) if attempt <= self.max_network_retries => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}",
                        what,
                        attempt,
                        self.max_network_retries + 1,
                        message
                    );
                }
                Err(InstallError::Network { message, .. }) => {
                    return Err(InstallError::Network {
                        message,
                        attempts: attempt,
                    });
                }
                other => return other,
            }
        }
    }

    /// Stream `url` into a temporary file next to the target, hashing as it goes.
    pub async fn download(
        &self,
        url: &str,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<Download, InstallError> {
        self.retrying("Download", cancel, || self.download_once(url, cancel, progress))
            .await
    }

    async fn download_once(
        &self,
        url: &str,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<Download, InstallError> {
        tracing::info!("Downloading {}", url);
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(InstallError::network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let total = response.content_length();
        let mut file = self.create_temp_file()?;
        let mut hasher = Sha256::new();
        let mut done: u64 = 0;
        let mut since_check: u64 = 0;

        progress.set_bytes(0, total);
        while let Some(chunk) = response.chunk().await.map_err(InstallError::network)? {
            file.write_all(&chunk).map_err(|e| InstallError::Io {
                message: format!("Failed to write download to {}", file.path().display()),
                source: e,
            })?;
            hasher.update(&chunk);

            done += chunk.len() as u64;
            since_check += chunk.len() as u64;
            if since_check >= CANCEL_CHECK_INTERVAL {
                since_check = 0;
                cancel.check()?;
                progress.set_bytes(done, total);
            }
        }
        cancel.check()?;
        progress.set_bytes(done, total);

        file.flush().map_err(|e| InstallError::Io {
            message: "Failed to flush downloaded binary".to_string(),
            source: e,
        })?;

        let sha256 = format!("{:x}", hasher.finalize());
        tracing::debug!("Downloaded {} bytes, sha256 {}", done, sha256);

        Ok(Download {
            file,
            sha256,
            bytes: done,
        })
    }

    fn create_temp_file(&self) -> Result<NamedTempFile, InstallError> {
        let dir = self
            .target
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));

        std::fs::create_dir_all(dir)
            .and_then(|_| NamedTempFile::new_in(dir))
            .map_err(|e| InstallError::Io {
                message: format!(
                    "Could not create a file in {}. Please choose a writable directory for the CLI binary.",
                    dir
                ),
                source: e,
            })
    }

    /// Fetch the published checksum document for an artifact.
    pub async fn fetch_checksum(
        &self,
        artifact_url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, InstallError> {
        let url = checksum_url(artifact_url);
        self.retrying("Checksum download", cancel, || self.fetch_text(&url))
            .await
    }

    async fn fetch_text(&self, url: &str) -> Result<String, InstallError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(InstallError::network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response.text().await.map_err(InstallError::network)
    }

    /// Make a verified download executable, record the new state and rename
    /// the file over the target.
    pub fn install_verified(
        &self,
        download: Download,
        version: &str,
    ) -> Result<InstalledBinaryState, InstallError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            download
                .file
                .as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o755))
                .map_err(|e| InstallError::Io {
                    message: "Failed to mark the downloaded binary as executable".to_string(),
                    source: e,
                })?;
        }

        // State is recorded before the rename and restored if the rename fails
        let previous = self.store.snapshot();
        let today = chrono::Local::now().date_naive();
        let state = self
            .store
            .update(|s| {
                s.path = Some(self.target.clone());
                s.version = Some(version.to_string());
                s.sha256 = Some(download.sha256.clone());
                s.last_check_date = Some(today);
            })
            .map_err(InstallError::State)?;

        if let Err(e) = download.file.persist(&self.target) {
            if let Err(rollback) = self.store.update(|s| *s = previous) {
                tracing::error!(
                    "Install state no longer matches the binary at {}: {:#}",
                    self.target,
                    rollback
                );
            }
            return Err(InstallError::Io {
                message: format!("Failed to move the downloaded binary to {}", self.target),
                source: e.error,
            });
        }

        tracing::info!("Installed scanner {} at {}", version, self.target);
        Ok(state)
    }
}

#[async_trait]
impl BinaryInstall for BinaryInstaller {
    async fn download_and_install(
        &self,
        release: &ReleaseInfo,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<InstalledBinaryState, InstallError> {
        let version = normalize_version(&release.tag_name);
        if version.is_empty() {
            return Err(InstallError::InvalidRelease(release.tag_name.clone()));
        }

        let url = self.artifact_url(version);
        progress.set_text(format!("Downloading Snyk CLI {}", version));

        let mut retried_checksum = false;
        loop {
            let download = self.download(&url, cancel, progress).await?;

            progress.set_text("Verifying checksum");
            let published = self.fetch_checksum(&url, cancel).await?;

            match verify_checksum(&published, &download.sha256) {
                Ok(()) => {
                    cancel.check()?;
                    return self.install_verified(download, version);
                }
                Err(e) if !retried_checksum => {
                    tracing::warn!("{}, downloading once more", e);
                    retried_checksum = true;
                    drop(download);
                    progress.set_text(format!("Downloading Snyk CLI {} (retry)", version));
                }
                Err(e) => {
                    tracing::error!("Integrity check of {} failed twice: {}", url, e);
                    return Err(e);
                }
            }
        }
    }
}
