use crate::models::ReleaseInfo;
use async_trait::async_trait;
use std::sync::RwLock;

/// Source of the latest published release.
///
/// Implementations never fail loudly: `None` means "skip this cycle".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_release(&self) -> Option<ReleaseInfo>;
}

/// Resolves the latest release from the remote release-metadata endpoint.
pub struct VersionResolver {
    client: reqwest::Client,
    metadata_url: String,
    last_release: RwLock<Option<ReleaseInfo>>,
}

impl VersionResolver {
    pub fn new(client: reqwest::Client, metadata_url: impl Into<String>) -> Self {
        Self {
            client,
            metadata_url: metadata_url.into(),
            last_release: RwLock::new(None),
        }
    }

    /// Most recent successful lookup in this session.
    pub fn last_release(&self) -> Option<ReleaseInfo> {
        self.last_release.read().unwrap().clone()
    }

    async fn fetch(&self) -> Result<ReleaseInfo, String> {
        let response = self
            .client
            .get(&self.metadata_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status {}", status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read body: {}", e))?;

        let release: ReleaseInfo =
            serde_json::from_str(&body).map_err(|e| format!("malformed release metadata: {}", e))?;

        if release.version().is_empty() {
            return Err("release metadata has an empty tag".to_string());
        }
        Ok(release)
    }
}

#[async_trait]
impl ReleaseSource for VersionResolver {
    async fn latest_release(&self) -> Option<ReleaseInfo> {
        match self.fetch().await {
            Ok(release) => {
                tracing::debug!("Latest scanner release is {}", release.tag_name);
                *self.last_release.write().unwrap() = Some(release.clone());
                Some(release)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to fetch latest release info from {}: {}",
                    self.metadata_url,
                    e
                );
                None
            }
        }
    }
}
