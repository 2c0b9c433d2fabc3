use crate::models::ScanSettings;
use std::time::Duration;

/// User agent sent on every request.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by the version resolver and the installer.
///
/// Every request is bounded by `network_timeout_secs`; connection setup by a
/// third of that.
pub fn build_client(settings: &ScanSettings) -> reqwest::Result<reqwest::Client> {
    let timeout = Duration::from_secs(settings.network_timeout_secs.max(1));

    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout / 3)
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(settings.ignore_unknown_ca)
        .build()
}
