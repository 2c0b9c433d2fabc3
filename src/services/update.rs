use crate::cancel::CancellationToken;
use crate::config::InstallStateStore;
use crate::models::{InstalledBinaryState, ReleaseInfo, normalize_version};
use crate::progress::ProgressReporter;
use crate::services::installer::{BinaryInstall, InstallError};
use crate::services::release::ReleaseSource;
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::sync::Arc;

/// Days between two silent update checks.
pub const UPDATE_CHECK_INTERVAL_DAYS: i64 = 4;

/// `true` when no check was recorded yet or the last one is at least
/// [`UPDATE_CHECK_INTERVAL_DAYS`] old.
pub fn is_update_check_due(last_check_date: Option<NaiveDate>, today: NaiveDate) -> bool {
    match last_check_date {
        None => true,
        Some(last) => (today - last).num_days() >= UPDATE_CHECK_INTERVAL_DAYS,
    }
}

/// Dotted-integer comparison of an installed version against a remote one.
///
/// Components are compared left to right and the first unequal pair decides.
/// When one version is a prefix of the other neither counts as newer. A
/// missing installed version is always older; a component that is not an
/// integer makes the comparison inconclusive (`false`).
pub fn is_newer_version(current: Option<&str>, remote: &str) -> bool {
    let Some(current) = current.map(normalize_version).filter(|v| !v.is_empty()) else {
        return true;
    };
    let remote = normalize_version(remote);

    let parse = |v: &str| -> Option<Vec<u64>> {
        v.split('.').map(|part| part.trim().parse::<u64>().ok()).collect()
    };

    let (Some(current_parts), Some(remote_parts)) = (parse(current), parse(remote)) else {
        tracing::warn!(
            "Cannot compare versions {:?} and {:?}, assuming no update",
            current,
            remote
        );
        return false;
    };

    current_parts
        .iter()
        .zip(remote_parts.iter())
        .map(|(c, r)| c.cmp(r))
        .find(|ordering| *ordering != Ordering::Equal)
        == Some(Ordering::Less)
}

/// What a silent update round did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The last check is recent enough
    NotDue,
    /// Release metadata could not be fetched; retried next time
    ResolutionFailed,
    /// Installed version is current
    UpToDate(ReleaseInfo),
    /// A newer release was installed
    Updated(InstalledBinaryState),
}

/// Decides when to look for a new scanner release and installs it.
pub struct UpdateScheduler {
    source: Arc<dyn ReleaseSource>,
    installer: Arc<dyn BinaryInstall>,
    store: Arc<InstallStateStore>,
    today: Box<dyn Fn() -> NaiveDate + Send + Sync>,
}

impl UpdateScheduler {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        installer: Arc<dyn BinaryInstall>,
        store: Arc<InstallStateStore>,
    ) -> Self {
        Self {
            source,
            installer,
            store,
            today: Box::new(|| chrono::Local::now().date_naive()),
        }
    }

    /// Replace the clock, for tests.
    pub fn with_clock<F>(mut self, today: F) -> Self
    where
        F: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        self.today = Box::new(today);
        self
    }

    pub fn is_update_check_due(&self) -> bool {
        is_update_check_due(self.store.snapshot().last_check_date, (self.today)())
    }

    /// Check for and install a newer release if a check is due.
    pub async fn silent_update(
        &self,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<UpdateOutcome, InstallError> {
        if !self.is_update_check_due() {
            tracing::debug!("Update check not due yet");
            return Ok(UpdateOutcome::NotDue);
        }
        cancel.check()?;

        progress.set_text("Checking for scanner updates");
        let Some(release) = self.source.latest_release().await else {
            return Ok(UpdateOutcome::ResolutionFailed);
        };

        let installed = self.store.snapshot().version;
        if is_newer_version(installed.as_deref(), &release.tag_name) {
            tracing::info!(
                "Updating scanner from {} to {}",
                installed.as_deref().unwrap_or("<none>"),
                release.version()
            );
            let state = self
                .installer
                .download_and_install(&release, cancel, progress)
                .await?;
            return Ok(UpdateOutcome::Updated(state));
        }

        let today = (self.today)();
        self.store
            .update(|s| s.last_check_date = Some(today))
            .map_err(InstallError::State)?;
        tracing::debug!("Scanner {} is up to date", release.version());

        Ok(UpdateOutcome::UpToDate(release))
    }

    /// Install the latest release regardless of the schedule.
    pub async fn force_install(
        &self,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<Option<InstalledBinaryState>, InstallError> {
        cancel.check()?;
        progress.set_text("Resolving latest scanner release");
        let Some(release) = self.source.latest_release().await else {
            return Ok(None);
        };
        self.installer
            .download_and_install(&release, cancel, progress)
            .await
            .map(Some)
    }
}
