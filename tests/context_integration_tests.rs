//! End-to-end tests for WorkspaceContext
//!
//! The release source and installer are replaced by in-process fakes; the
//! "installed" scanner is a `/bin/sh` script, so scans really run through the
//! task queue, the process runner, the classifier and the result cache.

#![cfg(unix)]

mod common;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use common::{utf8_temp_dir, write_script};
use scanwarden::cache::{FileEvent, FileEventKind};
use scanwarden::config::InstallStateStore;
use scanwarden::models::{
    InstalledBinaryState, OutcomeSummary, ReleaseInfo, ScanCategory, ScanOutcome, ScanSettings,
};
use scanwarden::progress::ProgressReporter;
use scanwarden::queue::QueueError;
use scanwarden::services::{BinaryInstall, InstallError, ReleaseSource};
use scanwarden::{CancellationToken, StateChange, TaskState, WorkspaceContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

const SCANNER: &str = r#"case "$1" in
  test) echo '{"ok":false,"vulnerabilities":[{"id":"SNYK-JS-AXIOS-1038255","title":"Server-Side Request Forgery","severity":"medium","packageName":"axios","version":"0.19.2"}]}' ;;
  iac) echo '{"ok":false,"error":"Could not find any valid IaC files","path":"'"$PWD"'"}' ;;
  *) echo 'Please specify an image to scan' ;;
esac"#;

const SLOW_SCANNER: &str = "sleep 30\necho '{\"vulnerabilities\": []}'";

struct FixedRelease(Option<ReleaseInfo>);

#[async_trait]
impl ReleaseSource for FixedRelease {
    async fn latest_release(&self) -> Option<ReleaseInfo> {
        self.0.clone()
    }
}

/// "Installs" a release by writing the scanner script to the target.
struct ScriptInstaller {
    target: Utf8PathBuf,
    store: Arc<InstallStateStore>,
    script: &'static str,
    installs: AtomicUsize,
}

#[async_trait]
impl BinaryInstall for ScriptInstaller {
    async fn download_and_install(
        &self,
        release: &ReleaseInfo,
        cancel: &CancellationToken,
        _progress: &ProgressReporter,
    ) -> Result<InstalledBinaryState, InstallError> {
        cancel.check()?;
        self.installs.fetch_add(1, Ordering::SeqCst);
        write_script(&self.target, self.script);
        self.store
            .update(|s| {
                s.path = Some(self.target.clone());
                s.version = Some(release.version().to_string());
                s.last_check_date = Some(chrono::Local::now().date_naive());
            })
            .map_err(InstallError::State)
    }
}

fn release() -> ReleaseInfo {
    ReleaseInfo {
        id: 1,
        url: "https://example.invalid/releases/1".into(),
        name: "v1.2.3".into(),
        tag_name: "v1.2.3".into(),
    }
}

struct Fixture {
    _temp_dir: tempfile::TempDir,
    workspace: Utf8PathBuf,
    binary: Utf8PathBuf,
    installer: Arc<ScriptInstaller>,
    ctx: WorkspaceContext,
}

fn fixture(settings: ScanSettings, script: &'static str, preinstalled: bool) -> Fixture {
    let (temp_dir, root) = utf8_temp_dir();
    let workspace = root.join("project");
    std::fs::create_dir_all(&workspace).unwrap();
    let binary = root.join("bin").join("snyk-linux");
    let store = Arc::new(InstallStateStore::open(&root.join("install-state.yaml")).unwrap());

    if preinstalled {
        write_script(&binary, script);
    }

    let installer = Arc::new(ScriptInstaller {
        target: binary.clone(),
        store: store.clone(),
        script,
        installs: AtomicUsize::new(0),
    });
    let ctx = WorkspaceContext::with_components(
        workspace.clone(),
        settings,
        binary.clone(),
        store,
        Arc::new(FixedRelease(Some(release()))),
        installer.clone(),
    );

    Fixture {
        _temp_dir: temp_dir,
        workspace,
        binary,
        installer,
        ctx,
    }
}

fn drain(rx: &mut broadcast::Receiver<StateChange>) -> Vec<StateChange> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn position(events: &[StateChange], wanted: &StateChange) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("{:?} not in {:?}", wanted, events))
}

#[tokio::test]
async fn test_scan_installs_missing_binary_and_caches_result() {
    let fx = fixture(ScanSettings::default(), SCANNER, false);
    let mut events = fx.ctx.subscribe();

    let handle = fx.ctx.request_scan(ScanCategory::Oss).unwrap();
    assert_eq!(handle.wait().await, TaskState::Succeeded);

    assert_eq!(fx.installer.installs.load(Ordering::SeqCst), 1);
    assert!(fx.binary.is_file());
    assert_eq!(fx.ctx.installed_state().version.as_deref(), Some("1.2.3"));

    let entry = fx.ctx.result(ScanCategory::Oss).unwrap();
    assert_eq!(entry.outcome.issues().len(), 1);
    assert_eq!(entry.outcome.issues()[0].location, "axios@0.19.2");

    let events = drain(&mut events);
    let started = position(&events, &StateChange::ScanStarted { category: ScanCategory::Oss });
    let download = position(&events, &StateChange::DownloadStarted);
    let downloaded = position(&events, &StateChange::DownloadFinished { success: true });
    let finished = position(
        &events,
        &StateChange::ScanFinished {
            category: ScanCategory::Oss,
            outcome: OutcomeSummary::Succeeded { issue_count: 1 },
        },
    );
    assert!(started < download && download < downloaded && downloaded < finished);

    let snapshot = fx.ctx.state().snapshot();
    assert_eq!(snapshot.installed_version.as_deref(), Some("1.2.3"));
    assert!(!snapshot.is_busy());

    fx.ctx.shutdown().await;
}

#[tokio::test]
async fn test_missing_binary_without_auto_download_fails_scan() {
    let settings = ScanSettings {
        auto_download: false,
        ..ScanSettings::default()
    };
    let fx = fixture(settings, SCANNER, false);

    let handle = fx.ctx.request_scan(ScanCategory::Oss).unwrap();
    let state = handle.wait().await;

    assert!(matches!(state, TaskState::Failed(ref m) if m.contains("not installed")), "{:?}", state);
    assert_eq!(fx.installer.installs.load(Ordering::SeqCst), 0);

    match fx.ctx.result(ScanCategory::Oss).unwrap().outcome {
        ScanOutcome::UnstructuredError { path, .. } => assert_eq!(path, fx.workspace),
        other => panic!("expected unstructured error, got {:?}", other),
    }

    fx.ctx.shutdown().await;
}

#[tokio::test]
async fn test_enabled_categories_fail_independently() {
    let fx = fixture(ScanSettings::default(), SCANNER, true);

    let handles = fx.ctx.scan_enabled().unwrap();
    assert_eq!(handles.len(), 3);
    for handle in &handles {
        handle.wait().await;
    }

    let results = fx.ctx.results();
    assert_eq!(
        results.iter().map(|e| e.category).collect::<Vec<_>>(),
        vec![ScanCategory::Oss, ScanCategory::Iac, ScanCategory::Container]
    );
    assert!(results[0].outcome.is_successful());
    match &results[1].outcome {
        ScanOutcome::StructuredError { message, .. } => {
            assert_eq!(message, "Could not find any valid IaC files")
        }
        other => panic!("expected structured error, got {:?}", other),
    }
    assert!(matches!(results[2].outcome, ScanOutcome::UnstructuredError { .. }));

    let snapshot = fx.ctx.state().snapshot();
    assert_eq!(
        snapshot.failed_categories(),
        vec![ScanCategory::Iac, ScanCategory::Container]
    );
    assert_eq!(fx.ctx.metrics().scans_succeeded.load(Ordering::Relaxed), 1);
    assert_eq!(fx.ctx.metrics().scans_failed.load(Ordering::Relaxed), 2);

    fx.ctx.shutdown().await;
}

#[tokio::test]
async fn test_file_change_invalidates_cached_result() {
    let fx = fixture(ScanSettings::default(), SCANNER, true);
    fx.ctx.request_scan(ScanCategory::Oss).unwrap().wait().await;
    assert!(fx.ctx.result(ScanCategory::Oss).is_some());

    let mut events = fx.ctx.subscribe();
    assert!(fx.ctx.submit_file_events(vec![FileEvent::new(
        fx.workspace.join("Gemfile.lock"),
        FileEventKind::Modified,
    )]));
    fx.ctx.flush_file_events().await;

    assert!(fx.ctx.result(ScanCategory::Oss).is_none());
    let stale: Vec<ScanCategory> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            StateChange::ResultsStale { category, .. } => Some(category),
            _ => None,
        })
        .collect();
    // Code scanning is disabled by default, so only the manifest's category is reported
    assert_eq!(stale, vec![ScanCategory::Oss]);

    fx.ctx.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_scan() {
    let fx = fixture(ScanSettings::default(), SLOW_SCANNER, true);
    let mut events = fx.ctx.subscribe();

    let running = fx.ctx.request_scan(ScanCategory::Iac).unwrap();
    let pending = fx.ctx.request_scan(ScanCategory::Oss).unwrap();
    // A second request for a waiting category is coalesced
    assert_eq!(fx.ctx.request_scan(ScanCategory::Oss).unwrap().id(), pending.id());

    let mut state_rx = running.subscribe_state();
    state_rx
        .wait_for(|s| *s == TaskState::Running)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    fx.ctx.shutdown().await;
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    assert_eq!(running.state(), TaskState::Cancelled);
    assert_eq!(pending.state(), TaskState::Cancelled);
    assert!(fx.ctx.results().is_empty());

    let events = drain(&mut events);
    assert!(events.contains(&StateChange::QueueStopped));
    assert!(events.contains(&StateChange::ScanFinished {
        category: ScanCategory::Iac,
        outcome: OutcomeSummary::Cancelled,
    }));

    assert!(matches!(
        fx.ctx.request_scan(ScanCategory::Oss),
        Err(QueueError::Closed(_))
    ));
    assert_eq!(fx.ctx.metrics().scans_cancelled.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_update_check_installs_once_then_waits_for_schedule() {
    let fx = fixture(ScanSettings::default(), SCANNER, false);

    let first = fx.ctx.check_for_updates().unwrap().unwrap();
    assert_eq!(first.wait().await, TaskState::Succeeded);
    assert_eq!(fx.installer.installs.load(Ordering::SeqCst), 1);

    // The install recorded today's check, so the next one is not due
    let second = fx.ctx.check_for_updates().unwrap().unwrap();
    assert_eq!(second.wait().await, TaskState::Succeeded);
    assert_eq!(fx.installer.installs.load(Ordering::SeqCst), 1);

    fx.ctx.shutdown().await;
}

#[tokio::test]
async fn test_update_check_respects_manual_management() {
    let settings = ScanSettings {
        manage_binaries_automatically: false,
        ..ScanSettings::default()
    };
    let fx = fixture(settings, SCANNER, false);

    assert!(fx.ctx.check_for_updates().unwrap().is_none());
    assert!(fx.ctx.ensure_binary().unwrap().is_some());

    fx.ctx.shutdown().await;
}

#[tokio::test]
async fn test_ensure_binary_skips_present_binary() {
    let fx = fixture(ScanSettings::default(), SCANNER, true);

    assert!(fx.ctx.ensure_binary().unwrap().is_none());
    assert_eq!(fx.installer.installs.load(Ordering::SeqCst), 0);

    fx.ctx.shutdown().await;
}
