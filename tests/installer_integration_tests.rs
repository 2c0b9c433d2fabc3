//! Integration tests for BinaryInstaller and VersionResolver against a local HTTP stub
//!
//! These tests verify:
//! - Download, checksum verification and atomic replacement of the binary
//! - A failed integrity check keeps the previously installed binary
//! - Checksum failures are retried once, HTTP status errors never
//! - Cancelling mid-download or failing the final rename leaves the old install intact
//! - Release metadata failures resolve to "no release"

mod common;

use camino::Utf8PathBuf;
use common::{StubResponse, StubServer, local_client, sha256_hex, utf8_temp_dir};
use scanwarden::CancellationToken;
use scanwarden::config::InstallStateStore;
use scanwarden::models::{InstalledBinaryState, ReleaseInfo};
use scanwarden::progress::ProgressReporter;
use scanwarden::services::{
    BinaryInstall, BinaryInstaller, InstallError, Platform, ReleaseSource, SuggestedAction,
    VersionResolver,
};
use std::sync::Arc;
use std::time::Duration;

const ARTIFACT_PATH: &str = "/cli/v1.2.3/snyk-linux";
const CHECKSUM_PATH: &str = "/cli/v1.2.3/snyk-linux.sha256";
const BINARY: &[u8] = b"#!/bin/sh\necho scanner 1.2.3\n";

fn release(tag: &str) -> ReleaseInfo {
    ReleaseInfo {
        id: 7,
        url: "https://example.invalid/releases/7".into(),
        name: tag.into(),
        tag_name: tag.into(),
    }
}

struct Fixture {
    _temp_dir: tempfile::TempDir,
    target: Utf8PathBuf,
    store: Arc<InstallStateStore>,
    installer: BinaryInstaller,
}

fn fixture(server: &StubServer) -> Fixture {
    let (temp_dir, root) = utf8_temp_dir();
    let target = root.join("bin").join("snyk-linux");
    let store = Arc::new(InstallStateStore::open(&root.join("install-state.yaml")).unwrap());
    let installer = BinaryInstaller::new(
        local_client(),
        server.url(),
        Platform::Linux,
        target.clone(),
        store.clone(),
    );

    Fixture {
        _temp_dir: temp_dir,
        target,
        store,
        installer,
    }
}

fn checksum_document(data: &[u8]) -> String {
    format!("{}  snyk-linux\n", sha256_hex(data))
}

#[tokio::test]
async fn test_install_verified_binary() {
    let server = StubServer::start().await;
    server.route(ARTIFACT_PATH, StubResponse::ok(BINARY));
    server.route(CHECKSUM_PATH, StubResponse::ok(checksum_document(BINARY)));
    let fx = fixture(&server);

    let state = fx
        .installer
        .download_and_install(&release("v1.2.3"), &CancellationToken::new(), &ProgressReporter::detached())
        .await
        .unwrap();

    assert_eq!(state.version.as_deref(), Some("1.2.3"));
    assert_eq!(state.path.as_ref(), Some(&fx.target));
    assert_eq!(state.sha256.as_deref(), Some(sha256_hex(BINARY).as_str()));
    assert!(state.last_check_date.is_some());
    assert_eq!(std::fs::read(&fx.target).unwrap(), BINARY);

    // Persisted, and the on-disk binary matches the recorded digest
    let reopened = InstallStateStore::open(fx.store_path().as_path()).unwrap();
    assert_eq!(reopened.snapshot(), state);
    assert!(fx.store.verify_installed_binary().unwrap());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&fx.target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

impl Fixture {
    fn store_path(&self) -> Utf8PathBuf {
        self.target.parent().unwrap().parent().unwrap().join("install-state.yaml")
    }
}

#[tokio::test]
async fn test_checksum_mismatch_keeps_previous_binary() {
    let server = StubServer::start().await;
    server.route(ARTIFACT_PATH, StubResponse::ok(BINARY));
    server.route(
        CHECKSUM_PATH,
        StubResponse::ok(checksum_document(b"something else entirely")),
    );
    let fx = fixture(&server);

    std::fs::create_dir_all(fx.target.parent().unwrap()).unwrap();
    std::fs::write(&fx.target, b"previous binary").unwrap();
    let before = fx
        .store
        .update(|s| {
            s.path = Some(fx.target.clone());
            s.version = Some("1.0.0".into());
        })
        .unwrap();

    let err = fx
        .installer
        .download_and_install(&release("v1.2.3"), &CancellationToken::new(), &ProgressReporter::detached())
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::ChecksumMismatch { .. }), "got {:?}", err);
    assert_eq!(
        err.suggested_actions(),
        vec![SuggestedAction::Retry, SuggestedAction::ContactSupport]
    );
    assert!(err.user_message().contains("integrity check failed"));

    // Downloaded twice: the original attempt plus one integrity retry
    assert_eq!(server.hits(ARTIFACT_PATH), 2);
    assert_eq!(std::fs::read(&fx.target).unwrap(), b"previous binary");
    assert_eq!(fx.store.snapshot(), before);

    // No temp files left next to the binary
    let leftovers: Vec<_> = std::fs::read_dir(fx.target.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(leftovers.len(), 1);
}

#[tokio::test]
async fn test_checksum_retry_recovers() {
    let server = StubServer::start().await;
    server.route(ARTIFACT_PATH, StubResponse::ok(BINARY));
    server.route_sequence(
        CHECKSUM_PATH,
        vec![
            StubResponse::ok(checksum_document(b"stale")),
            StubResponse::ok(checksum_document(BINARY).to_uppercase()),
        ],
    );
    let fx = fixture(&server);

    let state = fx
        .installer
        .download_and_install(&release("1.2.3"), &CancellationToken::new(), &ProgressReporter::detached())
        .await
        .unwrap();

    assert_eq!(state.version.as_deref(), Some("1.2.3"));
    assert_eq!(server.hits(ARTIFACT_PATH), 2);
    assert_eq!(server.hits(CHECKSUM_PATH), 2);
}

#[tokio::test]
async fn test_http_status_is_not_retried() {
    let server = StubServer::start().await;
    let fx = fixture(&server);

    let err = fx
        .installer
        .download_and_install(&release("v1.2.3"), &CancellationToken::new(), &ProgressReporter::detached())
        .await
        .unwrap_err();

    match &err {
        InstallError::HttpStatus { status, url } => {
            assert_eq!(*status, 404);
            assert!(url.ends_with(ARTIFACT_PATH));
        }
        other => panic!("expected HttpStatus, got {:?}", other),
    }
    assert_eq!(err.suggested_actions(), vec![SuggestedAction::ContactSupport]);
    assert_eq!(server.hits(ARTIFACT_PATH), 1);
    assert_eq!(server.hits(CHECKSUM_PATH), 0);
    assert!(!fx.target.exists());
    assert_eq!(fx.store.snapshot(), InstalledBinaryState::default());
}

#[tokio::test]
async fn test_network_failure_is_retried_then_reported() {
    // Reserve a port, then free it so connections are refused
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_temp_dir, root) = utf8_temp_dir();
    let store = Arc::new(InstallStateStore::in_memory(InstalledBinaryState::default()));
    let installer = BinaryInstaller::new(
        local_client(),
        format!("http://127.0.0.1:{}", port),
        Platform::Linux,
        root.join("bin").join("snyk-linux"),
        store,
    )
    .with_max_network_retries(1);

    let err = installer
        .download_and_install(&release("v1.2.3"), &CancellationToken::new(), &ProgressReporter::detached())
        .await
        .unwrap_err();

    match err {
        InstallError::Network { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected Network, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancelled_install_makes_no_requests() {
    let server = StubServer::start().await;
    server.route(ARTIFACT_PATH, StubResponse::ok(BINARY));
    let fx = fixture(&server);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = fx
        .installer
        .download_and_install(&release("v1.2.3"), &cancel, &ProgressReporter::detached())
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(err.suggested_actions().is_empty());
    assert_eq!(server.hits(ARTIFACT_PATH), 0);
}

#[tokio::test]
async fn test_cancel_during_download_keeps_previous_binary() {
    let payload = vec![0x5a_u8; 512 * 1024];
    let server = StubServer::start().await;
    server.route(
        ARTIFACT_PATH,
        StubResponse::slow(payload.clone(), 16 * 1024, Duration::from_millis(50)),
    );
    server.route(CHECKSUM_PATH, StubResponse::ok(checksum_document(&payload)));
    let fx = fixture(&server);
    let bin_dir = fx.target.parent().unwrap().to_path_buf();
    std::fs::create_dir_all(&bin_dir).unwrap();
    std::fs::write(&fx.target, b"previous binary").unwrap();

    let cancel = CancellationToken::new();
    let (progress, mut progress_rx) = ProgressReporter::new();
    let canceller = async {
        // Cancel once part of the artifact has arrived
        progress_rx
            .wait_for(|p| p.fraction.is_some_and(|f| f > 0.0))
            .await
            .unwrap();
        cancel.cancel();
    };

    let rel = release("v1.2.3");
    let (result, ()) = tokio::join!(
        fx.installer
            .download_and_install(&rel, &cancel, &progress),
        canceller
    );

    let err = result.unwrap_err();
    assert!(matches!(err, InstallError::Cancelled), "{:?}", err);
    assert_eq!(std::fs::read(&fx.target).unwrap(), b"previous binary");
    assert_eq!(std::fs::read_dir(&bin_dir).unwrap().count(), 1);
    assert_eq!(server.hits(CHECKSUM_PATH), 0);
    assert!(!fx.store.snapshot().is_installed());
}

#[tokio::test]
async fn test_failed_replace_restores_install_state() {
    let server = StubServer::start().await;
    server.route(ARTIFACT_PATH, StubResponse::ok(BINARY));
    server.route(CHECKSUM_PATH, StubResponse::ok(checksum_document(BINARY)));
    let fx = fixture(&server);
    fx.store
        .update(|s| {
            s.path = Some(fx.target.clone());
            s.version = Some("1.0.0".into());
        })
        .unwrap();
    // A non-empty directory at the target cannot be replaced by a rename
    std::fs::create_dir_all(fx.target.join("occupied")).unwrap();

    let err = fx
        .installer
        .download_and_install(&release("v1.2.3"), &CancellationToken::new(), &ProgressReporter::detached())
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::Io { .. }), "{:?}", err);
    let state = fx.store.snapshot();
    assert_eq!(state.version.as_deref(), Some("1.0.0"));
    assert_eq!(state.sha256, None);
    assert_eq!(std::fs::read_dir(fx.target.parent().unwrap()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_empty_tag_is_rejected() {
    let server = StubServer::start().await;
    let fx = fixture(&server);

    let err = fx
        .installer
        .download_and_install(&release("v"), &CancellationToken::new(), &ProgressReporter::detached())
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::InvalidRelease(_)));
}

#[tokio::test]
async fn test_version_resolver_reads_release_metadata() {
    let server = StubServer::start().await;
    server.route(
        "/releases/latest",
        StubResponse::ok(r#"{"id": 99, "url": "https://x/99", "name": "v1.1290.0", "tag_name": "v1.1290.0", "assets": []}"#),
    );
    let resolver = VersionResolver::new(local_client(), format!("{}/releases/latest", server.url()));

    let release = resolver.latest_release().await.unwrap();
    assert_eq!(release.id, 99);
    assert_eq!(release.version(), "1.1290.0");
    assert_eq!(resolver.last_release(), Some(release));
}

#[tokio::test]
async fn test_version_resolver_failures_yield_none() {
    let server = StubServer::start().await;
    server.route("/broken", StubResponse::ok("not json"));
    server.route("/error", StubResponse::status(500));

    for path in ["/broken", "/error", "/missing"] {
        let resolver = VersionResolver::new(local_client(), format!("{}{}", server.url(), path));
        assert_eq!(resolver.latest_release().await, None, "{}", path);
        assert_eq!(resolver.last_release(), None);
    }
}
