use crate::models::InstalledBinaryState;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::sync::RwLock;
use tempfile::NamedTempFile;

/// Thread-safe holder of the persisted [`InstalledBinaryState`].
///
/// Every mutation is written through to `install-state.yaml` when the store
/// has a backing file; [`InstallStateStore::in_memory`] keeps state only for
/// the lifetime of the process.
#[derive(Debug)]
pub struct InstallStateStore {
    path: Option<Utf8PathBuf>,
    state: RwLock<InstalledBinaryState>,
}

impl InstallStateStore {
    /// Open the store, reading existing state if the file exists.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let state = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read install state: {}", path))?;
            serde_yaml_ng::from_str(&contents)
                .with_context(|| format!("Failed to parse install state: {}", path))?
        } else {
            tracing::debug!("No install state at {}, starting unset", path);
            InstalledBinaryState::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(state),
        })
    }

    pub fn in_memory(state: InstalledBinaryState) -> Self {
        Self {
            path: None,
            state: RwLock::new(state),
        }
    }

    pub fn snapshot(&self) -> InstalledBinaryState {
        self.state.read().unwrap().clone()
    }

    /// Apply a mutation and persist the result.
    ///
    /// The in-memory state is only replaced once the write succeeded.
    pub fn update<F>(&self, update_fn: F) -> Result<InstalledBinaryState>
    where
        F: FnOnce(&mut InstalledBinaryState),
    {
        let mut state = self.state.write().unwrap();
        let mut next = state.clone();
        update_fn(&mut next);

        if let Some(path) = &self.path {
            let yaml = serde_yaml_ng::to_string(&next)
                .context("Failed to serialize install state to YAML")?;
            write_atomically(path, yaml.as_bytes())
                .with_context(|| format!("Failed to write install state: {}", path))?;
            tracing::debug!("Persisted install state to {}", path);
        }

        *state = next.clone();
        Ok(next)
    }

    /// Compare the on-disk binary against the digest recorded at install time.
    ///
    /// Returns `Ok(false)` if nothing is installed, the file is missing, or the
    /// digest differs.
    pub fn verify_installed_binary(&self) -> Result<bool> {
        let state = self.snapshot();
        let (Some(path), Some(expected)) = (state.path, state.sha256) else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let mut file =
            fs::File::open(&path).with_context(|| format!("Failed to open binary: {}", path))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file
                .read(&mut buf)
                .with_context(|| format!("Failed to read binary: {}", path))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }

        let actual = format!("{:x}", hasher.finalize());
        let matches = actual.eq_ignore_ascii_case(&expected);
        if !matches {
            tracing::warn!(
                "Installed binary {} does not match recorded digest (expected {}, found {})",
                path,
                expected,
                actual
            );
        }
        Ok(matches)
    }
}

/// Write `contents` to a temp file beside `path`, then rename it over `path`.
///
/// Readers see either the old file or the new one, never a truncated one.
fn write_atomically(path: &Utf8Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
