use crate::models::{ScanSettings, Secret};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

pub mod install_state;

pub use install_state::InstallStateStore;

/// Environment variable prefix for settings overrides (`SCANWARDEN_ORGANIZATION=...`).
pub const ENV_PREFIX: &str = "SCANWARDEN";

/// Environment variable that supplies the scanner token, taking precedence over the file.
pub const TOKEN_ENV_VAR: &str = "SCANWARDEN_TOKEN";

/// Configuration manager for settings and persisted install state.
///
/// Manages:
/// - Settings (`scanwarden.yaml`): endpoint, organization, categories, download URLs
/// - Install state (`install-state.yaml`): installed binary path, version, last check date
/// - Binary directory (`bin/`): default location of the downloaded scanner
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
    install_state_path: Utf8PathBuf,
    bin_dir: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager rooted at `config_dir`, creating it if needed.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join("scanwarden.yaml"),
            install_state_path: config_dir.join("install-state.yaml"),
            bin_dir: config_dir.join("bin"),
            config_dir,
        })
    }

    /// Load settings: YAML file (optional) layered under `SCANWARDEN_*` variables.
    pub fn load_settings(&self) -> Result<ScanSettings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
        }

        let layered = config::Config::builder()
            .add_source(
                config::File::from(self.settings_path.as_std_path())
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        let mut settings: ScanSettings = layered
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        // Workspace keys are paths; the layered source would split them on '.'
        if self.settings_path.exists() {
            settings.workspace_parameters = self.load_settings_file()?.workspace_parameters;
        }

        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.trim().is_empty() {
                settings.token = Some(Secret::new(token));
            }
        }

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Load settings from the YAML file only, ignoring the environment.
    pub fn load_settings_file(&self) -> Result<ScanSettings> {
        if !self.settings_path.exists() {
            return Ok(ScanSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_path)
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        serde_yaml_ng::from_str(&contents)
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))
    }

    /// Save settings to the YAML file.
    pub fn save_settings(&self, settings: &ScanSettings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Open the persisted install state store.
    pub fn install_state_store(&self) -> Result<InstallStateStore> {
        InstallStateStore::open(&self.install_state_path)
    }

    /// Where the scanner binary lives: the configured override, or `bin/<platform file>`.
    pub fn binary_path(&self, settings: &ScanSettings, platform_file_name: &str) -> Utf8PathBuf {
        settings
            .cli_path
            .clone()
            .unwrap_or_else(|| self.bin_dir.join(platform_file_name))
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }

    pub fn install_state_path(&self) -> &Utf8Path {
        &self.install_state_path
    }

    pub fn bin_dir(&self) -> &Utf8Path {
        &self.bin_dir
    }
}
