//! Platform detection for picking the scanner artifact to download.

use camino::Utf8Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{os} ({arch}) is not a supported platform")]
    Unsupported { os: String, arch: String },
}

/// Host platform, identified by the artifact file name published for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    LinuxArm64,
    LinuxAlpine,
    LinuxAlpineArm64,
    MacOs,
    MacOsArm64,
    Windows,
}

impl Platform {
    /// Artifact file name on the download server.
    pub fn file_name(&self) -> &'static str {
        match self {
            Platform::Linux => "snyk-linux",
            Platform::LinuxArm64 => "snyk-linux-arm64",
            Platform::LinuxAlpine => "snyk-alpine",
            Platform::LinuxAlpineArm64 => "snyk-alpine-arm64",
            Platform::MacOs => "snyk-macos",
            Platform::MacOsArm64 => "snyk-macos-arm64",
            Platform::Windows => "snyk-win.exe",
        }
    }

    /// Map an OS/arch pair to a platform.
    ///
    /// Accepts both Rust target names (`macos`, `aarch64`) and the spellings
    /// used by other runtimes (`mac os x`, `darwin`, `arm64`).
    pub fn detect(os: &str, arch: &str, is_alpine: bool) -> Result<Self, PlatformError> {
        let os_name = os.to_lowercase();
        let arch_name = arch.to_lowercase();
        let is_arm64 = arch_name == "aarch64" || arch_name == "arm64";

        match os_name.as_str() {
            "linux" => Ok(match (is_alpine, is_arm64) {
                (true, true) => Platform::LinuxAlpineArm64,
                (false, true) => Platform::LinuxArm64,
                (true, false) => Platform::LinuxAlpine,
                (false, false) => Platform::Linux,
            }),
            "macos" | "mac os x" | "darwin" | "osx" => {
                if is_arm64 {
                    Ok(Platform::MacOsArm64)
                } else {
                    Ok(Platform::MacOs)
                }
            }
            other if other.contains("windows") => Ok(Platform::Windows),
            _ => Err(PlatformError::Unsupported {
                os: os.to_string(),
                arch: arch.to_string(),
            }),
        }
    }

    /// Platform of the running process.
    pub fn current() -> Result<Self, PlatformError> {
        let is_alpine = Utf8Path::new("/etc/alpine-release").exists();
        Self::detect(std::env::consts::OS, std::env::consts::ARCH, is_alpine)
    }
}
