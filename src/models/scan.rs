use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of analysis performed by one scanner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanCategory {
    /// Open-source dependency scan
    Oss,
    /// Static code analysis
    Code,
    /// Infrastructure-as-code scan
    Iac,
    /// Container image scan
    Container,
}

impl ScanCategory {
    pub const ALL: [ScanCategory; 4] = [
        ScanCategory::Oss,
        ScanCategory::Code,
        ScanCategory::Iac,
        ScanCategory::Container,
    ];

    /// Scanner subcommand words for this category.
    pub fn subcommand(&self) -> &'static [&'static str] {
        match self {
            ScanCategory::Oss => &["test"],
            ScanCategory::Code => &["code", "test"],
            ScanCategory::Iac => &["iac", "test"],
            ScanCategory::Container => &["container", "test"],
        }
    }

    /// JSON key whose presence marks a successful payload for this category.
    pub fn issue_marker(&self) -> &'static str {
        match self {
            ScanCategory::Oss | ScanCategory::Container => "\"vulnerabilities\":",
            ScanCategory::Iac => "\"infrastructureAsCodeIssues\":",
            ScanCategory::Code => "\"runs\":",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanCategory::Oss => "oss",
            ScanCategory::Code => "code",
            ScanCategory::Iac => "iac",
            ScanCategory::Container => "container",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ScanCategory::Oss => "Open Source",
            ScanCategory::Code => "Code",
            ScanCategory::Iac => "Infrastructure as Code",
            ScanCategory::Container => "Container",
        }
    }
}

impl fmt::Display for ScanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oss" | "open-source" => Ok(ScanCategory::Oss),
            "code" | "sast" => Ok(ScanCategory::Code),
            "iac" => Ok(ScanCategory::Iac),
            "container" => Ok(ScanCategory::Container),
            other => Err(format!("unknown scan category: {}", other)),
        }
    }
}

/// One requested scan. Created per invocation, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub category: ScanCategory,
    pub workspace_path: Utf8PathBuf,
    /// Extra arguments appended after the settings-derived flags
    /// (container image names, for example).
    pub extra_args: Vec<String>,
}

impl ScanRequest {
    pub fn new(category: ScanCategory, workspace_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            category,
            workspace_path: workspace_path.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Severity reported by the scanner, normalised across categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

impl Severity {
    /// Accepts scanner severities as well as SARIF levels.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "low" | "note" | "info" => Severity::Low,
            "medium" | "warning" => Severity::Medium,
            "high" | "error" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Unknown,
        }
    }
}

/// A single finding, category-neutral.
///
/// `location` is derived once when the issue is built and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub package: Option<String>,
    pub version: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub location: String,
}

impl ScanIssue {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
        package: Option<String>,
        version: Option<String>,
        file: Option<String>,
        line: Option<u32>,
    ) -> Self {
        let location = match (&package, &version, &file, line) {
            (Some(p), Some(v), _, _) => format!("{}@{}", p, v),
            (Some(p), None, _, _) => p.clone(),
            (None, _, Some(f), Some(l)) => format!("{}:{}", f, l),
            (None, _, Some(f), None) => f.clone(),
            _ => String::new(),
        };

        Self {
            id: id.into(),
            title: title.into(),
            severity,
            package,
            version,
            file,
            line,
            location,
        }
    }
}

/// Terminal result of one scan. Exactly one variant per completed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Success { issues: Vec<ScanIssue> },
    StructuredError { message: String, path: Utf8PathBuf },
    UnstructuredError { message: String, path: Utf8PathBuf },
    Cancelled,
}

impl ScanOutcome {
    pub fn is_successful(&self) -> bool {
        matches!(self, ScanOutcome::Success { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanOutcome::Cancelled)
    }

    pub fn issues(&self) -> &[ScanIssue] {
        match self {
            ScanOutcome::Success { issues } => issues,
            _ => &[],
        }
    }

    /// Error message and the path it applies to, for either error variant.
    pub fn error(&self) -> Option<(&str, &Utf8Path)> {
        match self {
            ScanOutcome::StructuredError { message, path }
            | ScanOutcome::UnstructuredError { message, path } => Some((message, path)),
            _ => None,
        }
    }

    /// One-line summary used in logs and status output.
    pub fn summary(&self) -> String {
        match self {
            ScanOutcome::Success { issues } if issues.is_empty() => "no issues found".to_string(),
            ScanOutcome::Success { issues } => format!("{} issues found", issues.len()),
            ScanOutcome::StructuredError { message, .. } => format!("error: {}", message),
            ScanOutcome::UnstructuredError { message, .. } => {
                let first_line = message.lines().next().unwrap_or_default();
                format!("error: {}", first_line)
            }
            ScanOutcome::Cancelled => "cancelled".to_string(),
        }
    }
}
