//! Classification of raw scanner output into a [`ScanOutcome`].
//!
//! The exit code is ignored; only the shape of the output decides:
//!
//! - empty output is an unstructured error
//! - the category's issue marker without a top-level `"error":` is a success
//! - a JSON object with an `error` field is a structured error
//! - anything else is an unstructured error carrying the raw text
//!
//! A JSON array (one element per project) is classified element by element.

use crate::models::{ScanCategory, ScanIssue, ScanOutcome, Severity};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

pub const NO_OUTPUT_MESSAGE: &str = "CLI didn't produce any output";

static AUTH_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)authenticat|unauthori[sz]ed|\b401\b").expect("Invalid auth failure regex")
});

/// Classify scanner stdout for `category` run against `workspace`.
pub fn classify_output(raw: &str, category: ScanCategory, workspace: &Utf8Path) -> ScanOutcome {
    let text = raw.trim();
    if text.is_empty() {
        return unstructured(NO_OUTPUT_MESSAGE, workspace);
    }

    if text.starts_with('[') {
        if let Ok(Value::Array(elements)) = serde_json::from_str::<Value>(text) {
            return classify_array(&elements, category, workspace);
        }
    }

    let parsed = serde_json::from_str::<Value>(text).ok();

    // Only a top-level "error" key marks a failure; nested ones belong to issues
    let top_level_error = parsed.as_ref().is_some_and(|v| v.get("error").is_some());
    if text.contains(category.issue_marker()) && !top_level_error {
        if let Some(issues) = parsed.as_ref().and_then(|v| parse_issues(v, category)) {
            return ScanOutcome::Success { issues };
        }
    }

    if let Some(outcome) = parsed.as_ref().and_then(|v| parse_error(v, workspace)) {
        return outcome;
    }

    unstructured(text, workspace)
}

fn unstructured(message: &str, workspace: &Utf8Path) -> ScanOutcome {
    ScanOutcome::UnstructuredError {
        message: message.to_string(),
        path: workspace.to_path_buf(),
    }
}

fn classify_value(value: &Value, category: ScanCategory, workspace: &Utf8Path) -> ScanOutcome {
    let key = marker_key(category);
    let has_marker = value.get(key).is_some();
    let has_error = value.get("error").is_some();

    if has_marker && !has_error {
        if let Some(issues) = parse_issues(value, category) {
            return ScanOutcome::Success { issues };
        }
    }
    parse_error(value, workspace).unwrap_or_else(|| unstructured(&value.to_string(), workspace))
}

fn classify_array(elements: &[Value], category: ScanCategory, workspace: &Utf8Path) -> ScanOutcome {
    let outcomes: Vec<ScanOutcome> = elements
        .iter()
        .map(|e| classify_value(e, category, workspace))
        .collect();

    if let Some(auth) = outcomes.iter().find(|o| is_auth_failure(o)) {
        return auth.clone();
    }

    let mut issues = Vec::new();
    let mut any_success = false;
    for outcome in &outcomes {
        if let ScanOutcome::Success { issues: found } = outcome {
            any_success = true;
            issues.extend(found.iter().cloned());
        }
    }

    if any_success || outcomes.is_empty() {
        ScanOutcome::Success { issues }
    } else {
        outcomes.into_iter().next().unwrap_or(ScanOutcome::Success { issues })
    }
}

fn is_auth_failure(outcome: &ScanOutcome) -> bool {
    outcome
        .error()
        .is_some_and(|(message, _)| AUTH_FAILURE.is_match(message))
}

fn marker_key(category: ScanCategory) -> &'static str {
    category.issue_marker().trim_end_matches(':').trim_matches('"')
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: Value,
    #[serde(default)]
    path: Option<String>,
}

fn parse_error(value: &Value, workspace: &Utf8Path) -> Option<ScanOutcome> {
    let payload = ErrorPayload::deserialize(value).ok()?;
    let message = match payload.error {
        Value::String(s) => s,
        Value::Null | Value::Bool(_) => return None,
        other => other.to_string(),
    };
    let path = payload
        .path
        .filter(|p| !p.trim().is_empty())
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| workspace.to_path_buf());

    Some(ScanOutcome::StructuredError { message, path })
}

fn parse_issues(value: &Value, category: ScanCategory) -> Option<Vec<ScanIssue>> {
    match category {
        ScanCategory::Oss | ScanCategory::Container => {
            OssPayload::deserialize(value).ok().map(OssPayload::into_issues)
        }
        ScanCategory::Iac => IacPayload::deserialize(value).ok().map(IacPayload::into_issues),
        ScanCategory::Code => SarifPayload::deserialize(value).ok().map(SarifPayload::into_issues),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct OssPayload {
    vulnerabilities: Vec<OssVulnerability>,
    display_target_file: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct OssVulnerability {
    id: String,
    title: String,
    severity: String,
    package_name: Option<String>,
    version: Option<String>,
}

impl OssPayload {
    // The same vulnerability is reported once per dependency path.
    fn into_issues(self) -> Vec<ScanIssue> {
        let mut seen = HashSet::new();
        let file = self.display_target_file;
        self.vulnerabilities
            .into_iter()
            .filter(|v| seen.insert((v.id.clone(), v.package_name.clone(), v.version.clone())))
            .map(|v| {
                ScanIssue::new(
                    v.id,
                    v.title,
                    Severity::parse(&v.severity),
                    v.package_name,
                    v.version,
                    file.clone(),
                    None,
                )
            })
            .collect()
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct IacPayload {
    infrastructure_as_code_issues: Vec<IacIssue>,
    target_file: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct IacIssue {
    id: String,
    title: String,
    severity: String,
    line_number: Option<i64>,
}

impl IacPayload {
    fn into_issues(self) -> Vec<ScanIssue> {
        let file = self.target_file;
        self.infrastructure_as_code_issues
            .into_iter()
            .map(|i| {
                ScanIssue::new(
                    i.id,
                    i.title,
                    Severity::parse(&i.severity),
                    None,
                    None,
                    file.clone(),
                    i.line_number.and_then(|l| u32::try_from(l).ok()),
                )
            })
            .collect()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SarifPayload {
    runs: Vec<SarifRun>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SarifRun {
    results: Vec<SarifResult>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SarifResult {
    rule_id: String,
    level: Option<String>,
    message: SarifMessage,
    locations: Vec<SarifLocation>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SarifMessage {
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SarifLocation {
    physical_location: Option<SarifPhysicalLocation>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SarifPhysicalLocation {
    artifact_location: Option<SarifArtifact>,
    region: Option<SarifRegion>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SarifArtifact {
    uri: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SarifRegion {
    start_line: Option<u32>,
}

impl SarifPayload {
    fn into_issues(self) -> Vec<ScanIssue> {
        self.runs
            .into_iter()
            .flat_map(|run| run.results)
            .map(|r| {
                let physical = r
                    .locations
                    .into_iter()
                    .next()
                    .and_then(|l| l.physical_location);
                let (file, line) = match physical {
                    Some(p) => (
                        p.artifact_location.and_then(|a| a.uri),
                        p.region.and_then(|r| r.start_line),
                    ),
                    None => (None, None),
                };
                let severity = r.level.as_deref().map(Severity::parse).unwrap_or(Severity::Unknown);
                ScanIssue::new(r.rule_id, r.message.text, severity, None, None, file, line)
            })
            .collect()
    }
}
