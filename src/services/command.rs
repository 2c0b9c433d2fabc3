use crate::models::{ScanRequest, ScanSettings};
use camino::Utf8Path;

/// Build the scanner argument list for one request.
///
/// Order is fixed: binary, subcommand words, `--json`, then the optional
/// `--API=`, `--insecure`, `--org=` and `--DISABLE_ANALYTICS` flags, then the
/// free-form parameters split on whitespace, then the request's own extra
/// arguments. Optional flags only appear when their setting differs from the
/// default. The auth token is never part of the result.
pub fn build_scan_command(
    binary: &Utf8Path,
    request: &ScanRequest,
    settings: &ScanSettings,
) -> Vec<String> {
    let mut argv = vec![binary.to_string()];
    argv.extend(request.category.subcommand().iter().map(|s| s.to_string()));
    argv.push("--json".to_string());

    if let Some(endpoint) = settings.endpoint() {
        argv.push(format!("--API={}", endpoint));
    }
    if settings.ignore_unknown_ca {
        argv.push("--insecure".to_string());
    }
    if let Some(org) = settings.organization() {
        argv.push(format!("--org={}", org));
    }
    if !settings.usage_analytics_enabled {
        argv.push("--DISABLE_ANALYTICS".to_string());
    }

    if let Some(extra) = settings.additional_parameters_for(&request.workspace_path) {
        argv.extend(extra.split_whitespace().map(str::to_string));
    }
    argv.extend(request.extra_args.iter().cloned());

    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScanCategory, Secret};
    use proptest::prelude::*;

    fn binary() -> &'static Utf8Path {
        Utf8Path::new("/opt/scanner/snyk-linux")
    }

    #[test]
    fn test_default_settings_emit_no_optional_flags() {
        let request = ScanRequest::new(ScanCategory::Oss, "/proj");
        let argv = build_scan_command(binary(), &request, &ScanSettings::default());
        assert_eq!(argv, vec!["/opt/scanner/snyk-linux", "test", "--json"]);
    }

    #[test]
    fn test_full_flag_order() {
        let settings = ScanSettings {
            custom_endpoint: Some("https://api.eu.example".into()),
            ignore_unknown_ca: true,
            organization: Some("acme".into()),
            usage_analytics_enabled: false,
            additional_parameters: Some("--all-projects  --dev".into()),
            ..ScanSettings::default()
        };
        let request = ScanRequest::new(ScanCategory::Container, "/proj").with_extra_args(["nginx:latest"]);

        let argv = build_scan_command(binary(), &request, &settings);
        assert_eq!(
            argv,
            vec![
                "/opt/scanner/snyk-linux",
                "container",
                "test",
                "--json",
                "--API=https://api.eu.example",
                "--insecure",
                "--org=acme",
                "--DISABLE_ANALYTICS",
                "--all-projects",
                "--dev",
                "nginx:latest",
            ]
        );
    }

    #[test]
    fn test_workspace_parameters_override_global() {
        let mut settings = ScanSettings {
            additional_parameters: Some("--global".into()),
            ..ScanSettings::default()
        };
        settings
            .workspace_parameters
            .insert("/proj".into(), "--file=pom.xml".into());

        let argv = build_scan_command(binary(), &ScanRequest::new(ScanCategory::Oss, "/proj"), &settings);
        assert!(argv.contains(&"--file=pom.xml".to_string()));
        assert!(!argv.contains(&"--global".to_string()));

        let other = build_scan_command(binary(), &ScanRequest::new(ScanCategory::Oss, "/other"), &settings);
        assert!(other.contains(&"--global".to_string()));
    }

    #[test]
    fn test_token_never_in_argv() {
        let settings = ScanSettings {
            token: Some(Secret::new("super-secret-token")),
            ..ScanSettings::default()
        };
        let argv = build_scan_command(binary(), &ScanRequest::new(ScanCategory::Code, "/proj"), &settings);
        assert!(argv.iter().all(|a| !a.contains("super-secret-token")));
        assert_eq!(&argv[1..3], &["code", "test"]);
    }

    fn arb_settings() -> impl Strategy<Value = ScanSettings> {
        (
            any::<bool>(),
            any::<bool>(),
            proptest::option::of("[a-z]{1,8}"),
            proptest::option::of("(--[a-z]{1,6} ?){0,3}"),
        )
            .prop_map(|(insecure, analytics, org, extra)| ScanSettings {
                ignore_unknown_ca: insecure,
                usage_analytics_enabled: analytics,
                organization: org,
                additional_parameters: extra,
                ..ScanSettings::default()
            })
    }

    proptest! {
        #[test]
        fn prop_builder_is_deterministic(settings in arb_settings()) {
            let request = ScanRequest::new(ScanCategory::Iac, "/proj");
            prop_assert_eq!(
                build_scan_command(binary(), &request, &settings),
                build_scan_command(binary(), &request, &settings.clone())
            );
        }

        #[test]
        fn prop_insecure_adds_exactly_one_token(settings in arb_settings()) {
            let request = ScanRequest::new(ScanCategory::Oss, "/proj");
            let mut off = settings.clone();
            off.ignore_unknown_ca = false;
            let mut on = settings;
            on.ignore_unknown_ca = true;

            let argv_off = build_scan_command(binary(), &request, &off);
            let argv_on = build_scan_command(binary(), &request, &on);
            prop_assert_eq!(argv_on.len(), argv_off.len() + 1);
            prop_assert_eq!(argv_on.iter().filter(|a| *a == "--insecure").count(), 1);
        }

        #[test]
        fn prop_org_precedes_free_form_args(org in "[a-z]{1,8}", extra in "--[a-z]{1,6}( --[a-z]{1,6}){0,2}") {
            let settings = ScanSettings {
                organization: Some(org.clone()),
                additional_parameters: Some(extra),
                ..ScanSettings::default()
            };
            let argv = build_scan_command(binary(), &ScanRequest::new(ScanCategory::Oss, "/proj"), &settings);
            let org_flag = format!("--org={}", org);
            let org_positions: Vec<usize> = argv
                .iter()
                .enumerate()
                .filter(|(_, a)| **a == org_flag)
                .map(|(i, _)| i)
                .collect();
            prop_assert_eq!(org_positions.len(), 1);
            let first_extra = argv.len() - settings.additional_parameters.as_deref().unwrap().split_whitespace().count();
            prop_assert!(org_positions[0] < first_extra);
        }
    }
}
