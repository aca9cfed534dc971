use super::*;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;

fn sample_config() -> UpdateConfig {
    UpdateConfig {
        spec: UpdateSpec {
            proxy: "proxy.example.com:3080".to_string(),
            group: "staging".to_string(),
            url_template: String::new(),
            enabled: true,
        },
        status: UpdateStatus {
            active_version: "15.0.0".to_string(),
            backup_version: "14.3.0".to_string(),
        },
        ..UpdateConfig::default()
    }
}

#[test]
fn test_read_missing_file_returns_tagged_default() {
    let dir = TempDir::new().unwrap();
    let cfg = read_config(&dir.path().join("update.yaml")).unwrap();
    assert_eq!(cfg.kind, "update_config");
    assert_eq!(cfg.version, "v1");
    assert_eq!(cfg.spec, UpdateSpec::default());
    assert_eq!(cfg.status, UpdateStatus::default());
}

#[test]
fn test_write_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("update.yaml");
    let cfg = sample_config();
    write_config(&path, &cfg).unwrap();
    let loaded = read_config(&path).unwrap();
    assert_eq!(loaded, cfg);
}

#[test]
fn test_read_rejects_wrong_kind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("update.yaml");
    std::fs::write(&path, "version: v1\nkind: other_config\n").unwrap();
    let err = read_config(&path).unwrap_err();
    assert!(matches!(err, UpdateError::ConfigKind(k) if k == "other_config"));
}

#[test]
fn test_read_rejects_wrong_version() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("update.yaml");
    std::fs::write(&path, "version: v2\nkind: update_config\n").unwrap();
    let err = read_config(&path).unwrap_err();
    assert!(matches!(err, UpdateError::ConfigVersion(v) if v == "v2"));
}

#[test]
fn test_read_reports_parse_errors_with_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("update.yaml");
    std::fs::write(&path, "version: v1\nkind: update_config\nspec: [not, a, map]\n").unwrap();
    let err = read_config(&path).unwrap_err();
    assert!(matches!(err, UpdateError::ConfigParse { .. }));
}

#[test]
fn test_first_write_creates_with_default_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("update.yaml");
    write_config(&path, &sample_config()).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o755);
}

#[test]
fn test_replace_preserves_existing_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("update.yaml");
    write_config(&path, &sample_config()).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

    let mut cfg = sample_config();
    cfg.spec.enabled = false;
    write_config(&path, &cfg).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o600);
    assert!(!read_config(&path).unwrap().spec.enabled);
}

#[test]
fn test_replace_never_leaves_partial_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("update.yaml");
    write_config(&path, &sample_config()).unwrap();
    let before = std::fs::read_to_string(&path).unwrap();

    let mut cfg = sample_config();
    cfg.status.active_version = "15.1.0".to_string();
    cfg.status.backup_version = "15.0.0".to_string();
    write_config(&path, &cfg).unwrap();
    let after = std::fs::read_to_string(&path).unwrap();

    // Both observations are complete, parseable documents.
    assert_ne!(before, after);
    for raw in [&before, &after] {
        let parsed: UpdateConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(parsed.kind, "update_config");
    }
}

#[test]
fn test_validate_merges_overrides() {
    let mut spec = UpdateSpec::default();
    let overrides = OverrideConfig {
        proxy: "proxy.example.com".to_string(),
        group: "canary".to_string(),
        url_template: "https://mirror.example.com/{version}.tar.gz".to_string(),
        force_version: String::new(),
    };
    validate_spec(&mut spec, &overrides).unwrap();
    assert_eq!(spec.proxy, "proxy.example.com");
    assert_eq!(spec.group, "canary");
    assert_eq!(spec.url_template, "https://mirror.example.com/{version}.tar.gz");
}

#[test]
fn test_validate_keeps_existing_values_for_empty_overrides() {
    let mut spec = UpdateSpec {
        proxy: "proxy.example.com".to_string(),
        group: "staging".to_string(),
        ..UpdateSpec::default()
    };
    validate_spec(&mut spec, &OverrideConfig::default()).unwrap();
    assert_eq!(spec.proxy, "proxy.example.com");
    assert_eq!(spec.group, "staging");
}

#[test]
fn test_validate_requires_proxy() {
    let mut spec = UpdateSpec::default();
    let err = validate_spec(&mut spec, &OverrideConfig::default()).unwrap_err();
    assert!(matches!(err, UpdateError::Validation(_)));
}

#[test]
fn test_validate_rejects_plain_http_template() {
    let mut spec = UpdateSpec {
        proxy: "proxy.example.com".to_string(),
        url_template: "http://mirror.example.com/{version}.tar.gz".to_string(),
        ..UpdateSpec::default()
    };
    let err = validate_spec(&mut spec, &OverrideConfig::default()).unwrap_err();
    assert!(matches!(err, UpdateError::Validation(_)));
}

#[test]
fn test_validate_accepts_uppercase_https() {
    let mut spec = UpdateSpec {
        proxy: "proxy.example.com".to_string(),
        url_template: "HTTPS://mirror.example.com/{version}.tar.gz".to_string(),
        ..UpdateSpec::default()
    };
    validate_spec(&mut spec, &OverrideConfig::default()).unwrap();
}
