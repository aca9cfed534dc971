use super::*;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;

fn installer(root: &Path) -> LocalInstaller {
    LocalInstaller::new(
        root.join("versions"),
        &root.join("local"),
        reqwest::Client::new(),
    )
}

/// Lay down a fake installed version with a binary and a unit file.
fn seed_version(install_dir: &Path, version: &str) {
    let dir = install_dir.join(version);
    fs::create_dir_all(dir.join("examples/systemd")).unwrap();
    fs::write(dir.join("teleport"), "#!/bin/sh\n").unwrap();
    fs::set_permissions(dir.join("teleport"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(dir.join("examples/systemd/teleport.service"), "[Unit]\n").unwrap();
}

#[test]
fn test_render_download_url_oss() {
    let url = render_download_url(CDN_URL_TEMPLATE, "15.0.0", InstallFlags::default());
    assert_eq!(
        url,
        format!(
            "https://cdn.teleport.dev/teleport-v15.0.0-{}-{}-bin.tar.gz",
            std::env::consts::OS,
            target_arch()
        )
    );
}

#[test]
fn test_render_download_url_enterprise_fips() {
    let flags = InstallFlags {
        enterprise: true,
        fips: true,
    };
    let url = render_download_url(CDN_URL_TEMPLATE, "15.0.0", flags);
    assert!(url.starts_with("https://cdn.teleport.dev/teleport-ent-v15.0.0-"));
    assert!(url.ends_with("-fips-bin.tar.gz"));
}

#[test]
fn test_render_download_url_custom_template() {
    let url = render_download_url(
        "https://mirror.example.com/agent/{version}/{os}/{arch}",
        "15.0.0",
        InstallFlags::default(),
    );
    assert_eq!(
        url,
        format!(
            "https://mirror.example.com/agent/15.0.0/{}/{}",
            std::env::consts::OS,
            target_arch()
        )
    );
}

#[test]
fn test_validate_version_name() {
    assert!(validate_version_name("15.0.0").is_ok());
    assert!(validate_version_name("15.0.0-rc.1").is_ok());
    assert!(validate_version_name("").is_err());
    assert!(validate_version_name("../escape").is_err());
    assert!(validate_version_name("a/b").is_err());
    assert!(validate_version_name(".hidden").is_err());
}

#[tokio::test]
async fn test_list_missing_dir_is_empty() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    assert!(installer.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_skips_files_and_hidden_entries() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    seed_version(&installer.install_dir, "15.0.0");
    seed_version(&installer.install_dir, "14.3.0");
    fs::write(installer.install_dir.join("update.yaml"), "kind: update_config\n").unwrap();
    fs::create_dir(installer.install_dir.join(".extract-abc")).unwrap();

    let versions = installer.list().await.unwrap();
    assert_eq!(versions, vec!["14.3.0".to_string(), "15.0.0".to_string()]);
}

#[tokio::test]
async fn test_link_points_symlinks_at_version() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    seed_version(&installer.install_dir, "15.0.0");

    installer.link("15.0.0").await.unwrap();

    let bin = fs::read_link(installer.link_bin_dir.join("teleport")).unwrap();
    assert_eq!(bin, installer.install_dir.join("15.0.0/teleport"));
    let unit = fs::read_link(installer.link_service_dir.join(SERVICE_NAME)).unwrap();
    assert_eq!(
        unit,
        installer
            .install_dir
            .join("15.0.0/examples/systemd/teleport.service")
    );
}

#[tokio::test]
async fn test_link_is_idempotent() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    seed_version(&installer.install_dir, "15.0.0");

    installer.link("15.0.0").await.unwrap();
    installer.link("15.0.0").await.unwrap();

    let bin = fs::read_link(installer.link_bin_dir.join("teleport")).unwrap();
    assert_eq!(bin, installer.install_dir.join("15.0.0/teleport"));
}

#[tokio::test]
async fn test_link_unknown_version_fails() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    let err = installer.link("15.0.0").await.unwrap_err();
    assert!(matches!(err, UpdateError::Validation(_)));
}

#[tokio::test]
async fn test_revert_removes_links_without_prior_target() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    seed_version(&installer.install_dir, "15.0.0");

    let revert = installer.link("15.0.0").await.unwrap();
    assert!(revert.revert().await);

    assert!(fs::read_link(installer.link_bin_dir.join("teleport")).is_err());
    assert!(fs::read_link(installer.link_service_dir.join(SERVICE_NAME)).is_err());
}

#[tokio::test]
async fn test_revert_restores_prior_version() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    seed_version(&installer.install_dir, "15.0.0");
    seed_version(&installer.install_dir, "15.1.0");

    installer.link("15.0.0").await.unwrap();
    let revert = installer.link("15.1.0").await.unwrap();

    let bin = fs::read_link(installer.link_bin_dir.join("teleport")).unwrap();
    assert_eq!(bin, installer.install_dir.join("15.1.0/teleport"));

    assert!(revert.revert().await);
    let bin = fs::read_link(installer.link_bin_dir.join("teleport")).unwrap();
    assert_eq!(bin, installer.install_dir.join("15.0.0/teleport"));

    // Revert is idempotent.
    assert!(revert.revert().await);
    let bin = fs::read_link(installer.link_bin_dir.join("teleport")).unwrap();
    assert_eq!(bin, installer.install_dir.join("15.0.0/teleport"));
}

#[tokio::test]
async fn test_remove_absent_version_is_noop() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    installer.remove("15.0.0").await.unwrap();
}

#[tokio::test]
async fn test_remove_refuses_linked_version() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    seed_version(&installer.install_dir, "15.0.0");
    installer.link("15.0.0").await.unwrap();

    let err = installer.remove("15.0.0").await.unwrap_err();
    assert!(matches!(err, UpdateError::Linked));
    assert!(installer.install_dir.join("15.0.0").exists());
}

#[tokio::test]
async fn test_remove_deletes_unlinked_version() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    seed_version(&installer.install_dir, "15.0.0");
    seed_version(&installer.install_dir, "15.1.0");
    installer.link("15.1.0").await.unwrap();

    installer.remove("15.0.0").await.unwrap();
    assert!(!installer.install_dir.join("15.0.0").exists());
    assert!(installer.install_dir.join("15.1.0").exists());
}

#[tokio::test]
async fn test_remove_rejects_path_escapes() {
    let root = TempDir::new().unwrap();
    let installer = installer(root.path());
    let err = installer.remove("../outside").await.unwrap_err();
    assert!(matches!(err, UpdateError::Validation(_)));
}

#[test]
fn test_payload_root_unwraps_single_directory() {
    let staging = TempDir::new().unwrap();
    fs::create_dir(staging.path().join("teleport")).unwrap();
    fs::write(staging.path().join("teleport/teleport"), "bin").unwrap();

    let root = payload_root(staging.path()).unwrap();
    assert_eq!(root, staging.path().join("teleport"));
}

#[test]
fn test_payload_root_keeps_flat_layout() {
    let staging = TempDir::new().unwrap();
    fs::write(staging.path().join("teleport"), "bin").unwrap();
    fs::write(staging.path().join("tsh"), "bin").unwrap();

    let root = payload_root(staging.path()).unwrap();
    assert_eq!(root, staging.path());
}
