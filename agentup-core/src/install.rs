//! Installation and linking of versioned agent distributions.
//!
//! Each installed version lives in its own subdirectory of the versions
//! directory. Extraction happens in a hidden staging directory followed by a
//! single rename, so the presence of a version directory always means the
//! install completed. Linking swaps symlinks atomically and hands back a
//! revert handle that restores the previous link targets.

use std::fs;
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Result, UpdateError};

/// Default template for the agent tarball download URL.
pub const CDN_URL_TEMPLATE: &str =
    "https://cdn.teleport.dev/teleport{ent}-v{version}-{os}-{arch}{fips}-bin.tar.gz";

/// Minimum free space kept on disk during download and install.
pub const RESERVED_FREE_DISK: u64 = 10_000_000; // 10 MB

/// Name of the systemd unit managed by the updater.
pub const SERVICE_NAME: &str = "teleport.service";

/// Location of the unit file inside a version directory.
const SERVICE_UNIT_PATH: &str = "examples/systemd/teleport.service";

/// Binaries linked into the system bin directory when present.
const AGENT_BINARIES: &[&str] = &["teleport", "tctl", "tsh", "tbot"];

/// Prefix for extraction staging directories inside the versions directory.
const STAGING_PREFIX: &str = ".extract-";

/// Distribution variant flags derived from the discovery response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallFlags {
    pub enterprise: bool,
    pub fips: bool,
}

/// Compensating action returned by [`Installer::link`].
///
/// Restores the symlink state recorded at link time, returning false if any
/// link could not be restored. Must be idempotent.
#[async_trait]
pub trait Revert: Send + Sync + std::fmt::Debug {
    async fn revert(&self) -> bool;
}

/// Manages versioned installations of the agent.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Materialize `version` on disk from the download template. A no-op if
    /// the version is already installed.
    async fn install(
        &self,
        cancel: &CancellationToken,
        version: &str,
        template: &str,
        flags: InstallFlags,
    ) -> Result<()>;

    /// Atomically point the system symlinks at `version`. Idempotent.
    async fn link(&self, version: &str) -> Result<Box<dyn Revert>>;

    /// Enumerate installed version directories.
    async fn list(&self) -> Result<Vec<String>>;

    /// Delete an installed version. Returns [`UpdateError::Linked`] if the
    /// version is the current link target; removing an absent version is a
    /// no-op.
    async fn remove(&self, version: &str) -> Result<()>;
}

/// Installs agent versions under a local versions directory and links them
/// into the system bin and systemd unit directories.
pub struct LocalInstaller {
    pub install_dir: PathBuf,
    pub link_bin_dir: PathBuf,
    pub link_service_dir: PathBuf,
    pub http: reqwest::Client,
    pub reserved_free_disk: u64,
}

impl LocalInstaller {
    pub fn new(install_dir: PathBuf, link_dir: &Path, http: reqwest::Client) -> Self {
        Self {
            install_dir,
            link_bin_dir: link_dir.join("bin"),
            link_service_dir: link_dir.join("lib/systemd/system"),
            http,
            reserved_free_disk: RESERVED_FREE_DISK,
        }
    }

    fn version_dir(&self, version: &str) -> Result<PathBuf> {
        validate_version_name(version)?;
        Ok(self.install_dir.join(version))
    }

    /// Fail if the filesystem holding the versions directory would drop below
    /// the reserved free-space margin after writing `incoming` more bytes.
    fn check_free_disk(&self, incoming: u64) -> Result<()> {
        let stat = nix::sys::statvfs::statvfs(self.install_dir.as_path()).map_err(|errno| {
            UpdateError::Io {
                action: "stat filesystem of",
                path: self.install_dir.clone(),
                source: std::io::Error::from_raw_os_error(errno as i32),
            }
        })?;
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        let required = self.reserved_free_disk.saturating_add(incoming);
        if available < required {
            return Err(UpdateError::DiskSpace {
                available,
                required,
            });
        }
        Ok(())
    }

    /// Remove staging directories left behind by a crashed extraction.
    fn sweep_stale_staging(&self) {
        let Ok(entries) = fs::read_dir(&self.install_dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                if let Err(err) = fs::remove_dir_all(entry.path()) {
                    warn!(
                        path = %entry.path().display(),
                        error = %err,
                        "Failed to remove stale staging directory."
                    );
                }
            }
        }
    }

    /// Stream the archive at `url` into a temporary file inside the versions
    /// directory, keeping the free-disk margin intact throughout.
    async fn download(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<tempfile::NamedTempFile> {
        debug!(url, "Downloading agent archive.");
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| UpdateError::Download {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(UpdateError::DownloadStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }
        if let Some(length) = response.content_length() {
            self.check_free_disk(length)?;
        }

        let mut file =
            tempfile::NamedTempFile::new_in(&self.install_dir).map_err(|source| {
                UpdateError::Io {
                    action: "create temp file in",
                    path: self.install_dir.clone(),
                    source,
                }
            })?;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(UpdateError::Canceled { operation: "download" });
                }
                chunk = response.chunk() => chunk.map_err(|source| UpdateError::Download {
                    url: url.to_string(),
                    source,
                })?,
            };
            let Some(bytes) = chunk else { break };
            file.write_all(&bytes).map_err(|source| UpdateError::Io {
                action: "write",
                path: file.path().to_path_buf(),
                source,
            })?;
            self.check_free_disk(0)?;
        }
        Ok(file)
    }

    /// Unpack a downloaded tar.gz into a staging directory and return the
    /// payload root (the single top-level directory if the archive has one).
    async fn extract(&self, archive: &Path) -> Result<(tempfile::TempDir, PathBuf)> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.install_dir)
            .map_err(|source| UpdateError::Io {
                action: "create staging directory in",
                path: self.install_dir.clone(),
                source,
            })?;

        let archive_path = archive.to_path_buf();
        let unpack_dir = staging.path().to_path_buf();
        let unpack = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = fs::File::open(&archive_path)?;
            let decoder = flate2::read::GzDecoder::new(file);
            tar::Archive::new(decoder).unpack(&unpack_dir)
        })
        .await
        .map_err(|err| UpdateError::Extract(std::io::Error::other(err)))?;
        unpack.map_err(UpdateError::Extract)?;

        let payload = payload_root(staging.path()).map_err(UpdateError::Extract)?;
        Ok((staging, payload))
    }

    /// True when any system symlink currently resolves into `version_dir`.
    fn is_linked(&self, version_dir: &Path) -> bool {
        for name in AGENT_BINARIES {
            if let Ok(target) = fs::read_link(self.link_bin_dir.join(name)) {
                if target.starts_with(version_dir) {
                    return true;
                }
            }
        }
        if let Ok(target) = fs::read_link(self.link_service_dir.join(SERVICE_NAME)) {
            if target.starts_with(version_dir) {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl Installer for LocalInstaller {
    async fn install(
        &self,
        cancel: &CancellationToken,
        version: &str,
        template: &str,
        flags: InstallFlags,
    ) -> Result<()> {
        let version_dir = self.version_dir(version)?;
        if version_dir.exists() {
            debug!(version, "Version already installed.");
            return Ok(());
        }
        fs::create_dir_all(&self.install_dir).map_err(|source| UpdateError::Io {
            action: "create",
            path: self.install_dir.clone(),
            source,
        })?;
        self.sweep_stale_staging();
        self.check_free_disk(0)?;

        let url = render_download_url(template, version, flags);
        let archive = self.download(cancel, &url).await?;
        self.check_free_disk(0)?;
        let (staging, payload) = self.extract(archive.path()).await?;

        // Single rename: the version directory either exists in full or not
        // at all.
        fs::rename(&payload, &version_dir).map_err(|source| UpdateError::Io {
            action: "rename staged install to",
            path: version_dir.clone(),
            source,
        })?;
        drop(staging);
        debug!(version, "Version installed.");
        Ok(())
    }

    async fn link(&self, version: &str) -> Result<Box<dyn Revert>> {
        let version_dir = self.version_dir(version)?;
        if !version_dir.exists() {
            return Err(UpdateError::Validation(format!(
                "version {version:?} is not installed"
            )));
        }
        for dir in [&self.link_bin_dir, &self.link_service_dir] {
            fs::create_dir_all(dir).map_err(|source| UpdateError::Io {
                action: "create",
                path: dir.clone(),
                source,
            })?;
        }

        let mut restore = Vec::new();
        for name in AGENT_BINARIES {
            let target = version_dir.join(name);
            if !target.exists() {
                continue;
            }
            let link = self.link_bin_dir.join(name);
            restore.push((link.clone(), fs::read_link(&link).ok()));
            replace_symlink(&target, &link)?;
        }
        let unit_target = version_dir.join(SERVICE_UNIT_PATH);
        if unit_target.exists() {
            let link = self.link_service_dir.join(SERVICE_NAME);
            restore.push((link.clone(), fs::read_link(&link).ok()));
            replace_symlink(&unit_target, &link)?;
        }
        if restore.is_empty() {
            return Err(UpdateError::Validation(format!(
                "version {version:?} contains no linkable binaries or unit file"
            )));
        }
        debug!(version, links = restore.len(), "Version linked.");
        Ok(Box::new(LinkRevert { restore }))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.install_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(UpdateError::Io {
                    action: "read",
                    path: self.install_dir.clone(),
                    source,
                });
            }
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| UpdateError::Io {
                action: "read",
                path: self.install_dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.path().is_dir() {
                versions.push(name);
            }
        }
        versions.sort();
        Ok(versions)
    }

    async fn remove(&self, version: &str) -> Result<()> {
        let version_dir = self.version_dir(version)?;
        if !version_dir.exists() {
            return Ok(());
        }
        if self.is_linked(&version_dir) {
            return Err(UpdateError::Linked);
        }
        fs::remove_dir_all(&version_dir).map_err(|source| UpdateError::Io {
            action: "remove",
            path: version_dir.clone(),
            source,
        })?;
        debug!(version, "Version removed.");
        Ok(())
    }
}

/// Revert handle recording the symlink targets observed before a link swap.
#[derive(Debug)]
struct LinkRevert {
    restore: Vec<(PathBuf, Option<PathBuf>)>,
}

#[async_trait]
impl Revert for LinkRevert {
    async fn revert(&self) -> bool {
        let mut ok = true;
        for (link, prior) in &self.restore {
            let result = match prior {
                Some(target) => replace_symlink(target, link),
                None => match fs::remove_file(link) {
                    Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                        Err(UpdateError::Io {
                            action: "remove",
                            path: link.clone(),
                            source: err,
                        })
                    }
                    _ => Ok(()),
                },
            };
            if let Err(err) = result {
                warn!(link = %link.display(), error = %err, "Failed to restore previous symlink.");
                ok = false;
            }
        }
        ok
    }
}

/// Render a download URL from a template.
///
/// Recognized placeholders: `{version}`, `{os}`, `{arch}`, `{ent}` (expands
/// to `-ent` for enterprise builds) and `{fips}` (`-fips` for FIPS builds).
pub fn render_download_url(template: &str, version: &str, flags: InstallFlags) -> String {
    template
        .replace("{version}", version)
        .replace("{os}", std::env::consts::OS)
        .replace("{arch}", target_arch())
        .replace("{ent}", if flags.enterprise { "-ent" } else { "" })
        .replace("{fips}", if flags.fips { "-fips" } else { "" })
}

fn target_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Version strings become path segments; reject anything that would escape
/// the versions directory.
fn validate_version_name(version: &str) -> Result<()> {
    if version.is_empty()
        || version.starts_with('.')
        || version.contains('/')
        || version.contains('\\')
    {
        return Err(UpdateError::Validation(format!(
            "invalid version name {version:?}"
        )));
    }
    Ok(())
}

/// Atomically replace `link` so it points at `target`: the new symlink is
/// created under a temporary name and renamed over the old one.
fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let dir = link.parent().ok_or_else(|| {
        UpdateError::Validation(format!("link path '{}' has no parent directory", link.display()))
    })?;
    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = dir.join(format!(".{name}.new"));
    let _ = fs::remove_file(&staged);
    symlink(target, &staged).map_err(|source| UpdateError::Io {
        action: "create symlink at",
        path: staged.clone(),
        source,
    })?;
    fs::rename(&staged, link).map_err(|source| UpdateError::Io {
        action: "replace symlink at",
        path: link.to_path_buf(),
        source,
    })
}

/// If extraction produced a single top-level directory, that directory is the
/// distribution root; otherwise the staging directory itself is.
fn payload_root(staging: &Path) -> std::io::Result<PathBuf> {
    let mut entries = fs::read_dir(staging)?.collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() == 1 && entries[0].path().is_dir() {
        return Ok(entries.remove(0).path());
    }
    Ok(staging.to_path_buf())
}

#[cfg(test)]
mod tests;
