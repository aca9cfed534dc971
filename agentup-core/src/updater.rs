//! The update orchestrator.
//!
//! `Updater` composes the config store, version discovery, the installer, and
//! the process supervisor so that the host is always running a version that
//! has been proven to start, or has been reverted to the previous such
//! version. Every step past linking has a compensating action, and the
//! persisted configuration only advances once the new version is observed
//! healthy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{
    read_config, validate_spec, write_config, OverrideConfig, UPDATE_CONFIG_NAME,
};
use crate::discovery::{Discovery, WebDiscovery};
use crate::errors::{Result, UpdateError};
use crate::install::{
    InstallFlags, Installer, LocalInstaller, Revert, CDN_URL_TEMPLATE, SERVICE_NAME,
};
use crate::process::{Process, SystemdService};

/// Default directory holding versioned installations and `update.yaml`.
pub const DEFAULT_VERSIONS_DIR: &str = "/var/lib/teleport/versions";

/// Default prefix for the system-wide binary and unit symlinks.
pub const DEFAULT_LINK_DIR: &str = "/usr/local";

/// Configuration for constructing a host-local [`Updater`].
#[derive(Debug, Clone, Default)]
pub struct LocalUpdaterConfig {
    /// Skip TLS certificate verification for discovery and downloads.
    pub insecure_skip_verify: bool,
    /// Deadline for archive downloads. `None` relies on caller cancellation.
    pub download_timeout: Option<Duration>,
    /// Directory for versioned installations. Defaults to
    /// [`DEFAULT_VERSIONS_DIR`].
    pub versions_dir: Option<PathBuf>,
    /// Prefix for system symlinks. Defaults to [`DEFAULT_LINK_DIR`].
    pub link_dir: Option<PathBuf>,
}

/// Drives agent installations from the currently installed version to the
/// version the cluster advertises, with rollback on any post-link failure.
pub struct Updater {
    config_path: PathBuf,
    installer: Box<dyn Installer>,
    process: Box<dyn Process>,
    discovery: Box<dyn Discovery>,
}

impl Updater {
    /// Build an updater that manages local installations of the agent under
    /// the default directories, talking to systemd.
    pub fn local(cfg: LocalUpdaterConfig) -> Result<Self> {
        let versions_dir = cfg
            .versions_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_VERSIONS_DIR));
        let link_dir = cfg.link_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_LINK_DIR));

        let mut http = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.insecure_skip_verify);
        if let Some(timeout) = cfg.download_timeout {
            http = http.timeout(timeout);
        }
        let http = http.build().map_err(UpdateError::HttpClient)?;

        Ok(Self {
            config_path: versions_dir.join(UPDATE_CONFIG_NAME),
            installer: Box::new(LocalInstaller::new(versions_dir, &link_dir, http)),
            process: Box::new(SystemdService::new(SERVICE_NAME)),
            discovery: Box::new(WebDiscovery::new(cfg.insecure_skip_verify)?),
        })
    }

    /// Build an updater from explicit collaborators.
    pub fn new(
        config_path: PathBuf,
        installer: Box<dyn Installer>,
        process: Box<dyn Process>,
        discovery: Box<dyn Discovery>,
    ) -> Self {
        Self {
            config_path,
            installer,
            process,
            discovery,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Enable automatic updates and attempt an initial update.
    ///
    /// On success the configuration is persisted with `enabled: true` and any
    /// overrides folded in. On failure the persisted configuration is left
    /// unchanged, though an already-completed install may remain on disk for
    /// the next invocation to pick up. Idempotent.
    pub async fn enable(
        &self,
        cancel: &CancellationToken,
        override_cfg: OverrideConfig,
    ) -> Result<()> {
        // Read update.yaml and fold in any overrides passed as flags.
        let mut cfg = read_config(&self.config_path)?;
        validate_spec(&mut cfg.spec, &override_cfg)?;

        // Look up the target version, unless one was forced.
        let mut flags = InstallFlags::default();
        let desired_version = if override_cfg.force_version.is_empty() {
            let resp = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(UpdateError::Canceled { operation: "discovery" });
                }
                resp = self.discovery.find(&cfg.spec.proxy, &cfg.spec.group) => resp?,
            };
            flags.enterprise = resp.edition == "ent";
            flags.fips = resp.fips;
            resp.auto_update.agent_version
        } else {
            override_cfg.force_version.clone()
        };
        if desired_version.is_empty() {
            return Err(UpdateError::NoVersion);
        }

        // Drop a stale backup before installing. When the desired version is
        // the active version we are only re-validating, so the backup stays.
        match cfg.status.backup_version.as_str() {
            "" => {}
            v if v == desired_version => {}
            v if v == cfg.status.active_version => {}
            backup if desired_version == cfg.status.active_version => {
                info!(version = backup, "Backup version retained while re-validating the active version.");
            }
            backup => {
                if let Err(err) = self.installer.remove(backup).await {
                    // The directory may already be gone after a failed install.
                    warn!(version = backup, error = %err, "Failed to remove backup version before new install.");
                }
            }
        }

        // Install the desired version, or validate an existing installation.
        let template = if cfg.spec.url_template.is_empty() {
            CDN_URL_TEMPLATE
        } else {
            cfg.spec.url_template.as_str()
        };
        self.installer
            .install(cancel, &desired_version, template, flags)
            .await?;
        let revert = self.installer.link(&desired_version).await?;

        // From here on, a failure to revert is repaired by the next enable,
        // which re-links the active version.

        match self.process.sync(cancel).await {
            Ok(()) => {}
            Err(err) if err.is_canceled() => {
                return Err(UpdateError::Canceled { operation: "sync" });
            }
            Err(err) => {
                // The new version's configuration was rejected; restore the
                // previous links and re-validate them.
                error!("Reverting symlinks due to invalid configuration.");
                if !revert.revert().await {
                    error!("Failed to revert symlinks. Installation likely broken.");
                } else if let Err(sync_err) = self.process.sync(cancel).await {
                    error!(error = %sync_err, "Failed to sync configuration after reverting.");
                }
                warn!("Configuration error detected; the installation was reverted.");
                return Err(UpdateError::NewVersionConfig {
                    version: desired_version,
                    source: Box::new(err),
                });
            }
        }

        // Reload the agent if the linked version changed.
        if cfg.status.active_version != desired_version {
            info!(version = %desired_version, "Target version successfully installed.");
            match self.process.reload(cancel).await {
                Ok(()) | Err(UpdateError::NotNeeded) => {}
                Err(err) if err.is_canceled() => {
                    return Err(UpdateError::Canceled { operation: "reload" });
                }
                Err(err) => {
                    self.revert_after_failed_reload(cancel, revert.as_ref()).await;
                    warn!("Restart failure detected; the installation was reverted.");
                    return Err(UpdateError::NewVersionStart {
                        version: desired_version,
                        source: Box::new(err),
                    });
                }
            }
            cfg.status.backup_version =
                std::mem::replace(&mut cfg.status.active_version, desired_version);
        } else {
            info!(version = %desired_version, "Target version successfully validated.");
        }
        if !cfg.status.backup_version.is_empty() {
            info!(version = %cfg.status.backup_version, "Backup version set.");
        }

        // Hygiene only: never fails the operation.
        match self.installer.list().await {
            Ok(versions) if versions.len() > 2 => {
                warn!(
                    count = versions.len(),
                    "More than two versions of the agent are installed. The versions directory may need manual cleanup."
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Failed to list installed versions."),
        }

        // The config file is only written once enable has succeeded.
        cfg.spec.enabled = true;
        write_config(&self.config_path, &cfg)?;
        info!("Configuration updated.");
        Ok(())
    }

    /// Disable automatic updates. A pure configuration write: nothing is
    /// uninstalled, unlinked, or stopped. Idempotent.
    pub async fn disable(&self) -> Result<()> {
        let mut cfg = read_config(&self.config_path)?;
        if !cfg.spec.enabled {
            info!("Automatic updates already disabled.");
            return Ok(());
        }
        cfg.spec.enabled = false;
        write_config(&self.config_path, &cfg)
    }

    /// Restore the previous links, then re-sync and re-reload the reverted
    /// version. Each step logs its own failure; none shadows the reload error
    /// that brought us here.
    async fn revert_after_failed_reload(&self, cancel: &CancellationToken, revert: &dyn Revert) {
        error!("Reverting symlinks due to failed restart.");
        if !revert.revert().await {
            error!("Failed to revert symlinks to the older version. Installation likely broken.");
            return;
        }
        match self.process.sync(cancel).await {
            Err(sync_err) => {
                error!(error = %sync_err, "Invalid configuration after reverting to the older version. Installation likely broken.");
            }
            Ok(()) => match self.process.reload(cancel).await {
                Ok(()) | Err(UpdateError::NotNeeded) => {}
                Err(reload_err) => {
                    error!(error = %reload_err, "Failed to restart the older version. Installation likely broken.");
                }
            },
        }
    }
}
