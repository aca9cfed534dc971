//! Interaction with the systemd-managed agent process.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{Result, UpdateError};

/// How long to wait for the daemon to report healthy after a reload.
const RELOAD_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between health probes while waiting for the daemon.
const RELOAD_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Controls the running agent through the host service manager.
#[async_trait]
pub trait Process: Send + Sync {
    /// Reconcile and validate process configuration with the service
    /// manager. Must be called after any link change and before [`reload`].
    /// Returns [`UpdateError::NotSupported`] on hosts without a recognized
    /// service manager.
    ///
    /// [`reload`]: Process::reload
    async fn sync(&self, cancel: &CancellationToken) -> Result<()>;

    /// Reload the agent as gracefully as possible, returning only once it is
    /// observed healthy. Returns [`UpdateError::NotNeeded`] when the agent is
    /// not running, and [`UpdateError::NotSupported`] on hosts without a
    /// recognized service manager.
    async fn reload(&self, cancel: &CancellationToken) -> Result<()>;
}

/// [`Process`] implementation backed by systemctl.
pub struct SystemdService {
    pub service_name: String,
}

impl SystemdService {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn check_supported() -> Result<()> {
        if !Path::new("/run/systemd/system").exists() {
            return Err(UpdateError::NotSupported);
        }
        Ok(())
    }

    async fn systemctl(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        args: &[&str],
    ) -> Result<std::process::Output> {
        let mut command = Command::new("systemctl");
        command.args(args);
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Canceled { operation }),
            output = command.output() => output,
        };
        match output {
            Ok(output) => Ok(output),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(UpdateError::NotSupported)
            }
            Err(err) => Err(UpdateError::Command {
                command: format!("systemctl {}", args.join(" ")),
                detail: err.to_string(),
            }),
        }
    }

    async fn is_active(&self, cancel: &CancellationToken, operation: &'static str) -> Result<bool> {
        let probe = self
            .systemctl(cancel, operation, &["is-active", "--quiet", &self.service_name])
            .await?;
        Ok(probe.status.success())
    }

    /// Poll the unit until it reports active, or fail after the health
    /// timeout.
    async fn wait_healthy(&self, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + RELOAD_HEALTH_TIMEOUT;
        loop {
            if self.is_active(cancel, "reload").await? {
                debug!(service = %self.service_name, "Service is active after reload.");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UpdateError::Unhealthy {
                    service: self.service_name.clone(),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(UpdateError::Canceled { operation: "reload" });
                }
                _ = sleep(RELOAD_HEALTH_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl Process for SystemdService {
    async fn sync(&self, cancel: &CancellationToken) -> Result<()> {
        Self::check_supported()?;
        let output = self.systemctl(cancel, "sync", &["daemon-reload"]).await?;
        if !output.status.success() {
            return Err(UpdateError::Command {
                command: "systemctl daemon-reload".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!("Systemd units reloaded.");
        Ok(())
    }

    async fn reload(&self, cancel: &CancellationToken) -> Result<()> {
        Self::check_supported()?;
        if !self.is_active(cancel, "reload").await? {
            debug!(service = %self.service_name, "Service not active, reload not needed.");
            return Err(UpdateError::NotNeeded);
        }
        let output = self
            .systemctl(
                cancel,
                "reload",
                &["try-reload-or-restart", &self.service_name],
            )
            .await?;
        if !output.status.success() {
            return Err(UpdateError::Command {
                command: format!("systemctl try-reload-or-restart {}", self.service_name),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.wait_healthy(cancel).await
    }
}
