//! Persistence for the on-disk update configuration.
//!
//! The updater keeps a single `update.yaml` document inside the versions
//! directory. It records the operator's intent (`spec`) and the observed
//! installation state (`status`), and is only ever replaced atomically so a
//! reader sees either the prior document or the new one in full.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, UpdateError};

/// Name of the configuration file inside the versions directory.
pub const UPDATE_CONFIG_NAME: &str = "update.yaml";

const CONFIG_VERSION: &str = "v1";
const CONFIG_KIND: &str = "update_config";

/// Mode applied when the config file is first created. Replacements keep the
/// existing file's permission bits instead.
const DEFAULT_CONFIG_MODE: u32 = 0o755;

/// The `update.yaml` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Schema version of the document (always "v1").
    pub version: String,
    /// Kind of the document (always "update_config").
    pub kind: String,
    /// User-specified configuration.
    #[serde(default)]
    pub spec: UpdateSpec,
    /// Observed installation state.
    #[serde(default)]
    pub status: UpdateStatus,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            kind: CONFIG_KIND.to_string(),
            spec: UpdateSpec::default(),
            status: UpdateStatus::default(),
        }
    }
}

/// User intent persisted in the `spec` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSpec {
    /// Proxy address used for version discovery (host[:port]).
    #[serde(default)]
    pub proxy: String,
    /// Update group identifier for staged rollouts.
    #[serde(default)]
    pub group: String,
    /// Template for the agent tarball download URL.
    #[serde(default)]
    pub url_template: String,
    /// Whether automatic updates are enabled.
    #[serde(default)]
    pub enabled: bool,
}

/// Observed state persisted in the `status` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    /// The version currently linked and running.
    #[serde(default)]
    pub active_version: String,
    /// The previous version, retained for rollback. May be empty.
    #[serde(default)]
    pub backup_version: String,
}

/// Per-invocation overrides for a single update operation.
///
/// Non-empty fields replace the corresponding `spec` fields before use and,
/// if the operation succeeds, are persisted with the rest of the document.
#[derive(Debug, Clone, Default)]
pub struct OverrideConfig {
    pub proxy: String,
    pub group: String,
    pub url_template: String,
    /// Install this version instead of asking the proxy.
    pub force_version: String,
}

/// Read the config document from `path`.
///
/// A missing file yields a default document with the correct tags; a document
/// with unexpected `kind` or `version` tags is a hard error.
pub fn read_config(path: &Path) -> Result<UpdateConfig> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(UpdateConfig::default());
        }
        Err(source) => {
            return Err(UpdateError::Io {
                action: "read",
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: UpdateConfig =
        serde_path_to_error::deserialize(de).map_err(|source| UpdateError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
    if cfg.kind != CONFIG_KIND {
        return Err(UpdateError::ConfigKind(cfg.kind));
    }
    if cfg.version != CONFIG_VERSION {
        return Err(UpdateError::ConfigVersion(cfg.version));
    }
    Ok(cfg)
}

/// Write the config document to `path` atomically.
///
/// The document is written to a temporary file in the same directory, synced,
/// and renamed over the target, so a crash leaves either the prior document
/// or the new one intact. Permission bits of an existing file are preserved.
pub fn write_config(path: &Path, cfg: &UpdateConfig) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        UpdateError::Validation(format!("config path '{}' has no parent directory", path.display()))
    })?;
    let mode = match fs::metadata(path) {
        Ok(meta) => meta.permissions().mode() & 0o7777,
        Err(_) => DEFAULT_CONFIG_MODE,
    };

    let encoded = serde_yaml::to_string(cfg).map_err(UpdateError::ConfigEncode)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| UpdateError::Io {
        action: "create temp file in",
        path: parent.to_path_buf(),
        source,
    })?;
    let io_err = |action, source| UpdateError::Io {
        action,
        path: path.to_path_buf(),
        source,
    };
    tmp.write_all(encoded.as_bytes())
        .map_err(|e| io_err("write", e))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| io_err("set permissions on", e))?;
    tmp.as_file().sync_all().map_err(|e| io_err("sync", e))?;
    tmp.persist(path)
        .map_err(|e| io_err("replace", e.error))?;
    Ok(())
}

/// Fold `override_cfg` into `spec` and validate the result.
///
/// The proxy address is required; a non-empty URL template must use TLS.
pub fn validate_spec(spec: &mut UpdateSpec, override_cfg: &OverrideConfig) -> Result<()> {
    if !override_cfg.proxy.is_empty() {
        spec.proxy = override_cfg.proxy.clone();
    }
    if !override_cfg.group.is_empty() {
        spec.group = override_cfg.group.clone();
    }
    if !override_cfg.url_template.is_empty() {
        spec.url_template = override_cfg.url_template.clone();
    }
    if !spec.url_template.is_empty()
        && !spec.url_template.to_lowercase().starts_with("https://")
    {
        return Err(UpdateError::Validation(
            "agent download URL must use TLS (https://)".to_string(),
        ));
    }
    if spec.proxy.is_empty() {
        return Err(UpdateError::Validation(format!(
            "proxy address must be specified with --proxy or present in {}",
            UPDATE_CONFIG_NAME
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
