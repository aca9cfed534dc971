use std::path::PathBuf;
use thiserror::Error;

/// Format a YAML error for display, including the failing field path.
fn format_yaml_error(e: &serde_path_to_error::Error<serde_yaml::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let msg = match inner.location() {
        Some(loc) => format!("line {}, column {}: {}", loc.line(), loc.column(), inner),
        None => inner.to_string(),
    };
    if path.is_empty() {
        msg
    } else {
        format!("{}: {}", path, msg)
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    // Sentinel outcomes. Callers match on the variant, never on the message.
    #[error("version is linked")]
    Linked,

    #[error("not needed")]
    NotNeeded,

    #[error("not supported on this platform")]
    NotSupported,

    #[error("{operation} canceled")]
    Canceled { operation: &'static str },

    #[error("{0}")]
    Validation(String),

    #[error("failed to parse config file '{path}':\n  {}", format_yaml_error(.source))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("invalid config kind {0:?}")]
    ConfigKind(String),

    #[error("invalid config version {0:?}")]
    ConfigVersion(String),

    #[error("failed to encode config: {0}")]
    ConfigEncode(#[source] serde_yaml::Error),

    #[error("failed to {action} '{path}': {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to construct HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to request version from proxy: {0}")]
    Discovery(#[source] reqwest::Error),

    #[error("proxy returned status {0}")]
    DiscoveryStatus(reqwest::StatusCode),

    #[error("agent version not available from cluster")]
    NoVersion,

    #[error("failed to download '{url}': {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of '{url}' returned status {status}")]
    DownloadStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("not enough free disk space: {available} bytes available, {required} bytes required")]
    DiskSpace { available: u64, required: u64 },

    #[error("failed to extract archive: {0}")]
    Extract(#[source] std::io::Error),

    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("service {service} did not become healthy after reload")]
    Unhealthy { service: String },

    #[error("failed to validate configuration for new version {version:?} of the agent")]
    NewVersionConfig {
        version: String,
        #[source]
        source: Box<UpdateError>,
    },

    #[error("failed to start new version {version:?} of the agent")]
    NewVersionStart {
        version: String,
        #[source]
        source: Box<UpdateError>,
    },
}

impl UpdateError {
    /// True for the cancellation sentinel, regardless of which operation
    /// observed it. Compensation is skipped for canceled operations.
    pub fn is_canceled(&self) -> bool {
        matches!(self, UpdateError::Canceled { .. })
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
