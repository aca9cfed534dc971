//! Host-local auto-updates for the agent daemon.
//!
//! This crate provides:
//! - `Updater` - the orchestration state machine behind enable/disable
//! - `read_config` / `write_config` - atomic persistence for `update.yaml`
//! - `Installer` / `LocalInstaller` - versioned installs and symlink swaps
//! - `Process` / `SystemdService` - configuration sync and daemon reload
//! - `Discovery` / `WebDiscovery` - target version lookup from the proxy

pub mod config;
pub mod discovery;
pub mod errors;
pub mod install;
pub mod process;
pub mod updater;

pub use config::{
    read_config, write_config, OverrideConfig, UpdateConfig, UpdateSpec, UpdateStatus,
    UPDATE_CONFIG_NAME,
};
pub use discovery::{Discovery, FindResponse, WebDiscovery, DISCOVERY_TIMEOUT};
pub use errors::{Result, UpdateError};
pub use install::{
    InstallFlags, Installer, LocalInstaller, Revert, CDN_URL_TEMPLATE, RESERVED_FREE_DISK,
    SERVICE_NAME,
};
pub use process::{Process, SystemdService};
pub use updater::{
    LocalUpdaterConfig, Updater, DEFAULT_LINK_DIR, DEFAULT_VERSIONS_DIR,
};
