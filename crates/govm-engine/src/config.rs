use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::host;

pub const DEFAULT_LAUNCHER_IMAGE: &str = "govm/govm:latest";
pub const DEFAULT_BACKUP_IMAGE: &str = "govm/qemu:latest";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of `data/<name>` directories
    pub workdir: PathBuf,
    /// Image running QEMU for each instance
    pub launcher_image: String,
    /// Image providing `qemu-img` for save
    pub backup_image: String,
    pub ssh_port: u16,
    pub ssh_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workdir: host::expand_home("~/vms"),
            launcher_image: DEFAULT_LAUNCHER_IMAGE.to_string(),
            backup_image: DEFAULT_BACKUP_IMAGE.to_string(),
            ssh_port: 22,
            ssh_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `GOVM_*` variables. Unparsable numbers are
    /// logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(workdir) = env_var("GOVM_WORKDIR") {
            config.workdir = host::expand_home(&workdir);
        }
        if let Some(image) = env_var("GOVM_LAUNCHER_IMAGE") {
            config.launcher_image = image;
        }
        if let Some(image) = env_var("GOVM_BACKUP_IMAGE") {
            config.backup_image = image;
        }
        if let Some(port) = env_var("GOVM_SSH_PORT") {
            match port.parse() {
                Ok(port) => config.ssh_port = port,
                Err(e) => warn!(%port, error = %e, "Ignoring invalid GOVM_SSH_PORT"),
            }
        }
        if let Some(secs) = env_var("GOVM_SSH_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => config.ssh_timeout = Duration::from_secs(secs),
                Err(e) => warn!(%secs, error = %e, "Ignoring invalid GOVM_SSH_TIMEOUT_SECS"),
            }
        }

        config
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
