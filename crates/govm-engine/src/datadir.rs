//! Per-instance host directory: `<workdir>/data/<name>`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use govm_common::{GovmError, Instance, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const META_DATA_FILE: &str = "meta_data.json";
pub const USER_DATA_FILE: &str = "user_data";
/// Written by the console bridge, read on delete.
pub const CONSOLE_PID_FILE: &str = "websockifyPid";

const DATA_DIR_MODE: u32 = 0o740;

/// OpenStack config-drive `meta_data.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDriveMetaData {
    pub availability_zone: String,
    pub hostname: String,
    pub launch_index: String,
    pub name: String,
    pub meta: BTreeMap<String, String>,
    pub public_keys: BTreeMap<String, String>,
    pub uuid: String,
}

impl ConfigDriveMetaData {
    pub fn for_instance(instance: &Instance) -> Self {
        let mut public_keys = BTreeMap::new();
        if let Some(key) = &instance.ssh_public_key {
            public_keys.insert("mykey".to_string(), key.trim().to_string());
        }
        Self {
            availability_zone: "vm".to_string(),
            hostname: instance.name.clone(),
            launch_index: "0".to_string(),
            name: instance.name.clone(),
            meta: BTreeMap::new(),
            public_keys,
            uuid: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory and writes the config-drive files.
    pub async fn prepare(&self, instance: &Instance) -> Result<()> {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(DATA_DIR_MODE)
            .create(&self.path)
            .await?;

        let meta = ConfigDriveMetaData::for_instance(instance);
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| GovmError::Internal(format!("failed to encode metadata: {e}")))?;
        tokio::fs::write(self.path.join(META_DATA_FILE), json).await?;

        if let Some(user_data) = &instance.user_data {
            tokio::fs::write(self.path.join(USER_DATA_FILE), user_data).await?;
        }

        debug!(path = %self.path.display(), "Data directory prepared");
        Ok(())
    }

    /// Pid of the console bridge, if it left one behind.
    pub async fn console_pid(&self) -> Result<Option<i32>> {
        let path = self.path.join(CONSOLE_PID_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse::<i32>().map(Some).map_err(|e| {
            GovmError::Internal(format!("invalid pid in {}: {e}", path.display()))
        })
    }

    /// Recursive removal. A directory that is already gone is fine.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Data directory removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
