// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod size;

pub use size::{size_from_flavor, Flavor, Size, DISK_DEFAULT_GB};

/// Network attached when an instance does not name one.
pub const DEFAULT_NETWORK: &str = "bridge";

/// First lines accepted as the start of a cloud-init user-data payload.
pub const USER_DATA_HEADERS: [&str; 4] = [
    "#cloud-config",
    "#!/bin/sh",
    "#!/bin/bash",
    "#!/usr/bin/env python",
];

#[derive(Error, Debug)]
pub enum GovmError {
    #[error("Instance Not Found: {0}")]
    NotFound(String),

    #[error("Instance Already Exists: {0}")]
    AlreadyExists(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Authentication Error: {0}")]
    Auth(String),

    #[error("Not a TTY: {0}")]
    NotATty(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Partial Failure: {failed} of {total} steps failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl GovmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GovmError::NotFound(_))
    }
}

// Define the primary Result type for govm operations
pub type Result<T> = std::result::Result<T, GovmError>;

/// A host directory exposed to the guest, written `host:guest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub host: String,
    pub guest: String,
}

impl FromStr for Share {
    type Err = GovmError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [host, guest] if !host.is_empty() && !guest.is_empty() => Ok(Share {
                host: host.to_string(),
                guest: guest.to_string(),
            }),
            _ => Err(GovmError::Config(format!(
                "wrong share format {s:?}, expected /host/path:/guest/path"
            ))),
        }
    }
}

impl Display for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.guest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkingOptions {
    #[serde(default)]
    pub net_id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

impl NetworkingOptions {
    /// Falls back to the default bridge network, which cannot carry a fixed IP.
    pub fn normalize(&mut self) {
        if self.net_id.is_empty() || self.net_id == DEFAULT_NETWORK {
            self.net_id = DEFAULT_NETWORK.to_string();
            self.ip = None;
        }
        if self.ip.as_deref() == Some("") {
            self.ip = None;
        }
        if self.mac.as_deref() == Some("") {
            self.mac = None;
        }
    }

    pub fn is_default_network(&self) -> bool {
        self.net_id.is_empty() || self.net_id == DEFAULT_NETWORK
    }
}

/// A VM instance specification, built per command and consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub namespace: String,
    pub parent_image: PathBuf,
    pub workdir: PathBuf,
    /// Cloud-init user-data payload (contents, not a path).
    pub user_data: Option<String>,
    /// OpenSSH public key injected through the config drive.
    pub ssh_public_key: Option<String>,
    pub size: Size,
    pub cloud: bool,
    pub efi: bool,
    pub shares: Vec<String>,
    pub env_vars: Vec<String>,
    pub network: NetworkingOptions,
    // Runtime-assigned
    pub id: Option<String>,
    pub console_port: Option<u16>,
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        parent_image: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            parent_image: parent_image.into(),
            workdir: workdir.into(),
            user_data: None,
            ssh_public_key: None,
            size: Size::default(),
            cloud: false,
            efi: false,
            shares: Vec::new(),
            env_vars: Vec::new(),
            network: NetworkingOptions::default(),
            id: None,
            console_port: None,
        }
    }

    /// Host directory holding this instance's metadata: `<workdir>/data/<name>`.
    pub fn data_dir(&self) -> PathBuf {
        data_dir_for(&self.workdir, &self.name)
    }

    pub fn parsed_shares(&self) -> Result<Vec<Share>> {
        self.shares.iter().map(|s| s.parse()).collect()
    }

    /// Checks every field the engine relies on and normalizes networking.
    pub fn validate(&mut self) -> Result<()> {
        check_identifier("name", &self.name)?;
        check_identifier("namespace", &self.namespace)?;

        if self.parent_image.as_os_str().is_empty() {
            return Err(GovmError::Config("missing parent image".to_string()));
        }

        self.size.validate()?;
        self.parsed_shares()?;

        if let Some(user_data) = &self.user_data {
            let header = user_data.lines().next().unwrap_or_default().trim_end();
            if !USER_DATA_HEADERS.contains(&header) {
                return Err(GovmError::Config(
                    "unable to determine the user data content".to_string(),
                ));
            }
        }

        if let Some(key) = &self.ssh_public_key {
            ssh_key::PublicKey::from_openssh(key.trim())
                .map_err(|e| GovmError::Config(format!("invalid ssh public key: {e}")))?;
        }

        for var in &self.env_vars {
            if !var.contains('=') || var.starts_with('=') {
                return Err(GovmError::Config(format!(
                    "environment variable {var:?} must be KEY=VALUE"
                )));
            }
        }

        self.network.normalize();
        Ok(())
    }
}

pub fn data_dir_for(workdir: &Path, name: &str) -> PathBuf {
    workdir.join("data").join(name)
}

fn check_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(GovmError::Config(format!("{field} must not be empty")));
    }
    // Dots separate the segments of the container name.
    if value.contains('.') || value.contains('/') {
        return Err(GovmError::Config(format!(
            "{field} {value:?} must not contain '.' or '/'"
        )));
    }
    Ok(())
}

/// One row of `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub ip: Option<String>,
    pub console_port: Option<u16>,
}

impl Display for InstanceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InstanceSummary(id: {}, name: {}, namespace: {}, ip: {:?}, console_port: {:?})",
            self.id, self.name, self.namespace, self.ip, self.console_port
        )
    }
}
