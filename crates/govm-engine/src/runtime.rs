use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use async_trait::async_trait;
use govm_common::InstanceSummary;

use crate::naming;
use crate::spec::{labels, ContainerSpec};
use crate::RuntimeResult;

/// `key=value` label constraint for `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: String,
    pub value: String,
}

impl LabelFilter {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

impl Display for LabelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    Unknown,
}

impl ContainerStatus {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkEndpoint {
    pub ip: Option<String>,
    pub mac: Option<String>,
}

/// What the engine knows about a container after inspect or list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerRecord {
    pub id: String,
    /// Without Docker's leading slash
    pub name: String,
    pub labels: HashMap<String, String>,
    pub networks: BTreeMap<String, NetworkEndpoint>,
    pub status: ContainerStatus,
}

impl ContainerRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// First network (by name) carrying an address.
    pub fn ip_address(&self) -> Option<&str> {
        self.networks.values().find_map(|n| n.ip.as_deref())
    }

    pub fn console_port(&self) -> Option<u16> {
        self.label(labels::CONSOLE_PORT)?.parse().ok()
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    pub fn summary(&self, namespace: &str) -> InstanceSummary {
        let name = match self.label(labels::VM_NAME) {
            Some(name) => name.to_string(),
            None => match naming::decode(&self.name) {
                Ok(qualified) => qualified.name,
                Err(e) => e.guess().name.clone(),
            },
        };
        InstanceSummary {
            id: self.short_id().to_string(),
            name,
            namespace: self
                .label(labels::NAMESPACE)
                .unwrap_or(namespace)
                .to_string(),
            ip: self.ip_address().map(str::to_string),
            console_port: self.console_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    /// `None` when the runtime could not report one
    pub exit_code: Option<i64>,
    pub output: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        !matches!(self.exit_code, Some(code) if code != 0)
    }
}

/// The container operations the engine depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates (does not start) a container and returns its id.
    async fn create(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String>;
    /// Starting a running container succeeds.
    async fn start(&self, id: &str) -> RuntimeResult<()>;
    /// Stopping a stopped container succeeds.
    async fn stop(&self, id: &str) -> RuntimeResult<()>;
    /// Force removal; volumes and links are kept.
    async fn remove(&self, id: &str) -> RuntimeResult<()>;
    /// Accepts an id or a name.
    async fn inspect(&self, reference: &str) -> RuntimeResult<ContainerRecord>;
    async fn list(&self, filters: &[LabelFilter]) -> RuntimeResult<Vec<ContainerRecord>>;
    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<ExecOutcome>;
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;
    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;
}
