//! In-memory container runtime recording every call.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use govm_engine::runtime::NetworkEndpoint;
use govm_engine::{
    ContainerRecord, ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutcome, LabelFilter,
    RuntimeError, RuntimeResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { name: String, spec: ContainerSpec },
    Start(String),
    Stop(String),
    Remove(String),
    Inspect(String),
    List(Vec<LabelFilter>),
    Exec { id: String, argv: Vec<String> },
    ImageExists(String),
    PullImage(String),
}

#[derive(Debug, Default)]
pub struct MockState {
    pub containers: Vec<ContainerRecord>,
    pub images: HashSet<String>,
    pub calls: Vec<Call>,
    /// Exec fails (exit code 1) when the joined argv contains any of these
    pub failing_commands: Vec<String>,
    /// Container names whose create fails
    pub failing_creates: HashSet<String>,
    pub failing_removals: HashSet<String>,
    pub failing_starts: HashSet<String>,
    pub failing_stops: HashSet<String>,
    /// Every inspect fails with a transport error
    pub transport_down: bool,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime that already has the given images.
    pub fn with_images(images: &[&str]) -> Self {
        let runtime = Self::new();
        runtime.update(|s| s.images.extend(images.iter().map(|i| i.to_string())));
        runtime
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.update(|s| s.calls.clone())
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.update(|s| s.calls.iter().filter(|c| pred(c)).count())
    }

    pub fn creates(&self) -> Vec<(String, ContainerSpec)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create { name, spec } => Some((name, spec)),
                _ => None,
            })
            .collect()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Exec { id, argv } => Some((id, argv)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.update(|s| s.calls.clear());
    }

    /// Seeds a container directly, bypassing `create`.
    pub fn add_container(&self, name: &str, labels: &[(&str, &str)], ip: Option<&str>) -> String {
        self.update(|s| {
            let id = s.allocate_id();
            let mut networks = BTreeMap::new();
            networks.insert(
                "bridge".to_string(),
                NetworkEndpoint {
                    ip: ip.map(str::to_string),
                    mac: None,
                },
            );
            s.containers.push(ContainerRecord {
                id: id.clone(),
                name: name.to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                networks,
                status: ContainerStatus::Running,
            });
            id
        })
    }

    pub fn find(&self, reference: &str) -> Option<ContainerRecord> {
        self.update(|s| s.find(reference).cloned())
    }
}

impl MockState {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:012x}{:052}", 0xc0ffee_u64 + self.next_id, 0)
    }

    fn find(&self, reference: &str) -> Option<&ContainerRecord> {
        let name = reference.trim_start_matches('/');
        self.containers
            .iter()
            .find(|c| c.id == reference || c.name == name)
    }

    fn find_mut(&mut self, id: &str) -> RuntimeResult<&mut ContainerRecord> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.update(|s| {
            s.calls.push(Call::Create {
                name: name.to_string(),
                spec: spec.clone(),
            });
            if s.failing_creates.contains(name) {
                return Err(RuntimeError::Transport(format!("cannot create {name}")));
            }
            if s.find(name).is_some() {
                return Err(RuntimeError::Transport(format!("Conflict: {name} in use")));
            }

            let id = s.allocate_id();
            let mut networks = BTreeMap::new();
            if let Some(endpoint) = &spec.endpoint {
                networks.insert(
                    endpoint.net_id.clone(),
                    NetworkEndpoint {
                        ip: endpoint.ip.clone(),
                        mac: endpoint.mac.clone(),
                    },
                );
            }
            s.containers.push(ContainerRecord {
                id: id.clone(),
                name: name.to_string(),
                labels: spec.labels.clone().into_iter().collect::<HashMap<_, _>>(),
                networks,
                status: ContainerStatus::Created,
            });
            Ok(id)
        })
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.update(|s| {
            s.calls.push(Call::Start(id.to_string()));
            if s.failing_starts.contains(id) {
                return Err(RuntimeError::Transport(format!("cannot start {id}")));
            }
            s.find_mut(id)?.status = ContainerStatus::Running;
            Ok(())
        })
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        self.update(|s| {
            s.calls.push(Call::Stop(id.to_string()));
            if s.failing_stops.contains(id) {
                return Err(RuntimeError::Transport(format!("cannot stop {id}")));
            }
            s.find_mut(id)?.status = ContainerStatus::Exited;
            Ok(())
        })
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.update(|s| {
            s.calls.push(Call::Remove(id.to_string()));
            if s.failing_removals.contains(id) {
                return Err(RuntimeError::Transport(format!("cannot remove {id}")));
            }
            let before = s.containers.len();
            s.containers.retain(|c| c.id != id);
            if s.containers.len() == before {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    async fn inspect(&self, reference: &str) -> RuntimeResult<ContainerRecord> {
        self.update(|s| {
            s.calls.push(Call::Inspect(reference.to_string()));
            if s.transport_down {
                return Err(RuntimeError::Transport("connection refused".to_string()));
            }
            s.find(reference)
                .cloned()
                .ok_or_else(|| RuntimeError::NotFound(reference.to_string()))
        })
    }

    async fn list(&self, filters: &[LabelFilter]) -> RuntimeResult<Vec<ContainerRecord>> {
        self.update(|s| {
            s.calls.push(Call::List(filters.to_vec()));
            Ok(s.containers
                .iter()
                .filter(|c| {
                    filters
                        .iter()
                        .all(|f| c.labels.get(&f.key) == Some(&f.value))
                })
                .cloned()
                .collect())
        })
    }

    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<ExecOutcome> {
        self.update(|s| {
            s.calls.push(Call::Exec {
                id: id.to_string(),
                argv: argv.to_vec(),
            });
            let line = argv.join(" ");
            if s.failing_commands.iter().any(|pattern| line.contains(pattern)) {
                return Ok(ExecOutcome {
                    exit_code: Some(1),
                    output: format!("{} failed", argv[0]),
                });
            }
            Ok(ExecOutcome {
                exit_code: Some(0),
                output: String::new(),
            })
        })
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        self.update(|s| {
            s.calls.push(Call::ImageExists(image.to_string()));
            Ok(s.images.contains(image))
        })
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        self.update(|s| {
            s.calls.push(Call::PullImage(image.to_string()));
            s.images.insert(image.to_string());
            Ok(())
        })
    }
}
