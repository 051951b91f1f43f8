use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, HostConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::runtime::{
    ContainerRecord, ContainerRuntime, ContainerStatus, ExecOutcome, LabelFilter, NetworkEndpoint,
};
use crate::spec::ContainerSpec;
use crate::{RuntimeError, RuntimeResult};

/// Docker Engine API implementation of [`ContainerRuntime`].
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connects through `DOCKER_HOST` or the local socket.
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub fn docker(&self) -> &Arc<Docker> {
        &self.docker
    }
}

fn classify(err: BollardError, what: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{what}: {message}")),
        other => RuntimeError::DockerApi(other),
    }
}

// 304 Not Modified: already in the requested state
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn endpoint(settings: &EndpointSettings) -> NetworkEndpoint {
    NetworkEndpoint {
        ip: settings.ip_address.clone().filter(|ip| !ip.is_empty()),
        mac: settings.mac_address.clone().filter(|mac| !mac.is_empty()),
    }
}

fn endpoints(networks: Option<&HashMap<String, EndpointSettings>>) -> BTreeMap<String, NetworkEndpoint> {
    networks
        .map(|nets| {
            nets.iter()
                .map(|(name, settings)| (name.clone(), endpoint(settings)))
                .collect()
        })
        .unwrap_or_default()
}

fn container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let networking_config = spec.endpoint.as_ref().map(|ep| {
        let settings = EndpointSettings {
            ipam_config: ep.ip.as_ref().map(|ip| EndpointIpamConfig {
                ipv4_address: Some(ip.clone()),
                ..Default::default()
            }),
            ip_address: ep.ip.clone(),
            mac_address: ep.mac.clone(),
            network_id: Some(ep.net_id.clone()),
            ..Default::default()
        };
        NetworkingConfig {
            endpoints_config: HashMap::from([(ep.net_id.clone(), settings)]),
        }
    });

    let restart_policy = spec.restart_always.then(|| RestartPolicy {
        name: Some(RestartPolicyNameEnum::ALWAYS),
        ..Default::default()
    });

    ContainerConfig {
        image: Some(spec.image.clone()),
        hostname: Some(spec.hostname.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        env: Some(spec.env.to_docker()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        host_config: Some(HostConfig {
            binds: Some(spec.binds.clone()),
            privileged: Some(spec.privileged),
            publish_all_ports: Some(spec.publish_all_ports),
            dns: (!spec.dns.is_empty()).then(|| spec.dns.clone()),
            restart_policy,
            ..Default::default()
        }),
        networking_config,
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    ..Default::default()
                }),
                container_config(spec),
            )
            .await
            .map_err(|e| classify(e, &spec.image))?;

        for warning in &response.warnings {
            warn!(container_name = %name, %warning, "Docker reported a warning on create");
        }
        info!(container_id = %response.id, container_name = %name, "Container created");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(container_id = %id, "Container already running");
                Ok(())
            }
            Err(e) => Err(classify(e, id)),
        }
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        match self
            .docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(container_id = %id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(classify(e, id)),
        }
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(e, id))
    }

    async fn inspect(&self, reference: &str) -> RuntimeResult<ContainerRecord> {
        let details = self
            .docker
            .inspect_container(reference, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, reference))?;

        let status = details
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| ContainerStatus::parse(&s.to_string()))
            .unwrap_or_default();

        Ok(ContainerRecord {
            id: details.id.unwrap_or_default(),
            name: details
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            labels: details
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
            networks: endpoints(
                details
                    .network_settings
                    .as_ref()
                    .and_then(|n| n.networks.as_ref()),
            ),
            status,
        })
    }

    async fn list(&self, filters: &[LabelFilter]) -> RuntimeResult<Vec<ContainerRecord>> {
        let mut query = HashMap::new();
        query.insert(
            "label".to_string(),
            filters.iter().map(ToString::to_string).collect::<Vec<_>>(),
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: query,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerRecord {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                labels: c.labels.unwrap_or_default(),
                networks: endpoints(
                    c.network_settings
                        .as_ref()
                        .and_then(|n| n.networks.as_ref()),
                ),
                status: c
                    .state
                    .as_deref()
                    .map(ContainerStatus::parse)
                    .unwrap_or_default(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<ExecOutcome> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(e, id))?;

        let mut output = String::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        debug!(container_id = %id, exit_code = ?inspect.exit_code, "Exec finished");
        Ok(ExecOutcome {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, image) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        info!(%image, "Pulling image");
        let mut progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(step) = progress.next().await {
            let step = step.map_err(|e| classify(e, image))?;
            if let Some(status) = step.status {
                debug!(%image, %status, "Pull progress");
            }
        }
        Ok(())
    }
}
