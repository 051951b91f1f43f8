use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use govm_common::{GovmError, Instance, InstanceSummary, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::datadir::DataDir;
use crate::naming;
use crate::port;
use crate::runtime::{ContainerRecord, ContainerRuntime, ExecOutcome, LabelFilter};
use crate::spec::{self, labels};
use crate::{host, RuntimeError};

/// One step of `save`. Run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStep {
    /// Snapshot the parent image inside the instance container
    BaseImage,
    StopInstance,
    StartSidecar,
    ClearTemp,
    CopyBase,
    CopyHead,
    Rebase,
    Commit,
    Rename,
    RemoveHead,
    RestartInstance,
    RemoveSidecar,
}

impl SaveStep {
    pub fn as_str(self) -> &'static str {
        match self {
            SaveStep::BaseImage => "base-image",
            SaveStep::StopInstance => "stop-instance",
            SaveStep::StartSidecar => "start-sidecar",
            SaveStep::ClearTemp => "clear-temp",
            SaveStep::CopyBase => "copy-base",
            SaveStep::CopyHead => "copy-head",
            SaveStep::Rebase => "rebase",
            SaveStep::Commit => "commit",
            SaveStep::Rename => "rename",
            SaveStep::RemoveHead => "remove-head",
            SaveStep::RestartInstance => "restart-instance",
            SaveStep::RemoveSidecar => "remove-sidecar",
        }
    }
}

impl Display for SaveStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub step: SaveStep,
    pub error: Option<String>,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-step results of a save; the image may be usable even when some failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub output: PathBuf,
    pub outcomes: Vec<Outcome>,
}

impl SaveReport {
    fn new(output: PathBuf) -> Self {
        Self {
            output,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, step: SaveStep, result: std::result::Result<(), String>) {
        match &result {
            Ok(()) => debug!(%step, "Save step succeeded"),
            Err(e) => error!(%step, error = %e, "Save step failed"),
        }
        self.outcomes.push(Outcome {
            step,
            error: result.err(),
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn outcome(&self, step: SaveStep) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.step == step)
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn into_result(self) -> Result<PathBuf> {
        let failed = self.failures().count();
        if failed == 0 {
            Ok(self.output)
        } else {
            Err(GovmError::PartialFailure {
                failed,
                total: self.outcomes.len(),
            })
        }
    }
}

const SIDECAR_NOT_RUNNING: &str = "skipped: backup sidecar not running";

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Commands run in the sidecar, in order. `file` is the output file name.
fn save_commands(file: &str) -> Vec<(SaveStep, Vec<String>)> {
    vec![
        (SaveStep::ClearTemp, argv(&["sh", "-c", "rm -rf /tmp/*"])),
        (SaveStep::CopyBase, argv(&["cp", "/data/base_image", "/data-out/"])),
        (
            SaveStep::CopyHead,
            argv(&["cp", "/data/cow_image.qcow2", "/data-out/head.qcow2"]),
        ),
        (
            SaveStep::Rebase,
            argv(&[
                "qemu-img",
                "rebase",
                "-f",
                "qcow2",
                "-F",
                "qcow2",
                "-p",
                "-u",
                "-b",
                "/data-out/base_image",
                "/data-out/head.qcow2",
            ]),
        ),
        (
            SaveStep::Commit,
            argv(&["qemu-img", "commit", "-p", "/data-out/head.qcow2"]),
        ),
        (
            SaveStep::Rename,
            vec![
                "mv".to_string(),
                "/data-out/base_image".to_string(),
                format!("/data-out/{file}"),
            ],
        ),
        (SaveStep::RemoveHead, argv(&["rm", "/data-out/head.qcow2"])),
    ]
}

/// VM lifecycle on top of a container runtime.
#[derive(Clone)]
pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: EngineConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// `reference` as a runtime id first, then as an instance name in `namespace`.
    #[instrument(skip(self))]
    pub async fn resolve(&self, namespace: &str, reference: &str) -> Result<ContainerRecord> {
        match self.runtime.inspect(reference).await {
            Ok(record) => return Ok(record),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let name = naming::encode(namespace, reference);
        match self.runtime.inspect(&name).await {
            Ok(record) => Ok(record),
            Err(RuntimeError::NotFound(_)) => Err(GovmError::NotFound(format!(
                "{reference} in namespace {namespace}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if !self.runtime.image_exists(image).await? {
            info!(%image, "Image not present locally, pulling");
            self.runtime.pull_image(image).await?;
        }
        Ok(())
    }

    /// Creates the launcher container (not started) and fills in `id` and
    /// `console_port`.
    #[instrument(skip(self, instance), fields(namespace = %instance.namespace, name = %instance.name))]
    pub async fn create(&self, instance: &mut Instance) -> Result<String> {
        instance.validate()?;

        let data_dir = instance.data_dir();
        let console_port = port::allocate()?;
        let spec = spec::build(instance, &data_dir, console_port, &self.config.launcher_image)?;

        let name = naming::encode(&instance.namespace, &instance.name);
        match self.runtime.inspect(&name).await {
            Ok(existing) => {
                return Err(GovmError::AlreadyExists(format!(
                    "{} in namespace {} ({})",
                    instance.name,
                    instance.namespace,
                    existing.short_id()
                )))
            }
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let dir = DataDir::new(&data_dir);
        dir.prepare(instance).await?;

        let created = match self.ensure_image(&spec.image).await {
            Ok(()) => self.runtime.create(&name, &spec).await.map_err(GovmError::from),
            Err(e) => Err(e),
        };
        let container_id = match created {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = dir.remove().await {
                    warn!(path = %data_dir.display(), error = %cleanup, "Failed to remove data directory");
                }
                return Err(e);
            }
        };
        info!(%container_id, console_port, data_dir = %data_dir.display(), "Instance created");

        instance.id = Some(container_id.clone());
        instance.console_port = Some(console_port);
        Ok(container_id)
    }

    #[instrument(skip(self))]
    pub async fn start(&self, namespace: &str, id: &str) -> Result<()> {
        let record = self.resolve(namespace, id).await?;
        self.runtime.start(&record.id).await?;
        info!(container_id = %record.id, "Instance started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, namespace: &str, id: &str) -> Result<()> {
        let record = self.resolve(namespace, id).await?;
        self.runtime.stop(&record.id).await?;
        info!(container_id = %record.id, "Instance stopped");
        Ok(())
    }

    /// Kills the console bridge, removes the container and the data
    /// directory. Every step runs; the first error is returned.
    #[instrument(skip(self))]
    pub async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        let record = self.resolve(namespace, id).await?;
        let data_dir = record.label(labels::DATA_DIR).map(DataDir::new);
        let mut first_error: Option<GovmError> = None;

        if let Some(dir) = &data_dir {
            match dir.console_pid().await {
                Ok(Some(pid)) => {
                    if let Err(e) = host::kill_process(pid) {
                        warn!(pid, error = %e, "Failed to kill console bridge");
                        first_error.get_or_insert(e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to read console bridge pid");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.runtime.remove(&record.id).await {
            error!(container_id = %record.id, error = %e, "Failed to remove container");
            first_error.get_or_insert(e.into());
        }

        match &data_dir {
            Some(dir) => {
                if let Err(e) = dir.remove().await {
                    error!(path = %dir.path().display(), error = %e, "Failed to remove data directory");
                    first_error.get_or_insert(e);
                }
            }
            None => warn!(container_id = %record.id, "No dataDir label, skipping data cleanup"),
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(container_id = %record.id, "Instance deleted");
                Ok(())
            }
        }
    }

    /// Instances in `namespace`. With `all`, only containers typed as
    /// instances (no sidecars).
    #[instrument(skip(self))]
    pub async fn list(&self, namespace: &str, all: bool) -> Result<Vec<InstanceSummary>> {
        let mut filters = vec![LabelFilter::new(labels::NAMESPACE, namespace)];
        if all {
            filters.push(LabelFilter::new(labels::TYPE, labels::TYPE_INSTANCE));
        }

        let records = self.runtime.list(&filters).await?;
        debug!(count = records.len(), "Listed containers");
        Ok(records.iter().map(|r| r.summary(namespace)).collect())
    }

    /// Flattens the instance disk into a standalone image at `output`.
    ///
    /// Steps after the sidecar starts are independent and all run; their
    /// failures land in the report. If the sidecar does not start, every
    /// command is recorded as skipped. Failing to stop the instance aborts,
    /// as does failing to create the sidecar. A failed restart or sidecar
    /// removal is returned once cleanup has run.
    #[instrument(skip(self))]
    pub async fn save(
        &self,
        namespace: &str,
        id: &str,
        output: &Path,
        stop_first: bool,
    ) -> Result<SaveReport> {
        let record = self.resolve(namespace, id).await?;
        let data_dir = record
            .label(labels::DATA_DIR)
            .map(PathBuf::from)
            .ok_or_else(|| {
                GovmError::Config(format!("container {} has no dataDir label", record.name))
            })?;
        let (output_dir, file_name) = split_output(output)?;
        let mut report = SaveReport::new(output_dir.join(&file_name));

        tokio::fs::create_dir_all(&output_dir).await?;

        let snapshot = self
            .runtime
            .exec(&record.id, &argv(&["cp", "/image/image", "/data/base_image"]))
            .await;
        report.record(SaveStep::BaseImage, exec_result(snapshot));

        if stop_first {
            if let Err(e) = self.runtime.stop(&record.id).await {
                report.record(SaveStep::StopInstance, Err(e.to_string()));
                return Err(e.into());
            }
            report.record(SaveStep::StopInstance, Ok(()));
        }

        let sidecar_spec = spec::backup_sidecar(
            &self.config.backup_image,
            namespace,
            &data_dir,
            &output_dir,
        );
        let sidecar_name = naming::backup_name(&record.name);

        let sidecar = match self.sidecar(&sidecar_name, &sidecar_spec).await {
            Ok(sidecar) => sidecar,
            Err(e) => {
                if stop_first {
                    self.restart_after_save(&record.id, &mut report).await;
                }
                return Err(e);
            }
        };

        let started = self.runtime.start(&sidecar).await.map_err(|e| e.to_string());
        let sidecar_ready = started.is_ok();
        report.record(SaveStep::StartSidecar, started);

        // Every command lands in the report, run or not.
        for (step, command) in save_commands(&file_name) {
            if sidecar_ready {
                let result = self.runtime.exec(&sidecar, &command).await;
                report.record(step, exec_result(result));
            } else {
                report.record(step, Err(SIDECAR_NOT_RUNNING.to_string()));
            }
        }

        let restart_error = if stop_first {
            self.restart_after_save(&record.id, &mut report).await
        } else {
            None
        };

        let removal = self.runtime.remove(&sidecar).await;
        report.record(
            SaveStep::RemoveSidecar,
            removal.as_ref().map(|_| ()).map_err(ToString::to_string),
        );

        if let Some(e) = restart_error {
            return Err(e);
        }
        removal?;

        info!(
            container_id = %record.id,
            output = %report.output.display(),
            failed = report.failures().count(),
            "Save finished"
        );
        Ok(report)
    }

    async fn sidecar(&self, name: &str, spec: &spec::ContainerSpec) -> Result<String> {
        match self.runtime.inspect(name).await {
            Ok(existing) => {
                debug!(container_id = %existing.id, "Reusing backup sidecar");
                return Ok(existing.id);
            }
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.ensure_image(&spec.image).await?;
        Ok(self.runtime.create(name, spec).await?)
    }

    async fn restart_after_save(&self, id: &str, report: &mut SaveReport) -> Option<GovmError> {
        match self.runtime.start(id).await {
            Ok(()) => {
                report.record(SaveStep::RestartInstance, Ok(()));
                None
            }
            Err(e) => {
                report.record(SaveStep::RestartInstance, Err(e.to_string()));
                Some(e.into())
            }
        }
    }
}

fn exec_result(
    result: std::result::Result<ExecOutcome, RuntimeError>,
) -> std::result::Result<(), String> {
    match result {
        Ok(outcome) if outcome.success() => Ok(()),
        Ok(outcome) => Err(format!(
            "exit code {}: {}",
            outcome.exit_code.unwrap_or_default(),
            outcome.output.trim()
        )),
        Err(e) => Err(e.to_string()),
    }
}

/// Absolute output directory and file name.
fn split_output(output: &Path) -> Result<(PathBuf, String)> {
    let file_name = output
        .file_name()
        .and_then(|f| f.to_str())
        .filter(|f| !f.is_empty())
        .ok_or_else(|| {
            GovmError::Config(format!("output {} has no file name", output.display()))
        })?
        .to_string();

    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = if parent.is_absolute() {
        parent
    } else {
        std::env::current_dir()?.join(parent)
    };
    Ok((dir, file_name))
}
