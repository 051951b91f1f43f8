//! Instance templates, shared by `create` flags and `compose` files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use govm_common::{size_from_flavor, Instance, NetworkingOptions, Size};
use govm_engine::host;
use serde::Deserialize;

use crate::input;

/// Explicit hardware values. Zero fields take the CLI defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SizeTemplate {
    pub cpu_model: Option<String>,
    pub sockets: u32,
    pub cpus: u32,
    pub cores: u32,
    pub threads: u32,
    pub ram: u32,
    pub disk: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmTemplate {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub image: String,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub size: SizeTemplate,
    /// Path to an OpenSSH public key
    #[serde(default)]
    pub sshkey: Option<String>,
    /// File path or inline payload
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub cloud: bool,
    #[serde(default)]
    pub efi: bool,
    #[serde(default)]
    pub network: NetworkingOptions,
    #[serde(default)]
    pub shares: Vec<String>,
    #[serde(default)]
    pub emulator_env: Vec<String>,
}

impl VmTemplate {
    /// A chosen flavor replaces the explicit size as a whole.
    pub fn size(&self) -> Result<Size> {
        let cpu_model = self
            .size
            .cpu_model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| host::host_cpu_model().to_string());

        match self.flavor.as_deref().filter(|f| !f.is_empty()) {
            Some(flavor) => Ok(size_from_flavor(flavor, &cpu_model)?),
            None => Ok(Size::new(
                &cpu_model,
                self.size.sockets,
                self.size.cpus,
                self.size.cores,
                self.size.threads,
                self.size.ram,
                self.size.disk,
            )),
        }
    }

    /// Resolves files relative to `base` and builds the engine's instance.
    pub fn into_instance(self, namespace: &str, workdir: &Path, base: &Path) -> Result<Instance> {
        let size = self
            .size()
            .with_context(|| format!("sizing instance {}", self.name))?;
        let image = input::regular_file(&self.image, base)
            .with_context(|| format!("parent image of {}", self.name))?;

        let namespace = self
            .namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| namespace.to_string());

        let mut instance = Instance::new(self.name, namespace, image, workdir);
        instance.size = size;
        instance.cloud = self.cloud;
        instance.efi = self.efi;
        instance.shares = self.shares;
        instance.env_vars = self.emulator_env;
        instance.network = self.network;
        instance.user_data = self
            .user_data
            .map(|value| input::user_data(&value, base))
            .transpose()?;
        instance.ssh_public_key = self
            .sshkey
            .map(|path| input::public_key(&path, base))
            .transpose()?;
        Ok(instance)
    }
}

/// A `compose` file: a list of instances with an optional default namespace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeTemplate {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub vms: Vec<VmTemplate>,
}

impl ComposeTemplate {
    pub fn parse(yaml: &str) -> Result<Self> {
        let template: Self = serde_yaml::from_str(yaml).context("invalid compose template")?;
        if template.vms.is_empty() {
            bail!("compose template declares no vms");
        }
        Ok(template)
    }

    /// Loads a template and returns it with the directory its relative paths
    /// resolve against.
    pub fn load(path: &Path) -> Result<(Self, PathBuf)> {
        let cwd = std::env::current_dir()?;
        let path = input::regular_file(&path.to_string_lossy(), &cwd)?;
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or(cwd);
        Ok((Self::parse(&yaml)?, base))
    }

    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(fallback)
    }
}
