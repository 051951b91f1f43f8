use std::collections::BTreeMap;
use std::path::Path;

use govm_common::{GovmError, Instance, Result, Size};
use tracing::debug;

use crate::datadir::{META_DATA_FILE, USER_DATA_FILE};

pub const GUEST_IMAGE_PATH: &str = "/image/image";
pub const GUEST_DATA_PATH: &str = "/data";
pub const GUEST_OUTPUT_PATH: &str = "/data-out";
pub const GUEST_META_DATA_PATH: &str = "/cloud-init/openstack/latest/meta_data.json";
pub const GUEST_USER_DATA_PATH: &str = "/cloud-init/openstack/latest/user_data";

const CLOUD_INIT_DRIVE: &str = "-drive file=/data/seed.iso,if=virtio,format=raw";
const EFI_FIRMWARE: &str = "/OVMF.fd";
const VNC_SOCKET: &str = "unix:/data/vnc";

/// Label keys shared by the engine and the console bridge.
pub mod labels {
    pub const NAMESPACE: &str = "namespace";
    pub const TYPE: &str = "govmType";
    pub const VM_NAME: &str = "vmName";
    pub const CONSOLE_PORT: &str = "websockifyPort";
    pub const DATA_DIR: &str = "dataDir";
    pub const IP: &str = "ip";

    pub const TYPE_INSTANCE: &str = "instance";
    pub const TYPE_BACKUP: &str = "backup";
}

/// Launcher environment. Keys are checked on insertion, so serialization
/// never produces a malformed `KEY=VALUE` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars(BTreeMap<String, String>);

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        if key.is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
            return Err(GovmError::Config(format!(
                "invalid environment variable name {key:?}"
            )));
        }
        self.0.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Merges a raw `KEY=VALUE` entry; later entries win.
    pub fn merge_entry(&mut self, entry: &str) -> Result<()> {
        match entry.split_once('=') {
            Some((key, value)) => self.set(key, value),
            None => Err(GovmError::Config(format!(
                "environment variable {entry:?} must be KEY=VALUE"
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_docker(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub net_id: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub hostname: String,
    pub cmd: Vec<String>,
    pub env: EnvVars,
    pub binds: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub endpoint: Option<EndpointSpec>,
    pub dns: Vec<String>,
    pub privileged: bool,
    pub publish_all_ports: bool,
    pub restart_always: bool,
}

impl ContainerSpec {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// `-cpu <model> -smp ... -m <ram>` as handed to the launcher.
pub fn cpu_options(size: &Size) -> String {
    format!(
        "-cpu {} -smp sockets={},cpus={},cores={},threads={},maxcpus={} -m {}",
        size.cpu_model,
        size.sockets,
        size.cpus,
        size.cores,
        size.threads,
        size.max_cpus(),
        size.ram
    )
}

fn bind(host: impl AsRef<Path>, guest: &str) -> String {
    format!("{}:{guest}", host.as_ref().display())
}

/// Builds the launcher container for `instance`. Pure: no runtime or host calls.
pub fn build(
    instance: &Instance,
    data_dir: &Path,
    console_port: u16,
    launcher_image: &str,
) -> Result<ContainerSpec> {
    let shares = instance.parsed_shares()?;

    let mut env = EnvVars::new();
    env.set("AUTO_ATTACH", "yes")?;
    env.set("DEBUG", "yes")?;
    env.set("KVM_CPU_OPTS", cpu_options(&instance.size))?;
    env.set("COW_SIZE", instance.size.disk.to_string())?;
    if instance.cloud {
        env.set("CLOUD", "yes")?;
        env.set("CLOUD_INIT_OPTS", CLOUD_INIT_DRIVE)?;
    }
    if !shares.is_empty() {
        let guest_dirs: Vec<&str> = shares.iter().map(|s| s.guest.as_str()).collect();
        env.set("SHARED_DIRS", guest_dirs.join(" "))?;
    }
    for entry in &instance.env_vars {
        env.merge_entry(entry)?;
    }

    let mut binds = vec![
        bind(&instance.parent_image, GUEST_IMAGE_PATH),
        bind(data_dir, GUEST_DATA_PATH),
        bind(data_dir.join(META_DATA_FILE), GUEST_META_DATA_PATH),
    ];
    binds.extend(shares.iter().map(ToString::to_string));
    if instance.user_data.is_some() {
        binds.push(bind(data_dir.join(USER_DATA_FILE), GUEST_USER_DATA_PATH));
    }

    let mut tags = BTreeMap::new();
    tags.insert(labels::CONSOLE_PORT.to_string(), console_port.to_string());
    tags.insert(labels::DATA_DIR.to_string(), data_dir.display().to_string());
    tags.insert(labels::NAMESPACE.to_string(), instance.namespace.clone());
    tags.insert(labels::TYPE.to_string(), labels::TYPE_INSTANCE.to_string());
    tags.insert(labels::VM_NAME.to_string(), instance.name.clone());
    if let Some(ip) = &instance.network.ip {
        tags.insert(labels::IP.to_string(), ip.clone());
    }

    let mut cmd = vec!["-vnc".to_string(), VNC_SOCKET.to_string()];
    if instance.efi {
        cmd.push("-bios".to_string());
        cmd.push(EFI_FIRMWARE.to_string());
    }

    debug!(name = %instance.name, env = env.len(), binds = binds.len(), "Built launcher spec");

    Ok(ContainerSpec {
        image: launcher_image.to_string(),
        hostname: instance.name.clone(),
        cmd,
        env,
        binds,
        labels: tags,
        endpoint: Some(EndpointSpec {
            net_id: instance.network.net_id.clone(),
            ip: instance.network.ip.clone(),
            mac: instance.network.mac.clone(),
        }),
        dns: instance.network.dns.clone(),
        privileged: true,
        publish_all_ports: true,
        restart_always: true,
    })
}

/// Idle helper container that sees the instance data as `/data` and the
/// output directory as `/data-out`.
pub fn backup_sidecar(
    image: &str,
    namespace: &str,
    data_dir: &Path,
    output_dir: &Path,
) -> ContainerSpec {
    let mut tags = BTreeMap::new();
    tags.insert(labels::NAMESPACE.to_string(), namespace.to_string());
    tags.insert(labels::TYPE.to_string(), labels::TYPE_BACKUP.to_string());

    ContainerSpec {
        image: image.to_string(),
        hostname: "govm-backup".to_string(),
        cmd: vec![
            "sh".to_string(),
            "-c".to_string(),
            "while true; do sleep 30; done".to_string(),
        ],
        binds: vec![
            bind(data_dir, GUEST_DATA_PATH),
            bind(output_dir, GUEST_OUTPUT_PATH),
        ],
        labels: tags,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use govm_common::NetworkingOptions;
    use std::path::PathBuf;

    fn instance() -> Instance {
        let mut ins = Instance::new("web", "alice", "/images/focal.qcow2", "/home/alice/vms");
        ins.network.normalize();
        ins
    }

    fn build_default(ins: &Instance) -> Result<ContainerSpec> {
        build(ins, &ins.data_dir(), 6080, "govm/govm:latest")
    }

    #[test]
    fn test_cpu_options() {
        let size = Size::new("host", 1, 2, 2, 1, 4096, 10);
        let opts = cpu_options(&size);
        assert_eq!(
            opts,
            "-cpu host -smp sockets=1,cpus=2,cores=2,threads=1,maxcpus=2 -m 4096"
        );
        assert!(opts.contains("cpus=2"));
        assert!(opts.contains("-m 4096"));
    }

    #[test]
    fn test_base_spec() {
        let ins = instance();
        let spec = build_default(&ins).unwrap();

        assert_eq!(spec.image, "govm/govm:latest");
        assert_eq!(spec.hostname, "web");
        assert_eq!(spec.cmd, vec!["-vnc", "unix:/data/vnc"]);
        assert_eq!(spec.env.get("AUTO_ATTACH"), Some("yes"));
        assert_eq!(spec.env.get("DEBUG"), Some("yes"));
        assert_eq!(spec.env.get("COW_SIZE"), Some("10"));
        assert_eq!(spec.env.get("CLOUD"), None);
        assert_eq!(spec.env.get("SHARED_DIRS"), None);

        assert_eq!(
            spec.binds,
            vec![
                "/images/focal.qcow2:/image/image",
                "/home/alice/vms/data/web:/data",
                "/home/alice/vms/data/web/meta_data.json:/cloud-init/openstack/latest/meta_data.json",
            ]
        );

        assert_eq!(spec.label(labels::CONSOLE_PORT), Some("6080"));
        assert_eq!(spec.label(labels::DATA_DIR), Some("/home/alice/vms/data/web"));
        assert_eq!(spec.label(labels::NAMESPACE), Some("alice"));
        assert_eq!(spec.label(labels::TYPE), Some("instance"));
        assert_eq!(spec.label(labels::VM_NAME), Some("web"));
        assert_eq!(spec.label(labels::IP), None);

        assert!(spec.privileged && spec.publish_all_ports && spec.restart_always);
        assert_eq!(spec.endpoint.as_ref().map(|e| e.net_id.as_str()), Some("bridge"));
    }

    #[test]
    fn test_cloud_efi_and_user_data() {
        let mut ins = instance();
        ins.cloud = true;
        ins.efi = true;
        ins.user_data = Some("#cloud-config\n".to_string());
        let spec = build_default(&ins).unwrap();

        assert_eq!(spec.env.get("CLOUD"), Some("yes"));
        assert_eq!(
            spec.env.get("CLOUD_INIT_OPTS"),
            Some("-drive file=/data/seed.iso,if=virtio,format=raw")
        );
        assert_eq!(spec.cmd, vec!["-vnc", "unix:/data/vnc", "-bios", "/OVMF.fd"]);
        assert_eq!(
            spec.binds.last().map(String::as_str),
            Some("/home/alice/vms/data/web/user_data:/cloud-init/openstack/latest/user_data")
        );
    }

    #[test]
    fn test_share_adds_one_bind() {
        let mut ins = instance();
        ins.shares = vec!["/host/a:/guest/a".to_string()];
        let spec = build_default(&ins).unwrap();

        let matching: Vec<_> = spec
            .binds
            .iter()
            .filter(|b| b.as_str() == "/host/a:/guest/a")
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(spec.env.get("SHARED_DIRS"), Some("/guest/a"));
    }

    #[test]
    fn test_bad_share_is_config_error() {
        let mut ins = instance();
        ins.shares = vec!["/host/a".to_string()];
        assert!(matches!(build_default(&ins), Err(GovmError::Config(_))));
    }

    #[test]
    fn test_extra_env_merged_last() {
        let mut ins = instance();
        ins.env_vars = vec!["DEBUG=no".to_string(), "PROXY=http://p:3128".to_string()];
        let spec = build_default(&ins).unwrap();
        assert_eq!(spec.env.get("DEBUG"), Some("no"));
        assert_eq!(spec.env.get("PROXY"), Some("http://p:3128"));
        assert!(spec.env.to_docker().contains(&"PROXY=http://p:3128".to_string()));

        ins.env_vars = vec!["BROKEN".to_string()];
        assert!(matches!(build_default(&ins), Err(GovmError::Config(_))));
    }

    #[test]
    fn test_explicit_ip_label_and_endpoint() {
        let mut ins = instance();
        ins.network = NetworkingOptions {
            net_id: "lab".to_string(),
            ip: Some("10.1.0.4".to_string()),
            mac: Some("02:42:0a:01:00:04".to_string()),
            dns: vec!["1.1.1.1".to_string()],
        };
        let spec = build_default(&ins).unwrap();

        assert_eq!(spec.label(labels::IP), Some("10.1.0.4"));
        assert_eq!(
            spec.endpoint,
            Some(EndpointSpec {
                net_id: "lab".to_string(),
                ip: Some("10.1.0.4".to_string()),
                mac: Some("02:42:0a:01:00:04".to_string()),
            })
        );
        assert_eq!(spec.dns, vec!["1.1.1.1"]);
    }

    #[test]
    fn test_backup_sidecar() {
        let spec = backup_sidecar(
            "govm/qemu:latest",
            "alice",
            &PathBuf::from("/vms/data/web"),
            &PathBuf::from("/tmp/out"),
        );
        assert_eq!(spec.binds, vec!["/vms/data/web:/data", "/tmp/out:/data-out"]);
        assert_eq!(spec.label(labels::TYPE), Some("backup"));
        assert_eq!(spec.label(labels::NAMESPACE), Some("alice"));
        assert!(!spec.restart_always);
    }
}
