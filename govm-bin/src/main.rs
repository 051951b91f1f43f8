//! govm CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use govm_common::{GovmError, NetworkingOptions};
use govm_engine::terminal::StdTerminal;
use govm_engine::{host, session, DockerRuntime, Engine, EngineConfig};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod input;
mod template;

use template::{ComposeTemplate, SizeTemplate, VmTemplate};

/// govm - QEMU virtual machines inside Docker containers
#[derive(Parser, Debug)]
#[command(name = "govm")]
#[command(about = "VMs as you go")]
#[command(version)]
struct Cli {
    /// Namespace the instances live in
    #[arg(long, global = true, env = "GOVM_NAMESPACE", default_value_t = host::default_namespace())]
    namespace: String,

    /// Alternate working directory (default: ~/vms)
    #[arg(long, global = true)]
    workdir: Option<String>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and start a VM
    Create(CreateArgs),

    /// List VMs in the namespace
    #[command(visible_alias = "ls")]
    List {
        /// Only launcher containers, no backup sidecars
        #[arg(long)]
        all: bool,
    },

    /// Start stopped VMs
    Start {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Stop running VMs
    Stop {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Remove VMs and their data
    #[command(visible_alias = "rm")]
    Remove {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<String>,

        /// Remove every VM in the namespace
        #[arg(long)]
        all: bool,
    },

    /// Flatten a VM disk into a standalone image
    Save {
        id: String,

        /// Output image path on the host
        #[arg(long)]
        out: PathBuf,

        /// Stop the VM while copying
        #[arg(long)]
        stop_vm: bool,
    },

    /// Open a shell on a VM
    #[command(visible_alias = "conn")]
    Ssh {
        id: String,

        /// Login user (default: current user)
        #[arg(long)]
        user: Option<String>,

        /// Private key path
        #[arg(long, default_value = "~/.ssh/id_rsa")]
        key: String,
    },

    /// Deploy VMs from a yaml template
    #[command(visible_alias = "co")]
    Compose {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// VM name
    #[arg(long)]
    name: String,

    /// Parent qcow2 image
    #[arg(long)]
    image: String,

    /// cloud-init user data, as a file path or inline
    #[arg(long)]
    user_data: Option<String>,

    /// SSH public key file
    #[arg(long)]
    key: Option<String>,

    /// micro, tiny, small, medium, large or default
    #[arg(long)]
    flavor: Option<String>,

    #[arg(long)]
    cpumodel: Option<String>,
    #[arg(long, default_value_t = 1)]
    sockets: u32,
    #[arg(long, default_value_t = 1)]
    cpus: u32,
    #[arg(long, default_value_t = 2)]
    cores: u32,
    #[arg(long, default_value_t = 2)]
    threads: u32,
    /// RAM in MB
    #[arg(long, default_value_t = 4096)]
    ram: u32,
    /// Disk in GB
    #[arg(long, default_value_t = govm_common::DISK_DEFAULT_GB)]
    disk: u32,

    /// Boot through UEFI firmware
    #[arg(long)]
    efi: bool,

    /// Attach a config drive for cloud images
    #[arg(long)]
    cloud: bool,

    /// host_path:guest_path, repeatable
    #[arg(long = "share")]
    shares: Vec<String>,

    /// KEY=VALUE passed to the emulator container, repeatable
    #[arg(long = "env")]
    env_vars: Vec<String>,

    #[arg(long)]
    net_id: Option<String>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    mac: Option<String>,
    #[arg(long)]
    dns: Vec<String>,

    /// Leave the VM created but stopped
    #[arg(long)]
    no_start: bool,
}

impl CreateArgs {
    fn template(&self) -> VmTemplate {
        VmTemplate {
            name: self.name.clone(),
            namespace: None,
            image: self.image.clone(),
            flavor: self.flavor.clone(),
            size: SizeTemplate {
                cpu_model: self.cpumodel.clone(),
                sockets: self.sockets,
                cpus: self.cpus,
                cores: self.cores,
                threads: self.threads,
                ram: self.ram,
                disk: self.disk,
            },
            sshkey: self.key.clone(),
            user_data: self.user_data.clone(),
            cloud: self.cloud,
            efi: self.efi,
            network: NetworkingOptions {
                net_id: self.net_id.clone().unwrap_or_default(),
                ip: self.ip.clone(),
                mac: self.mac.clone(),
                dns: self.dns.clone(),
            },
            shares: self.shares.clone(),
            emulator_env: self.env_vars.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.debug);

    debug!(namespace = %cli.namespace, "starting govm");

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn engine(workdir: Option<&str>) -> Result<Engine> {
    let mut config = EngineConfig::from_env();
    if let Some(workdir) = workdir {
        config = config.with_workdir(host::expand_home(workdir));
    }
    let runtime = DockerRuntime::connect().context("connecting to Docker")?;
    Ok(Engine::new(Arc::new(runtime), config))
}

/// Runs the command and returns the process exit code.
async fn run(cli: Cli) -> Result<i32> {
    let engine = engine(cli.workdir.as_deref())?;
    let namespace = cli.namespace.as_str();
    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Create(args) => {
            let instance = args
                .template()
                .into_instance(namespace, &engine.config().workdir, &cwd)?;
            launch(&engine, instance, !args.no_start).await?;
        }
        Commands::List { all } => {
            let instances = engine.list(namespace, all).await?;
            println!(
                "{:<14}{:<18}{:<28}{:<20}{}",
                "ID", "IP", "VNC URL", "NAME", "NAMESPACE"
            );
            for vm in instances {
                let console = vm
                    .console_port
                    .map(|p| format!("http://localhost:{p}"))
                    .unwrap_or_default();
                println!(
                    "{:<14}{:<18}{:<28}{:<20}{}",
                    &vm.id[..vm.id.len().min(12)],
                    vm.ip.as_deref().unwrap_or("-"),
                    console,
                    vm.name,
                    vm.namespace
                );
            }
        }
        Commands::Start { ids } => {
            batch(&ids, |id| engine.start(namespace, id), "started").await?;
        }
        Commands::Stop { ids } => {
            batch(&ids, |id| engine.stop(namespace, id), "stopped").await?;
        }
        Commands::Remove { ids, all } => {
            let ids = if all {
                engine
                    .list(namespace, true)
                    .await?
                    .into_iter()
                    .map(|vm| vm.id)
                    .collect()
            } else {
                ids
            };
            batch(&ids, |id| engine.delete(namespace, id), "removed").await?;
        }
        Commands::Save { id, out, stop_vm } => {
            let out = if out.is_absolute() { out } else { cwd.join(out) };
            let report = engine.save(namespace, &id, &out, stop_vm).await?;
            for outcome in &report.outcomes {
                match &outcome.error {
                    None => debug!(step = %outcome.step, "ok"),
                    Some(e) => eprintln!("{}: {e}", outcome.step),
                }
            }
            let image = report.into_result()?;
            println!("{}", image.display());
        }
        Commands::Ssh { id, user, key } => {
            let user = user.unwrap_or_else(host::default_namespace);
            let key = host::expand_home(&key);
            let status = session::connect(
                &engine,
                namespace,
                &id,
                &user,
                &key.to_string_lossy(),
                &StdTerminal,
            )
            .await?;
            return Ok(i32::try_from(status).unwrap_or(255));
        }
        Commands::Compose { file } => {
            let (template, base) = ComposeTemplate::load(&file)?;
            let default_ns = template.namespace_or(namespace).to_string();
            let total = template.vms.len();
            let mut failed = 0;

            for vm in template.vms {
                let name = vm.name.clone();
                let result = match vm.into_instance(&default_ns, &engine.config().workdir, &base) {
                    Ok(instance) => launch(&engine, instance, true).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    failed += 1;
                    error!(vm = %name, error = %e, "Compose item failed");
                    eprintln!("{name}: {e:#}");
                }
            }

            if failed > 0 {
                return Err(GovmError::PartialFailure { failed, total }.into());
            }
        }
    }

    Ok(0)
}

/// Creates an instance and optionally starts it.
async fn launch(engine: &Engine, mut instance: govm_common::Instance, start: bool) -> Result<()> {
    let id = engine
        .create(&mut instance)
        .await
        .with_context(|| format!("creating {}", instance.name))?;
    if start {
        engine
            .start(&instance.namespace, &id)
            .await
            .with_context(|| format!("starting {}", instance.name))?;
    }

    info!(name = %instance.name, namespace = %instance.namespace, "GoVM instance ready");
    println!(
        "{}\t{}\thttp://localhost:{}",
        &id[..id.len().min(12)],
        instance.name,
        instance.console_port.unwrap_or_default()
    );
    Ok(())
}

/// Applies `op` to every id, reporting failures without stopping.
async fn batch<'a, F, Fut>(ids: &'a [String], op: F, verb: &str) -> Result<()>
where
    F: Fn(&'a str) -> Fut,
    Fut: std::future::Future<Output = govm_common::Result<()>>,
{
    let mut failed = 0;
    for id in ids {
        match op(id.as_str()).await {
            Ok(()) => println!("{id} {verb}"),
            Err(e) => {
                failed += 1;
                eprintln!("{id}: {e}");
            }
        }
    }

    if failed > 0 {
        return Err(GovmError::PartialFailure {
            failed,
            total: ids.len(),
        }
        .into());
    }
    Ok(())
}
