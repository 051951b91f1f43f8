use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{GovmError, Result};

/// Root disk unit, in GB. Flavors scale it.
pub const DISK_DEFAULT_GB: u32 = 10;

/// Hardware shape of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Size {
    pub cpu_model: String,
    pub sockets: u32,
    pub cpus: u32,
    pub cores: u32,
    pub threads: u32,
    /// RAM in MB
    pub ram: u32,
    /// Disk in GB
    pub disk: u32,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            cpu_model: "host".to_string(),
            sockets: 2,
            cpus: 2,
            cores: 2,
            threads: 2,
            ram: 4096,
            disk: DISK_DEFAULT_GB,
        }
    }
}

impl Size {
    /// Builds a size from explicit values; zero means "use the default" for that field.
    pub fn new(
        cpu_model: &str,
        sockets: u32,
        cpus: u32,
        cores: u32,
        threads: u32,
        ram: u32,
        disk: u32,
    ) -> Self {
        fn or(value: u32, default: u32) -> u32 {
            if value == 0 {
                default
            } else {
                value
            }
        }

        Self {
            cpu_model: if cpu_model.is_empty() {
                "host".to_string()
            } else {
                cpu_model.to_string()
            },
            sockets: or(sockets, 1),
            cpus: or(cpus, 1),
            cores: or(cores, 2),
            threads: or(threads, 2),
            ram: or(ram, 4096),
            disk: or(disk, DISK_DEFAULT_GB),
        }
    }

    /// Upper bound handed to `-smp maxcpus=`.
    pub fn max_cpus(&self) -> u32 {
        self.sockets * self.cores * self.threads
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpu_model.trim().is_empty() {
            return Err(GovmError::Config("cpu model must not be empty".to_string()));
        }
        let counts = [
            ("sockets", self.sockets),
            ("cpus", self.cpus),
            ("cores", self.cores),
            ("threads", self.threads),
            ("ram", self.ram),
            ("disk", self.disk),
        ];
        for (field, value) in counts {
            if value < 1 {
                return Err(GovmError::Config(format!("{field} must be at least 1")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Micro,
    Tiny,
    Small,
    Medium,
    Large,
    Default,
}

impl Flavor {
    pub const ALL: [Flavor; 6] = [
        Flavor::Micro,
        Flavor::Tiny,
        Flavor::Small,
        Flavor::Medium,
        Flavor::Large,
        Flavor::Default,
    ];

    /// (sockets, cpus, cores, threads, ram MB, disk multiplier)
    fn row(self) -> (u32, u32, u32, u32, u32, u32) {
        match self {
            Flavor::Micro => (1, 1, 1, 1, 512, 1),
            Flavor::Tiny => (1, 1, 1, 1, 1024, 2),
            Flavor::Small => (1, 1, 2, 1, 2048, 4),
            Flavor::Medium => (2, 2, 2, 2, 4096, 8),
            Flavor::Large => (1, 4, 4, 4, 8192, 16),
            Flavor::Default => (2, 2, 2, 2, 4096, 1),
        }
    }

    pub fn size(self, cpu_model: &str) -> Size {
        let (sockets, cpus, cores, threads, ram, disk) = self.row();
        Size::new(
            cpu_model,
            sockets,
            cpus,
            cores,
            threads,
            ram,
            disk * DISK_DEFAULT_GB,
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Flavor::Micro => "micro",
            Flavor::Tiny => "tiny",
            Flavor::Small => "small",
            Flavor::Medium => "medium",
            Flavor::Large => "large",
            Flavor::Default => "default",
        }
    }
}

impl FromStr for Flavor {
    type Err = GovmError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Flavor::ALL
            .into_iter()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| {
                GovmError::Config(format!(
                    "unknown flavor {s:?}, expected one of micro, tiny, small, medium, large, default"
                ))
            })
    }
}

impl Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expands a flavor name into a complete size. No partial merging.
pub fn size_from_flavor(name: &str, cpu_model: &str) -> Result<Size> {
    Ok(name.parse::<Flavor>()?.size(cpu_model))
}
