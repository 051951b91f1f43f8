use std::path::PathBuf;

use govm_common::{GovmError, Result};
use tracing::{debug, info};

const CPUINFO: &str = "/proc/cpuinfo";

/// SIGKILLs `pid`. Returns `false` when the process had already exited.
pub fn kill_process(pid: i32) -> Result<bool> {
    // 0 and negative pids address process groups
    if pid <= 0 {
        return Err(GovmError::Internal(format!("refusing to signal pid {pid}")));
    }

    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        info!(pid, "Killed console bridge");
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "Process already gone");
        Ok(false)
    } else {
        Err(GovmError::Io(err))
    }
}

/// `host` when the CPU advertises hardware virtualization, else a portable model.
pub fn host_cpu_model() -> &'static str {
    match std::fs::read_to_string(CPUINFO) {
        Ok(cpuinfo) => cpu_model_from(&cpuinfo),
        Err(e) => {
            debug!(error = %e, "Could not read {CPUINFO}");
            "haswell"
        }
    }
}

fn cpu_model_from(cpuinfo: &str) -> &'static str {
    let virtualizable = cpuinfo
        .lines()
        .filter(|line| line.starts_with("flags"))
        .any(|line| line.split_whitespace().any(|f| f == "vmx" || f == "svm"));
    if virtualizable {
        "host"
    } else {
        "haswell"
    }
}

/// Current user name, used when no namespace is given.
pub fn default_namespace() -> String {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Expands a leading `~` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}
