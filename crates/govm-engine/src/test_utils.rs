//! Gates for tests that need a live Docker daemon.
use std::process::Command;

/// True when `docker info` succeeds against the configured daemon.
pub fn has_docker() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Skips the calling test when no daemon is reachable.
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return;
        }
    };
}
