//! Resolution of user-supplied paths and file contents.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use govm_engine::host;

/// Expands `~` and anchors relative paths at `base`.
pub fn absolute(path: &str, base: &Path) -> PathBuf {
    let expanded = host::expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Absolute path of an existing regular file.
pub fn regular_file(path: &str, base: &Path) -> Result<PathBuf> {
    let resolved = absolute(path, base);
    let meta = std::fs::metadata(&resolved)
        .with_context(|| format!("file {} does not exist", resolved.display()))?;
    if !meta.is_file() {
        bail!("{} is not a regular file", resolved.display());
    }
    Ok(resolved)
}

/// User data given either as a file path or inline. An existing file wins;
/// anything else is taken as the payload itself.
pub fn user_data(value: &str, base: &Path) -> Result<String> {
    match regular_file(value, base) {
        Ok(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading user data from {}", path.display())),
        Err(_) => Ok(value.to_string()),
    }
}

pub fn public_key(path: &str, base: &Path) -> Result<String> {
    let path = regular_file(path, base)?;
    let key = std::fs::read_to_string(&path)
        .with_context(|| format!("reading public key {}", path.display()))?;
    Ok(key.trim().to_string())
}
