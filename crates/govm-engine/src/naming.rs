//! Container naming: `govm.<namespace>.<name>` and back.

use thiserror::Error;

pub const CONTAINER_PREFIX: &str = "govm";

const BACKUP_SUFFIX: &str = "-backup";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QualifiedName {
    pub namespace: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Decoding failures. Both keep a best-effort guess for log messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("{resource:?} has an invalid container name")]
    InvalidFormat {
        resource: String,
        guess: QualifiedName,
    },
    #[error("{resource:?} has an invalid prefix (should be {prefix:?})", prefix = CONTAINER_PREFIX)]
    InvalidPrefix {
        resource: String,
        guess: QualifiedName,
    },
}

impl NameError {
    pub fn guess(&self) -> &QualifiedName {
        match self {
            NameError::InvalidFormat { guess, .. } | NameError::InvalidPrefix { guess, .. } => guess,
        }
    }
}

/// Namespace and name must not contain dots; `Instance::validate` enforces it.
pub fn encode(namespace: &str, name: &str) -> String {
    format!("{CONTAINER_PREFIX}.{namespace}.{name}")
}

pub fn decode(resource: &str) -> Result<QualifiedName, NameError> {
    // Docker reports names with a leading slash
    let trimmed = resource.trim_start_matches('/');
    let parts: Vec<&str> = trimmed.split('.').collect();

    if parts.len() != 3 {
        let mut segments = trimmed.splitn(3, '.');
        let guess = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(ns), Some(name)) => QualifiedName::new(ns, name),
            (Some(ns), Some(name), None) => QualifiedName::new(ns, name),
            (Some(name), None, None) => QualifiedName::new("", name),
            _ => QualifiedName::default(),
        };
        return Err(NameError::InvalidFormat {
            resource: resource.to_string(),
            guess,
        });
    }

    let guess = QualifiedName::new(parts[1], parts[2]);
    if parts[0] != CONTAINER_PREFIX {
        return Err(NameError::InvalidPrefix {
            resource: resource.to_string(),
            guess,
        });
    }
    Ok(guess)
}

/// Name of the transient sidecar used by `save`.
pub fn backup_name(resource: &str) -> String {
    format!("{}{BACKUP_SUFFIX}", resource.trim_start_matches('/'))
}
