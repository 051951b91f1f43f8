use bollard::errors::Error as BollardError; // Alias bollard error
use govm_common::GovmError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the CLI)
pub use bollard;
pub use govm_common as common;

pub mod config;
pub mod datadir;
pub mod docker;
pub mod engine;
pub mod host;
pub mod naming;
pub mod port;
pub mod runtime;
pub mod session;
pub mod spec;
pub mod terminal;
pub mod test_utils;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No such object: {0}")]
    NotFound(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError), // Catch-all for other bollard errors
    #[error("Runtime transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

// Not-found stays distinguishable; everything else is a transport failure.
impl From<RuntimeError> for GovmError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => GovmError::NotFound(what),
            other => GovmError::Transport(other.to_string()),
        }
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

pub use config::EngineConfig;
pub use docker::DockerRuntime;
pub use engine::{Engine, Outcome, SaveReport, SaveStep};
pub use runtime::{ContainerRecord, ContainerRuntime, ContainerStatus, ExecOutcome, LabelFilter};
pub use spec::ContainerSpec;
