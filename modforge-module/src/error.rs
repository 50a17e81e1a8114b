use thiserror::Error;

/// Cloneable: deploy/undeploy results travel through an `ActionFuture`
/// that a caller may poll more than once, so the error type has to be
/// too. The underlying I/O and JSON error sources are flattened to
/// their rendered message rather than carried structurally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid manifest at {path}: {source}")]
    InvalidManifest {
        path: std::path::PathBuf,
        source: String,
    },

    #[error("module '{0}' has no manifest (mod.json not found)")]
    MissingManifest(String),

    #[error("module '{0}' has no 'main' entry and is not deployable")]
    NotRunnable(String),

    #[error("resolution failed for module '{root}': {warnings:?}")]
    ResolutionFailed { root: String, warnings: Vec<String> },

    #[error("deployment '{0}' already exists")]
    DuplicateDeployment(String),

    #[error("parent deployment '{0}' not found")]
    MissingParent(String),

    #[error("deployment '{0}' not found")]
    UnknownDeployment(String),

    #[error("operation must run on a worker thread, not '{0}'")]
    NotOnWorkerThread(String),

    #[error("verticle instance failed to start: {0}")]
    StartFailed(String),
}

impl From<std::io::Error> for ModuleError {
    fn from(e: std::io::Error) -> Self {
        ModuleError::Io(e.to_string())
    }
}

pub type ModuleResult<T> = std::result::Result<T, ModuleError>;
