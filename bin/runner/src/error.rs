//! Runner error types.

use std::fmt;
use std::path::PathBuf;

/// Errors that end the runner before a snapshot is produced.
#[derive(Debug)]
pub enum RunnerError {
    /// Configuration could not be loaded.
    Configuration { details: String },
    /// The definition file could not be read or parsed.
    Definition { path: PathBuf, details: String },
    /// The run input is not a JSON object.
    InvalidInput { details: String },
    /// The store could not be opened or migrated.
    Store { details: String },
    /// The engine rejected the workflow or the run.
    Engine { details: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { details } => write!(f, "configuration error: {details}"),
            Self::Definition { path, details } => {
                write!(f, "cannot load definition {}: {details}", path.display())
            }
            Self::InvalidInput { details } => write!(f, "invalid run input: {details}"),
            Self::Store { details } => write!(f, "store error: {details}"),
            Self::Engine { details } => write!(f, "engine error: {details}"),
        }
    }
}

impl std::error::Error for RunnerError {}
