//! Error types for the run engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("A run is already active.")]
    AlreadyRunning { run_id: Option<String> },

    #[error("Browser environment error: {0}")]
    Environment(String),

    #[error("Cannot delete {kind} {id} while a run for it is in progress")]
    RunInProgress { kind: String, id: String },

    #[error("Artifact error: {0}")]
    Artifact(#[from] crate::artifact::ArtifactError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(qaflow_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<qaflow_common::Error> for EngineError {
    fn from(e: qaflow_common::Error) -> Self {
        match e {
            qaflow_common::Error::Validation(msg) => EngineError::Validation(msg),
            qaflow_common::Error::NotFound { kind, id } => EngineError::NotFound { kind, id },
            other => EngineError::Storage(other),
        }
    }
}

impl From<crate::parser::ParseError> for EngineError {
    fn from(e: crate::parser::ParseError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl EngineError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        EngineError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
