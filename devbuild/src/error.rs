use std::{io, path::PathBuf};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("repository transport failed: {0}")]
    Transport(#[from] git2::Error),

    #[error("container runtime call failed: {0}")]
    ControlPlane(#[from] bollard::errors::Error),

    #[error("container runtime reported an error during {operation}: {message}")]
    Daemon {
        operation: &'static str,
        message: String,
    },

    #[error("{command} exited with code {exit_code}: {output}")]
    ExecFailed {
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("could not decode build outcome from {line:?}: {source}")]
    MalformedOutcome {
        line: String,
        source: serde_json::Error,
    },

    #[error("devcontainer build failed (outcome {outcome:?}, exit code {exit_code})")]
    BuildFailed {
        outcome: Option<String>,
        exit_code: i64,
    },

    #[error("no devcontainer configuration or image found in {0:?}")]
    UnknownStrategy(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("could not determine operator identity: {0}")]
    Identity(String),

    #[error("invalid build record {path:?}: {source}")]
    Record {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config file {path:?}: {source}")]
    Config {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
