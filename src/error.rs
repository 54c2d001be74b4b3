use std::path::PathBuf;

use thiserror::Error;

/// Failure raised from inside a job body.
///
/// Captured by the phase executor and carried to the top level once the
/// run's timing report has been printed.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("'{label}' command failed with exit code {exit_code:?}: {command}\n{output}")]
    BadExitCode {
        label: String,
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("'{label}' could not start '{command}': {source}")]
    Spawn {
        label: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum RunemError {
    #[error("Config not found! Looked up from {0}")]
    ConfigNotFound(PathBuf),

    #[error("Invalid config {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("Unknown job function '{0}', it was never registered")]
    UnknownJobFunction(String),

    #[error("invalid {kind} '{value}', choose from one of {choices}")]
    InvalidFilter {
        kind: String,
        value: String,
        choices: String,
    },

    #[error("File discovery failed: {0}")]
    FileDiscovery(String),

    #[error("Job '{label}' failed in phase '{phase}': {source}")]
    JobFailed {
        phase: String,
        label: String,
        #[source]
        source: JobError,
    },

    #[error("Interrupted before phase '{0}'")]
    Interrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RunemError>;
