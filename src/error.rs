//! Error types for the sorter daemon

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SortError>;

#[derive(Error, Debug)]
pub enum SortError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Telemetry listener error: {0}")]
    Bind(#[from] BindError),

    #[error("Controller task is no longer running")]
    ControllerGone,

    #[error("Telemetry listener is not running")]
    NotListening,

    #[error(transparent)]
    Transmission(#[from] TransmissionError),

    #[error("Invalid telemetry pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure to bind the telemetry listening socket
#[derive(Error, Debug)]
#[error("Failed to bind telemetry listener on {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

/// Why a script could not be delivered to the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionFailure {
    ConnectFailed,
    WriteFailed,
    SourceUnavailable,
}

impl fmt::Display for TransmissionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransmissionFailure::ConnectFailed => "connect failed",
            TransmissionFailure::WriteFailed => "write failed",
            TransmissionFailure::SourceUnavailable => "script unavailable",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Sending '{script}' failed ({reason}): {detail}")]
pub struct TransmissionError {
    pub reason: TransmissionFailure,
    pub script: String,
    pub detail: String,
}

impl TransmissionError {
    pub fn new(reason: TransmissionFailure, script: &str, detail: impl fmt::Display) -> Self {
        Self {
            reason,
            script: script.to_string(),
            detail: detail.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("Invalid script identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Failed to read script {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Inventory file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Inventory file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
