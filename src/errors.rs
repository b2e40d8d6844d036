//! Error types for jailwatch operations

use std::io;
use thiserror::Error;

/// Result type for jailwatch operations
pub type Result<T> = std::result::Result<T, JailwatchError>;

/// Why a start request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The request itself is invalid; nothing was spawned
    Validation,
    /// The OS refused to create the process
    Spawn,
}

/// Errors that can occur while launching or supervising an execution
#[derive(Error, Debug)]
pub enum JailwatchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid jail: {0}")]
    InvalidJail(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Process monitoring error: {0}")]
    ProcessMonitoring(String),

    #[error("Jail preparation failed: {0}")]
    JailPreparation(String),
}

impl JailwatchError {
    /// Classify the error for a rejected start request
    pub fn rejection_kind(&self) -> RejectionKind {
        match self {
            JailwatchError::InvalidRequest(_)
            | JailwatchError::InvalidJail(_)
            | JailwatchError::InvalidConfig(_)
            | JailwatchError::JailPreparation(_) => RejectionKind::Validation,
            _ => RejectionKind::Spawn,
        }
    }
}
