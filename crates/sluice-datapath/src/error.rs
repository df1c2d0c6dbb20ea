//! Error types for the datapath

use sluice_core::{CoreError, ErrorKind};
use thiserror::Error;

/// Datapath errors
#[derive(Debug, Error)]
pub enum DatapathError {
    /// Ring, extension or header failure
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A rule failed validation during capture
    #[error("Invalid rule {index}: {reason}")]
    InvalidRule {
        /// Position of the rule in the request
        index: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Object is in the wrong lifecycle state for the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Object is already attached or registered
    #[error("Duplicate object: {0}")]
    DuplicateObject(String),

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller lacks the privilege for the request
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Interface or queue went away
    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    /// A ring was found in an inconsistent state
    #[error("Ring {0} is in an error state")]
    InvalidRing(&'static str),

    /// Resources exhausted
    #[error("Resources exhausted: {0}")]
    Exhausted(String),

    /// A wait expired before its condition held
    #[error("Operation timed out")]
    Timeout,

    /// A wait was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Interface driver rejected the request
    #[error("Interface driver error: {0}")]
    Interface(String),
}

impl DatapathError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatapathError::Core(e) => e.kind(),
            DatapathError::InvalidConfig(_)
            | DatapathError::InvalidParameter(_)
            | DatapathError::InvalidRule { .. }
            | DatapathError::AccessDenied(_) => ErrorKind::Validation,
            DatapathError::InvalidState(_)
            | DatapathError::DuplicateObject(_)
            | DatapathError::NotFound(_)
            | DatapathError::Timeout
            | DatapathError::Cancelled => ErrorKind::StateConflict,
            DatapathError::InvalidRing(_) => ErrorKind::Integrity,
            DatapathError::DeviceRemoved(_) => ErrorKind::Removed,
            DatapathError::Exhausted(_) | DatapathError::Interface(_) => ErrorKind::Exhaustion,
        }
    }
}

/// Result alias for datapath operations
pub type Result<T> = std::result::Result<T, DatapathError>;
