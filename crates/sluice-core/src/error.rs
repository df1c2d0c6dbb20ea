//! Error types for the core data model

use serde::Serialize;
use thiserror::Error;

/// Broad category of a failure, used by callers to decide whether to retry,
/// fix their input, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Allocation failure or a full ring. Retry later.
    Exhaustion,
    /// Malformed input. Fix the request.
    Validation,
    /// Operation attempted in the wrong lifecycle state.
    StateConflict,
    /// Data-path integrity violation. Permanent.
    Integrity,
    /// The interface or queue was removed.
    Removed,
}

/// Errors raised by rings, extension sets and structure headers
#[derive(Debug, Error)]
pub enum CoreError {
    /// Memory for a ring or record could not be allocated
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Arithmetic on a size or offset overflowed its bound
    #[error("Integer overflow computing {0}")]
    IntegerOverflow(&'static str),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Extension name is not reserved in the set
    #[error("Extension not reserved: {0}")]
    ExtensionNotFound(String),

    /// Provider declared a version the set does not reserve
    #[error("Extension {name} version mismatch: reserved {reserved}, registered {registered}")]
    ExtensionVersionMismatch {
        /// Extension name
        name: String,
        /// Version reserved by the set
        reserved: u32,
        /// Version declared by the provider
        registered: u32,
    },

    /// Extension fetched before it was enabled and assigned an offset
    #[error("Extension {0} is not enabled or has no assigned offset")]
    ExtensionUnassigned(String),

    /// Control structure header rejected
    #[error("Structure header rejected: {0}")]
    Header(String),
}

impl CoreError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Allocation(_) => ErrorKind::Exhaustion,
            CoreError::IntegerOverflow(_)
            | CoreError::InvalidParameter(_)
            | CoreError::ExtensionNotFound(_)
            | CoreError::ExtensionVersionMismatch { .. }
            | CoreError::Header(_) => ErrorKind::Validation,
            CoreError::ExtensionUnassigned(_) => ErrorKind::StateConflict,
        }
    }
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
