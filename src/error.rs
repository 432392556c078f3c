//! Error types for the provenance registry

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Provenance registry errors
///
/// Every variant is a rejected operation: when one is returned, no registry
/// state has changed.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Product already registered: {serial}")]
    DuplicateSerial { serial: String },

    #[error("Product not found: {serial}")]
    NotFound { serial: String },

    #[error("Unauthorized: {caller} may not {action} product {serial}")]
    Unauthorized {
        caller: String,
        action: &'static str,
        serial: String,
    },

    #[error("Transfer blocked: product {serial} has an active flag")]
    TransferBlocked { serial: String },

    #[error("Invalid owner: {0}")]
    InvalidOwner(String),

    #[error("Product already flagged: {serial}")]
    AlreadyFlagged { serial: String },

    #[error("Product not flagged: {serial}")]
    NotFlagged { serial: String },

    #[error("Invalid flag reason: {0}")]
    InvalidReason(String),

    #[error("Invalid serial hash: {0}")]
    InvalidSerial(String),

    #[error("Corrupt registry state: {0}")]
    CorruptState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn not_found(serial: impl ToString) -> Self {
        Self::NotFound {
            serial: serial.to_string(),
        }
    }

    pub(crate) fn unauthorized(
        caller: impl ToString,
        action: &'static str,
        serial: impl ToString,
    ) -> Self {
        Self::Unauthorized {
            caller: caller.to_string(),
            action,
            serial: serial.to_string(),
        }
    }
}
