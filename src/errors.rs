//! Error types for volume operations

use std::io;
use thiserror::Error;

/// Result type for volume operations
pub type Result<T> = std::result::Result<T, VolumeError>;

/// Errors that can occur while managing volumes
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume already exists: {0}")]
    VolumeExists(String),

    #[error("Invalid handle: {0:?}")]
    InvalidHandle(String),

    #[error("No parent volume provided")]
    NoParentProvided,

    #[error("Parent volume not found: {0}")]
    ParentNotFound(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Storage driver error: {0}")]
    StorageDriver(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Import error: {0}")]
    Import(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to reap {} volume(s): {}", .0.len(), .0.join("; "))]
    Reap(Vec<String>),
}

impl VolumeError {
    /// Errors caused by the caller's request rather than by storage
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            VolumeError::NoParentProvided
                | VolumeError::ParentNotFound(_)
                | VolumeError::UnknownStrategy(_)
                | VolumeError::InvalidHandle(_)
                | VolumeError::VolumeExists(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VolumeError::VolumeNotFound(_))
    }
}
