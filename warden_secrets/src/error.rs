// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for warden_secrets.

use thiserror::Error;
use warden_store::StoreError;

/// Result type for secrets operations.
pub type Result<T> = std::result::Result<T, SecretsError>;

/// Errors that can occur in secrets operations.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Requested secret, revision, consumer, or label lookup does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// URI collision on create.
    #[error("secret {0} already exists")]
    AlreadyExists(String),

    /// Label uniqueness violation within the owner namespace.
    #[error("secret with label {0} already exists")]
    LabelExists(String),

    /// Owner, scope, or subject is dying or dead.
    #[error("{0}")]
    NotAlive(String),

    /// Operation not supported for this subject.
    #[error("{0}")]
    NotSupported(String),

    /// Leader token failed to validate at commit.
    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    /// Malformed or missing input.
    #[error("{0}")]
    InvalidArgument(String),

    /// A persisted document could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transaction conflict or other store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SecretsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_label_exists(&self) -> bool {
        matches!(self, Self::LabelExists(_))
    }

    pub fn is_not_alive(&self) -> bool {
        matches!(self, Self::NotAlive(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    pub fn is_leadership_lost(&self) -> bool {
        matches!(self, Self::LeadershipLost(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_conflict())
    }
}
