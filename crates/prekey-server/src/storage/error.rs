//! Storage error types.
//!
//! Defines errors that can occur during key store operations:
//! - `NotFound`: User never completed bundle registration
//! - `NoOpksAvailable`: One-time prekey supply exhausted (expected condition)
//! - `DuplicateKeyId` / `EmptyKeyId`: Invalid OPK batch from the client
//! - `IdentityKeyConflict`: Attempt to replace an immutable identity key
//! - `Serialization`: Failed to encode/decode a stored record
//! - `Io`: Underlying storage system errors

use std::fmt;

use thiserror::Error;

/// Kind of per-user record a lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `identity_keys` row
    IdentityKey,
    /// `signed_prekeys` row
    SignedPreKey,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentityKey => f.write_str("identity key"),
            Self::SignedPreKey => f.write_str("signed prekey"),
        }
    }
}

/// Errors that can occur during key store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No record of this kind exists for the user
    #[error("{record} not found for user {user_id}")]
    NotFound {
        /// Record that was looked up
        record: RecordKind,
        /// User that was looked up
        user_id: String,
    },

    /// Every one-time prekey for the user has been consumed
    ///
    /// Not a failure for bundle fetches: X3DH proceeds without an OPK.
    #[error("no available one-time prekeys for user {user_id}")]
    NoOpksAvailable {
        /// User whose supply is exhausted
        user_id: String,
    },

    /// OPK `key_id` already exists for this user or repeats within a batch
    #[error("duplicate one-time prekey id {key_id:?} for user {user_id}")]
    DuplicateKeyId {
        /// Owner of the keys
        user_id: String,
        /// Repeated client identifier
        key_id: String,
    },

    /// OPK upload without a `key_id`
    #[error("one-time prekey for user {user_id} has an empty key_id")]
    EmptyKeyId {
        /// Owner of the keys
        user_id: String,
    },

    /// Registration tried to replace an existing, different identity key
    #[error("user {user_id} is already registered with a different identity key")]
    IdentityKeyConflict {
        /// User whose identity key is immutable
        user_id: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if the error was caused by the caller's input or the
    /// user's registration state rather than the storage backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::DuplicateKeyId { .. }
                | Self::EmptyKeyId { .. }
                | Self::IdentityKeyConflict { .. }
        )
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
