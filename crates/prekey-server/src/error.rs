//! Service and server error types.
//!
//! [`ServiceError`] is what [`BundleService`](crate::BundleService) callers
//! see: every store failure is tagged with the protocol operation and the
//! store step that failed. [`ServerError`] covers process startup and the
//! command-line front end.

use std::fmt;

use prekey_crypto::VerificationError;
use thiserror::Error;

use crate::{audit::AuditError, storage::StorageError};

/// Protocol operation an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `store_bundle`
    StoreBundle,
    /// `get_bundle`
    GetBundle,
    /// `refill_opks`
    RefillOpks,
    /// `rotate_spk`
    RotateSpk,
    /// `count_available_opks`
    CountOpks,
}

impl Operation {
    /// Snake-case operation name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StoreBundle => "store_bundle",
            Self::GetBundle => "get_bundle",
            Self::RefillOpks => "refill_opks",
            Self::RotateSpk => "rotate_spk",
            Self::CountOpks => "count_available_opks",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store step within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Identity key lookup
    IdentityKey,
    /// Signed prekey lookup
    SignedPreKey,
    /// One-time prekey consumption
    OneTimePreKey,
    /// Bundle write
    StoreBundle,
    /// OPK batch write
    InsertOpks,
    /// Signed prekey replacement
    RotateSignedPreKey,
    /// OPK count
    CountOpks,
}

impl Step {
    /// Snake-case step name, as recorded in audit metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdentityKey => "identity_key",
            Self::SignedPreKey => "signed_prekey",
            Self::OneTimePreKey => "one_time_prekey",
            Self::StoreBundle => "store_bundle",
            Self::InsertOpks => "insert_opks",
            Self::RotateSignedPreKey => "rotate_signed_prekey",
            Self::CountOpks => "count_opks",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by bundle service operations
#[derive(Error, Debug)]
pub enum ServiceError {
    /// SPK signature did not verify against the identity key
    ///
    /// Nothing was written.
    #[error("{op}: invalid signed prekey signature: {source}")]
    InvalidSignature {
        /// Failing operation
        op: Operation,
        /// Why verification failed
        #[source]
        source: VerificationError,
    },

    /// A key store step failed
    #[error("{op}: {step} failed: {source}")]
    Store {
        /// Failing operation
        op: Operation,
        /// Step that failed
        step: Step,
        /// Store error
        #[source]
        source: StorageError,
    },

    /// The caller's deadline passed before the step could start
    #[error("{op}: deadline exceeded before {step}")]
    DeadlineExceeded {
        /// Failing operation
        op: Operation,
        /// Step that was not started
        step: Step,
    },
}

impl ServiceError {
    /// Operation the error occurred in.
    pub fn operation(&self) -> Operation {
        match self {
            Self::InvalidSignature { op, .. }
            | Self::Store { op, .. }
            | Self::DeadlineExceeded { op, .. } => *op,
        }
    }

    /// Store step the error occurred at. `None` for signature failures.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::InvalidSignature { .. } => None,
            Self::Store { step, .. } | Self::DeadlineExceeded { step, .. } => Some(*step),
        }
    }

    /// Underlying store error, if any.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::Store { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Returns true if retrying the same request cannot succeed.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidSignature { .. } => true,
            Self::Store { source, .. } => source.is_client_error(),
            Self::DeadlineExceeded { .. } => false,
        }
    }

    /// Returns true if the user (or their signed prekey) is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store { source: StorageError::NotFound { .. }, .. })
    }
}

/// Errors that can occur starting or driving the server.
#[derive(Debug)]
pub enum ServerError {
    /// Invalid configuration or command-line input.
    ///
    /// Fatal at startup. Fix configuration and restart.
    Config(String),

    /// Key store could not be opened.
    Storage(StorageError),

    /// Audit sink could not be opened.
    Audit(AuditError),

    /// A protocol operation failed.
    Service(ServiceError),

    /// Reading input or writing output failed.
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Audit(err) => write!(f, "audit error: {err}"),
            Self::Service(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(_) => None,
            Self::Storage(err) => Some(err),
            Self::Audit(err) => Some(err),
            Self::Service(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<AuditError> for ServerError {
    fn from(err: AuditError) -> Self {
        Self::Audit(err)
    }
}

impl From<ServiceError> for ServerError {
    fn from(err: ServiceError) -> Self {
        Self::Service(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid JSON: {err}"))
    }
}
