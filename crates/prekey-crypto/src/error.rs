//! Error types for key decoding and signature verification

use thiserror::Error;

/// None of the accepted base64 dialects could decode the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not valid base64 in any accepted dialect: {source}")]
pub struct DecodeError {
    /// Error reported by the last dialect tried (standard alphabet)
    #[source]
    pub source: base64::DecodeError,
}

/// Why a single key or signature field was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyFault {
    /// Field is not base64
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Field decoded to the wrong number of bytes
    #[error("expected {expected} bytes, got {actual}")]
    Length {
        /// Required length in bytes
        expected: usize,
        /// Decoded length in bytes
        actual: usize,
    },

    /// 32 bytes that do not encode an Ed25519 point
    #[error("not a valid Ed25519 public key")]
    NotOnCurve,
}

/// Errors from signed prekey verification.
///
/// Every variant is an input validation failure. None of them are transient,
/// so callers must not retry with the same input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Identity key failed to decode or has the wrong shape
    #[error("invalid identity key: {0}")]
    InvalidIdentityKey(KeyFault),

    /// Signed prekey failed to decode or has the wrong length
    #[error("invalid signed prekey: {0}")]
    InvalidSignedPreKey(KeyFault),

    /// Signature failed to decode or has the wrong length
    #[error("invalid signature: {0}")]
    InvalidSignature(KeyFault),

    /// Well-formed inputs, but the signature does not verify
    #[error("signature verification failed")]
    SignatureMismatch,
}

impl VerificationError {
    /// Returns true if the inputs were well-formed and only the signature
    /// check itself failed.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::SignatureMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_fault_display() {
        let err = VerificationError::InvalidSignature(KeyFault::Length {
            expected: 64,
            actual: 63,
        });
        assert_eq!(err.to_string(), "invalid signature: expected 64 bytes, got 63");
        assert!(!err.is_mismatch());
    }

    #[test]
    fn mismatch_display() {
        let err = VerificationError::SignatureMismatch;
        assert_eq!(err.to_string(), "signature verification failed");
        assert!(err.is_mismatch());
    }
}
