//! Prekey Cryptographic Primitives
//!
//! Pure functions used by the prekey server to accept key material from
//! clients. Nothing here holds state or performs I/O.
//!
//! # Signed Prekey Verification
//!
//! An X3DH bundle carries a medium-term signed prekey (SPK) together with an
//! Ed25519 signature made by the owner's long-term identity key (IK). The
//! server checks that signature before persisting the SPK, so a peer that
//! later fetches the bundle receives an SPK that provably belongs to the IK.
//!
//! ```text
//! identity_key_b64 ─┐
//! spk_b64 ──────────┼─► decode_flexible_base64 ─► length checks ─► Ed25519 verify
//! signature_b64 ────┘         (32 / 32 / 64)
//! ```
//!
//! # Encoding
//!
//! Client libraries disagree about the base64 alphabet and padding. Every key
//! and signature goes through [`decode_flexible_base64`], which accepts the
//! URL-safe alphabet with or without padding and the standard alphabet with
//! padding.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod encoding;
mod error;
mod verify;

pub use encoding::decode_flexible_base64;
pub use error::{DecodeError, KeyFault, VerificationError};
pub use verify::{
    Ed25519Verifier, PUBLIC_KEY_LENGTH, PreKeyVerifier, SIGNATURE_LENGTH, verify_signed_prekey,
};
