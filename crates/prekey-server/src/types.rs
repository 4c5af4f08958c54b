//! Key records and request/response payloads.
//!
//! Keys are carried as base64 text exactly as clients uploaded them. The
//! server only decodes key material to verify SPK signatures; everything it
//! hands back to peers is the original text.

use serde::{Deserialize, Serialize};

/// Long-term identity public key. One per user, immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Owner of the key
    pub user_id: String,
    /// Ed25519 public key, base64
    pub public_key: String,
}

/// The user's single active signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Owner of the key
    pub user_id: String,
    /// SPK public key, base64
    pub public_key: String,
    /// Identity key signature over the SPK bytes, base64
    pub signature: String,
    /// Unix timestamp (seconds) after which the owner should rotate
    pub expires_at_secs: Option<u64>,
}

impl SignedPreKey {
    /// Whether the SPK is past its expiry at `now_secs`.
    ///
    /// SPKs without an expiry never expire.
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expires_at_secs.is_some_and(|expires| expires <= now_secs)
    }
}

/// A one-time prekey row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Store-assigned id, increasing in insertion order
    pub id: u64,
    /// Client-assigned identifier, unique per user
    pub key_id: String,
    /// Owner of the key
    pub user_id: String,
    /// OPK public key, base64
    pub public_key: String,
    /// Set exactly once, when the key is handed to a peer
    pub used: bool,
}

/// A one-time prekey as uploaded by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyUpload {
    /// Client-assigned identifier, unique per user
    pub key_id: String,
    /// OPK public key, base64
    pub public_key: String,
}

impl OneTimePreKeyUpload {
    /// Create an upload entry.
    pub fn new(key_id: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self { key_id: key_id.into(), public_key: public_key.into() }
    }
}

/// Initial bundle registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBundleRequest {
    /// User registering the bundle
    pub user_id: String,
    /// Identity public key, base64
    pub identity_key: String,
    /// Signed prekey, base64
    pub signed_prekey: String,
    /// Identity key signature over the signed prekey, base64
    pub spk_signature: String,
    /// Initial batch of one-time prekeys
    #[serde(default)]
    pub one_time_prekeys: Vec<OneTimePreKeyUpload>,
}

/// Batch of additional one-time prekeys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillOpkRequest {
    /// Owner of the keys
    pub user_id: String,
    /// Keys to add
    pub opks: Vec<OneTimePreKeyUpload>,
}

/// Replacement of the signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateSpkRequest {
    /// Owner of the key
    pub user_id: String,
    /// New signed prekey, base64
    pub new_spk: String,
    /// Identity key signature over the new SPK, base64
    pub signature: String,
    /// Unix timestamp (seconds) of the new SPK's expiry
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// Public keys handed to a peer that wants to start a session.
///
/// `one_time_prekey` and `opk_id` are both present or both absent. They are
/// absent once the user's OPK supply is exhausted; X3DH then runs without the
/// one-time DH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleResponse {
    /// Identity public key, base64
    pub identity_key: String,
    /// Signed prekey, base64
    pub signed_prekey: String,
    /// Identity key signature over the signed prekey, base64
    pub spk_signature: String,
    /// Consumed one-time prekey, base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<String>,
    /// Client-assigned `key_id` of the consumed one-time prekey
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opk_id: Option<String>,
}

impl BundleResponse {
    /// Whether the bundle includes a one-time prekey.
    pub fn has_opk(&self) -> bool {
        self.one_time_prekey.is_some()
    }
}
