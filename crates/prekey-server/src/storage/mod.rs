//! Key store abstraction for the prekey server
//!
//! Trait-based abstraction for persisting identity keys, signed prekeys and
//! one-time prekeys. The trait is synchronous (no async) to keep the bundle
//! service a plain call-and-return API.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::collections::HashSet;

pub use chaotic::ChaoticKeyStore;
pub use error::{RecordKind, StorageError};
pub use memory::MemoryKeyStore;

pub use self::redb::RedbKeyStore;
use crate::types::{
    IdentityKey, OneTimePreKey, OneTimePreKeyUpload, RegisterBundleRequest, SignedPreKey,
};

/// Storage abstraction for X3DH key material
///
/// Must be Clone (shared by the bundle service and the OPK monitor), Send +
/// Sync (thread-safe), and synchronous. Implementations share internal state
/// via Arc, so clones access the same underlying store.
///
/// # Atomicity
///
/// Every method is a single unit: it either applies completely or leaves the
/// store untouched. [`KeyStore::consume_one_time_prekey`] is the one
/// read-modify-write operation concurrent callers race on; implementations
/// must guarantee that no OPK is ever returned by two calls.
pub trait KeyStore: Clone + Send + Sync + 'static {
    /// Identity key for a user.
    ///
    /// Fails with `NotFound` if the user never registered.
    fn get_identity_key(&self, user_id: &str) -> Result<IdentityKey, StorageError>;

    /// Active signed prekey for a user.
    ///
    /// Fails with `NotFound` if the user never registered.
    fn get_signed_prekey(&self, user_id: &str) -> Result<SignedPreKey, StorageError>;

    /// Take the user's oldest unused one-time prekey.
    ///
    /// # Invariants
    ///
    /// - Post: the returned OPK has `used == true` and no longer counts as
    ///   available; its key id stays reserved
    /// - A given OPK is returned at most once, across all callers
    ///
    /// Fails with `NoOpksAvailable` when every OPK has been consumed (or the
    /// user has none).
    fn consume_one_time_prekey(&self, user_id: &str) -> Result<OneTimePreKey, StorageError>;

    /// Persist identity key, signed prekey and initial OPK batch together.
    ///
    /// Re-registration with the same identity key replaces the SPK (clearing
    /// any expiry) and adds the OPKs. A different identity key fails with
    /// `IdentityKeyConflict`. The OPK batch is validated as in
    /// [`KeyStore::insert_opks`]; any failure leaves the store unchanged.
    fn store_bundle(&self, bundle: &RegisterBundleRequest) -> Result<(), StorageError>;

    /// Add a batch of one-time prekeys.
    ///
    /// All-or-nothing. Fails with `EmptyKeyId` or `DuplicateKeyId` (against
    /// the user's existing keys, used or not, or within the batch).
    fn insert_opks(&self, user_id: &str, opks: &[OneTimePreKeyUpload])
    -> Result<(), StorageError>;

    /// Replace the user's signed prekey wholesale.
    ///
    /// The previous SPK is discarded. Fails with `NotFound` if the user has
    /// no SPK to replace.
    fn rotate_signed_prekey(
        &self,
        user_id: &str,
        new_spk: &str,
        signature: &str,
        expires_at_secs: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Number of unused one-time prekeys. Zero for unknown users.
    fn count_available_opks(&self, user_id: &str) -> Result<usize, StorageError>;

    /// Every user that ever uploaded an OPK, including exhausted users.
    ///
    /// Order is not guaranteed.
    fn list_users_with_opks(&self) -> Result<Vec<String>, StorageError>;
}

/// Validate an OPK batch against the user's existing key ids.
///
/// `is_taken` reports whether a key id was already uploaded for the user,
/// used or not. Shared by every backend so they reject exactly the same
/// batches.
pub(crate) fn validate_opk_batch(
    user_id: &str,
    batch: &[OneTimePreKeyUpload],
    mut is_taken: impl FnMut(&str) -> Result<bool, StorageError>,
) -> Result<(), StorageError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(batch.len());

    for opk in batch {
        if opk.key_id.is_empty() {
            return Err(StorageError::EmptyKeyId { user_id: user_id.to_string() });
        }
        if !seen.insert(opk.key_id.as_str()) || is_taken(&opk.key_id)? {
            return Err(StorageError::DuplicateKeyId {
                user_id: user_id.to_string(),
                key_id: opk.key_id.clone(),
            });
        }
    }

    Ok(())
}
