//! Chaotic key store wrapper for fault injection testing
//!
//! Randomly fails operations before they reach the wrapped store, so an
//! injected failure never leaves a partial write behind. Used by chaos tests
//! to check that the bundle service and the OPK monitor surface storage
//! failures without corrupting state or handing out an OPK twice.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use super::{KeyStore, StorageError};
use crate::types::{
    IdentityKey, OneTimePreKey, OneTimePreKeyUpload, RegisterBundleRequest, SignedPreKey,
};

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Key store wrapper that randomly injects `Io` failures
///
/// Delegates to an underlying store but fails each operation with probability
/// `failure_rate`. Clones share the RNG and operation counter.
#[derive(Clone)]
pub struct ChaoticKeyStore<S: KeyStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, deterministic per seed so chaos runs are
/// reproducible.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: KeyStore> ChaoticKeyStore<S> {
    /// Wrap `inner` with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store, for checking invariants after chaos.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of operations attempted, failed or not.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Count the operation and roll for an injected failure.
    fn roll(&self, operation: &str) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let sample = self
            .rng
            .lock()
            .map_err(|_| StorageError::Io("chaotic rng mutex poisoned".to_string()))?
            .next();

        if sample < self.failure_rate {
            return Err(StorageError::Io(format!("chaotic failure injection in {operation}")));
        }
        Ok(())
    }
}

impl<S: KeyStore> KeyStore for ChaoticKeyStore<S> {
    fn get_identity_key(&self, user_id: &str) -> Result<IdentityKey, StorageError> {
        self.roll("get_identity_key")?;
        self.inner.get_identity_key(user_id)
    }

    fn get_signed_prekey(&self, user_id: &str) -> Result<SignedPreKey, StorageError> {
        self.roll("get_signed_prekey")?;
        self.inner.get_signed_prekey(user_id)
    }

    fn consume_one_time_prekey(&self, user_id: &str) -> Result<OneTimePreKey, StorageError> {
        self.roll("consume_one_time_prekey")?;
        self.inner.consume_one_time_prekey(user_id)
    }

    fn store_bundle(&self, bundle: &RegisterBundleRequest) -> Result<(), StorageError> {
        self.roll("store_bundle")?;
        self.inner.store_bundle(bundle)
    }

    fn insert_opks(
        &self,
        user_id: &str,
        opks: &[OneTimePreKeyUpload],
    ) -> Result<(), StorageError> {
        self.roll("insert_opks")?;
        self.inner.insert_opks(user_id, opks)
    }

    fn rotate_signed_prekey(
        &self,
        user_id: &str,
        new_spk: &str,
        signature: &str,
        expires_at_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        self.roll("rotate_signed_prekey")?;
        self.inner.rotate_signed_prekey(user_id, new_spk, signature, expires_at_secs)
    }

    fn count_available_opks(&self, user_id: &str) -> Result<usize, StorageError> {
        self.roll("count_available_opks")?;
        self.inner.count_available_opks(user_id)
    }

    fn list_users_with_opks(&self) -> Result<Vec<String>, StorageError> {
        self.roll("list_users_with_opks")?;
        self.inner.list_users_with_opks()
    }
}
