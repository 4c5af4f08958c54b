#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{KeyStore, RecordKind, StorageError, validate_opk_batch};
use crate::types::{
    IdentityKey, OneTimePreKey, OneTimePreKeyUpload, RegisterBundleRequest, SignedPreKey,
};

/// In-memory key store for testing and single-process deployments
///
/// All state sits behind one `Arc<Mutex<>>`, so every operation (including
/// OPK consumption) is atomic with respect to every other. Clone shares the
/// same underlying maps.
#[derive(Clone)]
pub struct MemoryKeyStore {
    inner: Arc<Mutex<MemoryKeyStoreInner>>,
}

#[derive(Default)]
struct MemoryKeyStoreInner {
    identity_keys: HashMap<String, IdentityKey>,

    signed_prekeys: HashMap<String, SignedPreKey>,

    one_time_prekeys: HashMap<String, UserOpks>,

    next_opk_id: u64,
}

/// One user's OPK state.
///
/// Consumed OPKs leave `unused` but their key ids stay in `key_ids`, so a
/// consumed key id can never be uploaded again.
#[derive(Default)]
struct UserOpks {
    /// Unused OPKs in insertion (and therefore `id`) order
    unused: VecDeque<OneTimePreKey>,

    /// Every key id ever uploaded for the user
    key_ids: HashSet<String>,
}

impl MemoryKeyStoreInner {
    fn append_opks(&mut self, user_id: &str, opks: &[OneTimePreKeyUpload]) {
        if opks.is_empty() {
            return;
        }

        let mut next_id = self.next_opk_id;
        let user = self.one_time_prekeys.entry(user_id.to_string()).or_default();

        for opk in opks {
            user.key_ids.insert(opk.key_id.clone());
            user.unused.push_back(OneTimePreKey {
                id: next_id,
                key_id: opk.key_id.clone(),
                user_id: user_id.to_string(),
                public_key: opk.public_key.clone(),
                used: false,
            });
            next_id += 1;
        }

        self.next_opk_id = next_id;
    }

    fn validate_opks(
        &self,
        user_id: &str,
        opks: &[OneTimePreKeyUpload],
    ) -> Result<(), StorageError> {
        let key_ids = self.one_time_prekeys.get(user_id).map(|user| &user.key_ids);
        validate_opk_batch(user_id, opks, |key_id| {
            Ok(key_ids.is_some_and(|key_ids| key_ids.contains(key_id)))
        })
    }
}

impl MemoryKeyStore {
    /// Create a new empty `MemoryKeyStore`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryKeyStoreInner::default())) }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryKeyStoreInner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("key store mutex poisoned".to_string()))
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_identity_key(&self, user_id: &str) -> Result<IdentityKey, StorageError> {
        self.lock()?.identity_keys.get(user_id).cloned().ok_or_else(|| StorageError::NotFound {
            record: RecordKind::IdentityKey,
            user_id: user_id.to_string(),
        })
    }

    fn get_signed_prekey(&self, user_id: &str) -> Result<SignedPreKey, StorageError> {
        self.lock()?.signed_prekeys.get(user_id).cloned().ok_or_else(|| StorageError::NotFound {
            record: RecordKind::SignedPreKey,
            user_id: user_id.to_string(),
        })
    }

    fn consume_one_time_prekey(&self, user_id: &str) -> Result<OneTimePreKey, StorageError> {
        let mut inner = self.lock()?;

        let mut opk = inner
            .one_time_prekeys
            .get_mut(user_id)
            .and_then(|user| user.unused.pop_front())
            .ok_or_else(|| StorageError::NoOpksAvailable { user_id: user_id.to_string() })?;

        opk.used = true;
        Ok(opk)
    }

    fn store_bundle(&self, bundle: &RegisterBundleRequest) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let user_id = bundle.user_id.as_str();

        if inner
            .identity_keys
            .get(user_id)
            .is_some_and(|existing| existing.public_key != bundle.identity_key)
        {
            return Err(StorageError::IdentityKeyConflict { user_id: user_id.to_string() });
        }
        inner.validate_opks(user_id, &bundle.one_time_prekeys)?;

        // Validation passed; nothing below can fail
        inner.identity_keys.insert(
            user_id.to_string(),
            IdentityKey { user_id: user_id.to_string(), public_key: bundle.identity_key.clone() },
        );
        inner.signed_prekeys.insert(
            user_id.to_string(),
            SignedPreKey {
                user_id: user_id.to_string(),
                public_key: bundle.signed_prekey.clone(),
                signature: bundle.spk_signature.clone(),
                expires_at_secs: None,
            },
        );
        inner.append_opks(user_id, &bundle.one_time_prekeys);

        Ok(())
    }

    fn insert_opks(
        &self,
        user_id: &str,
        opks: &[OneTimePreKeyUpload],
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;

        inner.validate_opks(user_id, opks)?;
        inner.append_opks(user_id, opks);

        Ok(())
    }

    fn rotate_signed_prekey(
        &self,
        user_id: &str,
        new_spk: &str,
        signature: &str,
        expires_at_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;

        let spk = inner.signed_prekeys.get_mut(user_id).ok_or_else(|| StorageError::NotFound {
            record: RecordKind::SignedPreKey,
            user_id: user_id.to_string(),
        })?;

        *spk = SignedPreKey {
            user_id: user_id.to_string(),
            public_key: new_spk.to_string(),
            signature: signature.to_string(),
            expires_at_secs,
        };

        Ok(())
    }

    fn count_available_opks(&self, user_id: &str) -> Result<usize, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .one_time_prekeys
            .get(user_id)
            .map_or(0, |user| user.unused.len()))
    }

    fn list_users_with_opks(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .one_time_prekeys
            .iter()
            .filter(|(_, user)| !user.key_ids.is_empty())
            .map(|(user_id, _)| user_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(user_id: &str, identity_key: &str, opk_ids: &[&str]) -> RegisterBundleRequest {
        RegisterBundleRequest {
            user_id: user_id.to_string(),
            identity_key: identity_key.to_string(),
            signed_prekey: "spk".to_string(),
            spk_signature: "sig".to_string(),
            one_time_prekeys: opk_ids
                .iter()
                .map(|id| OneTimePreKeyUpload::new(*id, format!("opk-{id}")))
                .collect(),
        }
    }

    #[test]
    fn store_and_fetch_bundle() {
        let store = MemoryKeyStore::new();
        store.store_bundle(&bundle("alice", "ik", &["1", "2"])).unwrap();

        assert_eq!(store.get_identity_key("alice").unwrap().public_key, "ik");
        assert_eq!(store.get_signed_prekey("alice").unwrap().signature, "sig");
        assert_eq!(store.count_available_opks("alice").unwrap(), 2);
    }

    #[test]
    fn missing_user_is_not_found() {
        let store = MemoryKeyStore::new();

        assert!(matches!(
            store.get_identity_key("ghost"),
            Err(StorageError::NotFound { record: RecordKind::IdentityKey, .. })
        ));
        assert!(matches!(
            store.get_signed_prekey("ghost"),
            Err(StorageError::NotFound { record: RecordKind::SignedPreKey, .. })
        ));
        assert_eq!(store.count_available_opks("ghost").unwrap(), 0);
    }

    #[test]
    fn consume_is_fifo_and_one_time() {
        let store = MemoryKeyStore::new();
        store.store_bundle(&bundle("alice", "ik", &["a", "b"])).unwrap();

        let first = store.consume_one_time_prekey("alice").unwrap();
        let second = store.consume_one_time_prekey("alice").unwrap();

        assert_eq!(first.key_id, "a");
        assert_eq!(second.key_id, "b");
        assert!(first.used && second.used);
        assert!(first.id < second.id);

        assert_eq!(
            store.consume_one_time_prekey("alice"),
            Err(StorageError::NoOpksAvailable { user_id: "alice".to_string() })
        );
    }

    #[test]
    fn consume_drops_the_row_and_keeps_the_key_id() {
        let store = MemoryKeyStore::new();
        store.store_bundle(&bundle("alice", "ik", &["a", "b", "c"])).unwrap();

        store.consume_one_time_prekey("alice").unwrap();
        store.consume_one_time_prekey("alice").unwrap();

        let inner = store.lock().unwrap();
        let user = &inner.one_time_prekeys["alice"];
        let unused: Vec<&str> = user.unused.iter().map(|opk| opk.key_id.as_str()).collect();
        assert_eq!(unused, vec!["c"]);
        assert_eq!(user.key_ids.len(), 3);
    }

    #[test]
    fn different_identity_key_conflicts() {
        let store = MemoryKeyStore::new();
        store.store_bundle(&bundle("alice", "ik-1", &["a"])).unwrap();

        let result = store.store_bundle(&bundle("alice", "ik-2", &["b"]));
        assert_eq!(result, Err(StorageError::IdentityKeyConflict { user_id: "alice".to_string() }));

        // Nothing from the rejected bundle landed
        assert_eq!(store.get_identity_key("alice").unwrap().public_key, "ik-1");
        assert_eq!(store.count_available_opks("alice").unwrap(), 1);
    }

    #[test]
    fn duplicate_opk_in_bundle_stores_nothing() {
        let store = MemoryKeyStore::new();

        let result = store.store_bundle(&bundle("alice", "ik", &["a", "a"]));
        assert!(matches!(result, Err(StorageError::DuplicateKeyId { .. })));

        assert!(store.get_identity_key("alice").is_err());
        assert!(store.get_signed_prekey("alice").is_err());
        assert!(store.lock().unwrap().one_time_prekeys.is_empty());
    }

    #[test]
    fn refill_rejects_reused_key_id_even_after_consumption() {
        let store = MemoryKeyStore::new();
        store.store_bundle(&bundle("alice", "ik", &["a"])).unwrap();
        store.consume_one_time_prekey("alice").unwrap();

        let result = store.insert_opks("alice", &[OneTimePreKeyUpload::new("a", "again")]);
        assert!(matches!(result, Err(StorageError::DuplicateKeyId { .. })));
    }

    #[test]
    fn rotate_replaces_spk() {
        let store = MemoryKeyStore::new();
        store.store_bundle(&bundle("alice", "ik", &[])).unwrap();

        store.rotate_signed_prekey("alice", "spk-2", "sig-2", Some(500)).unwrap();

        let spk = store.get_signed_prekey("alice").unwrap();
        assert_eq!(spk.public_key, "spk-2");
        assert_eq!(spk.signature, "sig-2");
        assert_eq!(spk.expires_at_secs, Some(500));
    }

    #[test]
    fn rotate_unknown_user_is_not_found() {
        let store = MemoryKeyStore::new();
        assert!(matches!(
            store.rotate_signed_prekey("ghost", "spk", "sig", None),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn list_users_includes_exhausted_users() {
        let store = MemoryKeyStore::new();
        store.store_bundle(&bundle("alice", "ik", &["a"])).unwrap();
        store.store_bundle(&bundle("bob", "ik", &[])).unwrap();
        store.consume_one_time_prekey("alice").unwrap();

        assert_eq!(store.list_users_with_opks().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn clone_shares_state() {
        let store1 = MemoryKeyStore::new();
        let store2 = store1.clone();

        store1.store_bundle(&bundle("alice", "ik", &["a"])).unwrap();
        store2.consume_one_time_prekey("alice").unwrap();

        assert_eq!(store1.count_available_opks("alice").unwrap(), 0);
    }
}
