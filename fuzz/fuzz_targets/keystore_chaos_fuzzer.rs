//! Fuzz target for key store operations under injected failures
//!
//! Drives an arbitrary operation sequence through `ChaoticKeyStore` over
//! `MemoryKeyStore` and checks every outcome against a simple model.
//!
//! # Invariants
//!
//! - The store NEVER panics
//! - Injected failures leave the store untouched
//! - A different identity key never replaces a registered one
//! - OPKs come out oldest first and each key id at most once
//! - Rejected batches add nothing
//! - Counts match uploaded minus consumed

#![no_main]

use std::collections::{HashMap, HashSet, VecDeque};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use prekey_server::{
    ChaoticKeyStore, KeyStore, MemoryKeyStore, OneTimePreKeyUpload, RegisterBundleRequest,
    StorageError,
};

const USERS: [&str; 3] = ["alice", "al", "bob"];

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    /// Seed for ChaoticKeyStore RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    Register { user: u8, identity: u8, key_ids: Vec<u8> },
    Refill { user: u8, key_ids: Vec<u8> },
    Consume { user: u8 },
    Rotate { user: u8, spk: u8 },
    Count { user: u8 },
}

#[derive(Default)]
struct UserModel {
    identity: Option<String>,
    spk: Option<String>,
    key_ids: HashSet<String>,
    unused: VecDeque<String>,
}

impl UserModel {
    fn accepts(&self, batch: &[OneTimePreKeyUpload]) -> bool {
        let mut seen: HashSet<&str> = self.key_ids.iter().map(String::as_str).collect();
        batch.iter().all(|opk| seen.insert(opk.key_id.as_str()))
    }

    fn append(&mut self, batch: &[OneTimePreKeyUpload]) {
        for opk in batch {
            self.key_ids.insert(opk.key_id.clone());
            self.unused.push_back(opk.key_id.clone());
        }
    }
}

fn user(index: u8) -> &'static str {
    USERS[usize::from(index) % USERS.len()]
}

fn batch(key_ids: &[u8]) -> Vec<OneTimePreKeyUpload> {
    key_ids
        .iter()
        .take(16)
        .map(|id| OneTimePreKeyUpload::new(format!("k{id}"), format!("pk{id}")))
        .collect()
}

fn is_injected(result: &Result<impl Sized, StorageError>) -> bool {
    matches!(result, Err(StorageError::Io(_)))
}

fuzz_target!(|scenario: Scenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let inner = MemoryKeyStore::new();
    let store = ChaoticKeyStore::with_seed(inner.clone(), failure_rate, scenario.chaos_seed);
    let mut model: HashMap<&str, UserModel> = HashMap::new();

    for op in scenario.operations.iter().take(256) {
        match op {
            Operation::Register { user: index, identity, key_ids } => {
                let user_id = user(*index);
                let opks = batch(key_ids);
                let req = RegisterBundleRequest {
                    user_id: user_id.to_string(),
                    identity_key: format!("ik{identity}"),
                    signed_prekey: format!("spk-{user_id}"),
                    spk_signature: "sig".to_string(),
                    one_time_prekeys: opks.clone(),
                };

                let result = store.store_bundle(&req);
                if is_injected(&result) {
                    continue;
                }

                let entry = model.entry(user_id).or_default();
                let conflict =
                    entry.identity.as_ref().is_some_and(|current| *current != req.identity_key);
                let expected_ok = !conflict && entry.accepts(&opks);
                assert_eq!(result.is_ok(), expected_ok, "{user_id}: {result:?}");

                if expected_ok {
                    entry.identity = Some(req.identity_key.clone());
                    entry.spk = Some(req.signed_prekey.clone());
                    entry.append(&opks);
                }
            },
            Operation::Refill { user: index, key_ids } => {
                let user_id = user(*index);
                let opks = batch(key_ids);

                let result = store.insert_opks(user_id, &opks);
                if is_injected(&result) {
                    continue;
                }

                let entry = model.entry(user_id).or_default();
                let expected_ok = entry.accepts(&opks);
                assert_eq!(result.is_ok(), expected_ok, "{user_id}: {result:?}");
                if expected_ok {
                    entry.append(&opks);
                }
            },
            Operation::Consume { user: index } => {
                let user_id = user(*index);

                let result = store.consume_one_time_prekey(user_id);
                if is_injected(&result) {
                    continue;
                }

                let expected = model.entry(user_id).or_default().unused.pop_front();
                match (result, expected) {
                    (Ok(opk), Some(key_id)) => {
                        assert_eq!(opk.key_id, key_id);
                        assert_eq!(opk.user_id, user_id);
                        assert!(opk.used);
                    },
                    (Err(StorageError::NoOpksAvailable { .. }), None) => {},
                    (result, expected) => panic!("{user_id}: got {result:?}, expected {expected:?}"),
                }
            },
            Operation::Rotate { user: index, spk } => {
                let user_id = user(*index);
                let new_spk = format!("spk{spk}");

                let result = store.rotate_signed_prekey(user_id, &new_spk, "sig", None);
                if is_injected(&result) {
                    continue;
                }

                let entry = model.entry(user_id).or_default();
                assert_eq!(result.is_ok(), entry.spk.is_some(), "{user_id}: {result:?}");
                if result.is_ok() {
                    entry.spk = Some(new_spk);
                }
            },
            Operation::Count { user: index } => {
                let user_id = user(*index);

                let result = store.count_available_opks(user_id);
                if is_injected(&result) {
                    continue;
                }

                let expected = model.get(user_id).map_or(0, |entry| entry.unused.len());
                assert_eq!(result.ok(), Some(expected));
            },
        }
    }

    // The inner store agrees with the model once failures are out of the way
    for (user_id, entry) in &model {
        assert_eq!(inner.count_available_opks(user_id).ok(), Some(entry.unused.len()));
        match &entry.identity {
            Some(identity) => {
                assert_eq!(&inner.get_identity_key(user_id).unwrap().public_key, identity);
            },
            None => assert!(inner.get_identity_key(user_id).is_err()),
        }
        if let Some(spk) = &entry.spk {
            assert_eq!(&inner.get_signed_prekey(user_id).unwrap().public_key, spk);
        }
    }
});
