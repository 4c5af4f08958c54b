//! Chaos property tests for key stores
//!
//! Wraps each backend in `ChaoticKeyStore` and drives random operation
//! sequences through it. Injected failures happen before the inner store is
//! touched, so a tracked model of successful operations must always agree
//! with the inner store:
//! - No OPK is consumed twice
//! - A failed refill adds nothing
//! - Available counts equal uploaded minus consumed
//! - Bundle fetches that fail never lose an OPK

use std::{collections::HashSet, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signer, SigningKey};
use prekey_server::{
    BundleService, ChaoticKeyStore, KeyStore, MemoryAuditLogger, MemoryKeyStore,
    OneTimePreKeyUpload, RedbKeyStore, RegisterBundleRequest, RequestContext, ServiceError,
    StorageError,
};
use proptest::prelude::*;
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum Op {
    Refill(usize),
    Consume,
    Count,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (1usize..8).prop_map(Op::Refill),
        4 => Just(Op::Consume),
        1 => Just(Op::Count),
    ]
}

/// Run `ops` against `store` and check every result against the model.
fn run_ops<S: KeyStore>(store: &ChaoticKeyStore<S>, ops: &[Op]) -> Result<(), TestCaseError> {
    let mut next_key = 0usize;
    let mut uploaded = 0usize;
    let mut consumed = HashSet::new();

    for op in ops {
        match op {
            Op::Refill(n) => {
                let batch: Vec<_> = (next_key..next_key + n)
                    .map(|i| OneTimePreKeyUpload::new(format!("k{i}"), format!("pk{i}")))
                    .collect();
                match store.insert_opks("alice", &batch) {
                    Ok(()) => {
                        next_key += n;
                        uploaded += n;
                    },
                    Err(StorageError::Io(_)) => {},
                    Err(e) => prop_assert!(false, "unexpected refill error: {e:?}"),
                }
            },
            Op::Consume => match store.consume_one_time_prekey("alice") {
                Ok(opk) => {
                    prop_assert!(opk.used);
                    prop_assert!(consumed.insert(opk.key_id), "OPK consumed twice");
                },
                Err(StorageError::NoOpksAvailable { .. }) => {
                    prop_assert_eq!(consumed.len(), uploaded);
                },
                Err(StorageError::Io(_)) => {},
                Err(e) => prop_assert!(false, "unexpected consume error: {e:?}"),
            },
            Op::Count => match store.count_available_opks("alice") {
                Ok(count) => prop_assert_eq!(count, uploaded - consumed.len()),
                Err(StorageError::Io(_)) => {},
                Err(e) => prop_assert!(false, "unexpected count error: {e:?}"),
            },
        }
    }

    let remaining = store.inner().count_available_opks("alice").unwrap();
    prop_assert_eq!(remaining, uploaded - consumed.len());
    prop_assert_eq!(store.operation_count(), ops.len());

    Ok(())
}

#[test]
fn prop_memory_store_chaos_keeps_model() {
    proptest!(|(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 1..80),
    )| {
        let store = ChaoticKeyStore::with_seed(MemoryKeyStore::new(), failure_rate, seed);
        run_ops(&store, &ops)?;
    });
}

#[test]
fn prop_redb_store_chaos_keeps_model() {
    let config = ProptestConfig { cases: 24, ..ProptestConfig::default() };

    proptest!(config, |(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 1..40),
    )| {
        let dir = tempdir().unwrap();
        let inner = RedbKeyStore::open(dir.path().join("chaos.redb")).unwrap();
        let store = ChaoticKeyStore::with_seed(inner, failure_rate, seed);
        run_ops(&store, &ops)?;
    });
}

fn signed_registration(user_id: &str, opk_count: usize) -> RegisterBundleRequest {
    let identity = SigningKey::from_bytes(&[3; 32]);
    let spk = SigningKey::from_bytes(&[4; 32]).verifying_key().to_bytes();

    RegisterBundleRequest {
        user_id: user_id.to_string(),
        identity_key: STANDARD.encode(identity.verifying_key().to_bytes()),
        signed_prekey: STANDARD.encode(spk),
        spk_signature: STANDARD.encode(identity.sign(&spk).to_bytes()),
        one_time_prekeys: (0..opk_count)
            .map(|i| OneTimePreKeyUpload::new(format!("k{i}"), format!("pk{i}")))
            .collect(),
    }
}

#[test]
fn prop_failed_fetches_never_lose_opks() {
    proptest!(|(
        failure_rate in 0.0..0.9,
        seed in any::<u64>(),
        opk_count in 0usize..20,
        fetches in 1usize..40,
    )| {
        let inner = MemoryKeyStore::new();
        inner.store_bundle(&signed_registration("alice", opk_count)).unwrap();

        let store = ChaoticKeyStore::with_seed(inner.clone(), failure_rate, seed);
        let service = BundleService::new(store, Arc::new(MemoryAuditLogger::new()));
        let ctx = RequestContext::new();

        let mut handed_out = HashSet::new();
        for _ in 0..fetches {
            match service.get_bundle(&ctx, "alice") {
                Ok(bundle) => {
                    if let Some(opk_id) = bundle.opk_id {
                        prop_assert!(handed_out.insert(opk_id), "OPK handed out twice");
                    }
                },
                Err(ServiceError::Store { source: StorageError::Io(_), .. }) => {},
                Err(e) => prop_assert!(false, "unexpected fetch error: {e:?}"),
            }
        }

        // Every OPK is either still available or was returned to a caller
        let remaining = inner.count_available_opks("alice").unwrap();
        prop_assert_eq!(remaining + handed_out.len(), opk_count);
    });
}
