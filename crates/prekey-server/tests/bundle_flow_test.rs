//! End-to-end bundle flows through `BundleService`
//!
//! Uses real Ed25519 identity keys, so every registration and rotation goes
//! through signature verification exactly as in production.

use std::{fs, sync::Arc};

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use ed25519_dalek::{Signer, SigningKey};
use prekey_server::{
    AuditAction, AuditEvent, AuditStatus, BundleService, KeyStore, MemoryAuditLogger,
    MemoryKeyStore, MonitorConfig, OneTimePreKeyUpload, PrekeyServer, RegisterBundleRequest,
    RequestContext, ServerConfig, ServiceError, Step, StorageError,
};
use tempfile::tempdir;

/// A user's long-term identity key pair.
struct Identity {
    signing: SigningKey,
}

impl Identity {
    fn new(seed: u8) -> Self {
        Self { signing: SigningKey::from_bytes(&[seed; 32]) }
    }

    fn public_b64(&self) -> String {
        STANDARD.encode(self.signing.verifying_key().to_bytes())
    }

    /// Fresh SPK public key and this identity's signature over it.
    fn signed_prekey(&self, spk_seed: u8) -> (String, String) {
        let spk = SigningKey::from_bytes(&[spk_seed; 32]).verifying_key().to_bytes();
        let signature = self.signing.sign(&spk);
        (STANDARD.encode(spk), STANDARD.encode(signature.to_bytes()))
    }
}

fn opk(key_id: &str) -> OneTimePreKeyUpload {
    let public = SigningKey::from_bytes(&[key_id.len() as u8; 32]).verifying_key().to_bytes();
    OneTimePreKeyUpload::new(key_id, STANDARD.encode(public))
}

fn registration(user_id: &str, identity: &Identity, opk_ids: &[&str]) -> RegisterBundleRequest {
    let (signed_prekey, spk_signature) = identity.signed_prekey(100);
    RegisterBundleRequest {
        user_id: user_id.to_string(),
        identity_key: identity.public_b64(),
        signed_prekey,
        spk_signature,
        one_time_prekeys: opk_ids.iter().map(|id| opk(id)).collect(),
    }
}

fn service() -> (BundleService<MemoryKeyStore>, MemoryAuditLogger) {
    let audit = MemoryAuditLogger::new();
    (BundleService::new(MemoryKeyStore::new(), Arc::new(audit.clone())), audit)
}

fn events_for(audit: &MemoryAuditLogger, action: AuditAction) -> Vec<AuditEvent> {
    audit.events().into_iter().filter(|event| event.action == action).collect()
}

#[test]
fn single_opk_is_handed_out_once() {
    let (service, audit) = service();
    let ctx = RequestContext::new();
    let alice = Identity::new(1);
    let req = registration("alice", &alice, &["opk-1"]);

    service.store_bundle(&ctx, &req).unwrap();

    let first = service.get_bundle(&ctx, "alice").unwrap();
    assert_eq!(first.identity_key, req.identity_key);
    assert_eq!(first.signed_prekey, req.signed_prekey);
    assert_eq!(first.spk_signature, req.spk_signature);
    assert_eq!(first.opk_id.as_deref(), Some("opk-1"));
    assert_eq!(first.one_time_prekey, Some(req.one_time_prekeys[0].public_key.clone()));

    let second = service.get_bundle(&ctx, "alice").unwrap();
    assert_eq!(second.one_time_prekey, None);
    assert_eq!(second.opk_id, None);
    assert_eq!(second.identity_key, first.identity_key);

    let fetches = events_for(&audit, AuditAction::GetBundle);
    assert_eq!(fetches.len(), 2);
    assert_eq!(fetches[0].metadata["has_opk"], true);
    assert_eq!(fetches[1].metadata["has_opk"], false);
    assert!(fetches.iter().all(|event| event.status == AuditStatus::Success));
}

#[test]
fn bundle_without_opks_is_still_served() {
    let (service, _) = service();
    let ctx = RequestContext::new();

    service.store_bundle(&ctx, &registration("bob", &Identity::new(2), &[])).unwrap();

    let bundle = service.get_bundle(&ctx, "bob").unwrap();
    assert!(!bundle.has_opk());
    assert_eq!(bundle.opk_id, None);
}

#[test]
fn opks_are_consumed_oldest_first() {
    let (service, _) = service();
    let ctx = RequestContext::new();

    service.store_bundle(&ctx, &registration("alice", &Identity::new(1), &["a", "b"])).unwrap();
    service.refill_opks(&ctx, "alice", &[opk("c")]).unwrap();

    let ids: Vec<Option<String>> =
        (0..4).map(|_| service.get_bundle(&ctx, "alice").unwrap().opk_id).collect();
    assert_eq!(ids, vec![Some("a".into()), Some("b".into()), Some("c".into()), None]);
}

#[test]
fn signature_from_another_identity_is_rejected() {
    let (service, audit) = service();
    let ctx = RequestContext::new();
    let alice = Identity::new(1);
    let mallory = Identity::new(9);

    let mut req = registration("alice", &alice, &["opk-1"]);
    let (spk, signature) = mallory.signed_prekey(100);
    req.signed_prekey = spk;
    req.spk_signature = signature;

    let err = service.store_bundle(&ctx, &req).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidSignature { .. }));
    assert!(err.is_client_error());

    assert!(service.get_bundle(&ctx, "alice").unwrap_err().is_not_found());
    assert_eq!(service.count_available_opks(&ctx, "alice").unwrap(), 0);

    let registrations = events_for(&audit, AuditAction::RegisterBundle);
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].status, AuditStatus::Failure);
    assert_eq!(registrations[0].description, "Invalid SPK signature");
}

#[test]
fn malformed_identity_key_is_rejected() {
    let (service, _) = service();
    let mut req = registration("alice", &Identity::new(1), &[]);
    req.identity_key = "not base64 at all!".to_string();

    let err = service.store_bundle(&RequestContext::new(), &req).unwrap_err();
    let ServiceError::InvalidSignature { source, .. } = err else {
        panic!("expected InvalidSignature, got {err:?}");
    };
    assert!(!source.is_mismatch());
}

#[test]
fn url_safe_unpadded_keys_are_accepted() {
    let (service, _) = service();
    let ctx = RequestContext::new();
    let alice = Identity::new(3);

    let spk = SigningKey::from_bytes(&[77; 32]).verifying_key().to_bytes();
    let signature = alice.signing.sign(&spk).to_bytes();
    let req = RegisterBundleRequest {
        user_id: "alice".to_string(),
        identity_key: URL_SAFE_NO_PAD.encode(alice.signing.verifying_key().to_bytes()),
        signed_prekey: URL_SAFE_NO_PAD.encode(spk),
        spk_signature: URL_SAFE_NO_PAD.encode(signature),
        one_time_prekeys: vec![],
    };

    service.store_bundle(&ctx, &req).unwrap();

    // Keys come back exactly as uploaded
    let bundle = service.get_bundle(&ctx, "alice").unwrap();
    assert_eq!(bundle.signed_prekey, req.signed_prekey);
}

#[test]
fn rotation_with_bad_signature_keeps_current_spk() {
    let (service, audit) = service();
    let ctx = RequestContext::new();
    let alice = Identity::new(1);
    let req = registration("alice", &alice, &[]);
    service.store_bundle(&ctx, &req).unwrap();

    let (new_spk, _) = alice.signed_prekey(101);
    let (_, wrong_signature) = alice.signed_prekey(102);

    let err = service.rotate_spk(&ctx, "alice", &new_spk, &wrong_signature, None).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidSignature { .. }));

    let spk = service.store().get_signed_prekey("alice").unwrap();
    assert_eq!(spk.public_key, req.signed_prekey);
    assert_eq!(spk.signature, req.spk_signature);

    let rotations = events_for(&audit, AuditAction::RotateSpk);
    assert_eq!(rotations.len(), 1);
    assert_eq!(rotations[0].description, "Invalid SPK signature");
}

#[test]
fn rotation_replaces_spk_served_to_peers() {
    let (service, _) = service();
    let ctx = RequestContext::new();
    let alice = Identity::new(1);
    service.store_bundle(&ctx, &registration("alice", &alice, &[])).unwrap();

    let (new_spk, signature) = alice.signed_prekey(101);
    service.rotate_spk(&ctx, "alice", &new_spk, &signature, Some(4_102_444_800)).unwrap();

    let bundle = service.get_bundle(&ctx, "alice").unwrap();
    assert_eq!(bundle.signed_prekey, new_spk);
    assert_eq!(bundle.spk_signature, signature);
    assert_eq!(
        service.store().get_signed_prekey("alice").unwrap().expires_at_secs,
        Some(4_102_444_800)
    );
}

#[test]
fn reregistration_with_new_identity_key_conflicts() {
    let (service, audit) = service();
    let ctx = RequestContext::new();

    service.store_bundle(&ctx, &registration("alice", &Identity::new(1), &["a"])).unwrap();

    let err = service
        .store_bundle(&ctx, &registration("alice", &Identity::new(2), &["b"]))
        .unwrap_err();
    assert!(matches!(err.storage_error(), Some(StorageError::IdentityKeyConflict { .. })));
    assert_eq!(service.count_available_opks(&ctx, "alice").unwrap(), 1);

    let registrations = events_for(&audit, AuditAction::RegisterBundle);
    assert_eq!(registrations.len(), 2);
    assert_eq!(registrations[0].status, AuditStatus::Success);

    let rejected = &registrations[1];
    assert_eq!(rejected.status, AuditStatus::Failure);
    assert_eq!(rejected.description, "Failed to store bundle");
    assert_eq!(rejected.metadata["step"], "store_bundle");
    assert_eq!(rejected.target.id, "alice");
}

#[test]
fn reregistration_with_same_identity_key_adds_opks() {
    let (service, _) = service();
    let ctx = RequestContext::new();
    let alice = Identity::new(1);

    service.store_bundle(&ctx, &registration("alice", &alice, &["a"])).unwrap();
    service.store_bundle(&ctx, &registration("alice", &alice, &["b", "c"])).unwrap();

    assert_eq!(service.count_available_opks(&ctx, "alice").unwrap(), 3);
}

#[test]
fn duplicate_refill_is_rejected_whole() {
    let (service, _) = service();
    let ctx = RequestContext::new();
    service.store_bundle(&ctx, &registration("alice", &Identity::new(1), &["a"])).unwrap();

    let err = service.refill_opks(&ctx, "alice", &[opk("b"), opk("a")]).unwrap_err();
    assert_eq!(err.step(), Some(Step::InsertOpks));
    assert!(matches!(err.storage_error(), Some(StorageError::DuplicateKeyId { .. })));

    assert_eq!(service.count_available_opks(&ctx, "alice").unwrap(), 1);
}

#[test]
fn durable_server_keeps_consumed_state_across_restart() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        db_path: dir.path().join("prekeys.redb"),
        audit_log: Some(dir.path().join("audit.jsonl")),
        monitor: MonitorConfig::default(),
    };
    let ctx = RequestContext::new();
    let alice = Identity::new(1);

    {
        let server = PrekeyServer::open(&config).unwrap();
        let service = server.service();
        service.store_bundle(&ctx, &registration("alice", &alice, &["a", "b"])).unwrap();
        assert_eq!(service.get_bundle(&ctx, "alice").unwrap().opk_id.as_deref(), Some("a"));
    }

    let server = PrekeyServer::open(&config).unwrap();
    let service = server.service();
    assert_eq!(service.count_available_opks(&ctx, "alice").unwrap(), 1);
    assert_eq!(service.get_bundle(&ctx, "alice").unwrap().opk_id.as_deref(), Some("b"));

    let audit = fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    let events: Vec<AuditEvent> =
        audit.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
    let actions: Vec<AuditAction> = events.iter().map(|event| event.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::RegisterBundle,
            AuditAction::GetBundle,
            AuditAction::CountOpks,
            AuditAction::GetBundle,
        ]
    );
    assert!(events.iter().all(|event| event.service == "x3dh"));
}
