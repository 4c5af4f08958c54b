//! Bundle service: the public X3DH key distribution operations.
//!
//! Combines a [`KeyStore`] with a [`PreKeyVerifier`] and reports every call to
//! an [`AuditLogger`]. The service holds no key material of its own; all
//! state lives in the store, so one instance can be shared freely across
//! threads and calls can run concurrently.
//!
//! # Operations
//!
//! | operation | store steps | audit action |
//! |---|---|---|
//! | [`BundleService::store_bundle`] | verify, store_bundle | `REGISTER_BUNDLE` |
//! | [`BundleService::get_bundle`] | identity_key, signed_prekey, one_time_prekey | `GET_BUNDLE` |
//! | [`BundleService::refill_opks`] | insert_opks | `REFILL_OPKS` |
//! | [`BundleService::rotate_spk`] | identity_key, verify, rotate_signed_prekey | `ROTATE_SPK` |
//! | [`BundleService::count_available_opks`] | count_opks | `COUNT_OPKS` |
//!
//! Before each store step the caller's [`RequestContext`] deadline is checked
//! against the environment clock; a passed deadline fails the call with
//! [`ServiceError::DeadlineExceeded`] without starting the step.

use std::sync::Arc;

use prekey_crypto::{Ed25519Verifier, PreKeyVerifier};

use crate::{
    audit::{AuditAction, AuditActor, AuditEvent, AuditLogger, AuditStatus},
    context::RequestContext,
    env::{Environment, SystemEnv},
    error::{Operation, ServiceError, Step},
    storage::{KeyStore, StorageError},
    types::{BundleResponse, OneTimePreKeyUpload, RegisterBundleRequest},
};

/// X3DH bundle operations over a key store.
///
/// Generic over the store, the clock and the signature verifier so each can
/// be swapped in tests. Clone is cheap when the store is.
#[derive(Clone)]
pub struct BundleService<S, E = SystemEnv, V = Ed25519Verifier>
where
    S: KeyStore,
    E: Environment,
    V: PreKeyVerifier,
{
    store: S,
    env: E,
    verifier: V,
    auditor: Arc<dyn AuditLogger>,
}

impl<S: KeyStore> BundleService<S> {
    /// Service using the system clock and Ed25519 verification.
    pub fn new(store: S, auditor: Arc<dyn AuditLogger>) -> Self {
        Self::with_parts(store, SystemEnv::new(), Ed25519Verifier, auditor)
    }
}

impl<S, E, V> BundleService<S, E, V>
where
    S: KeyStore,
    E: Environment,
    V: PreKeyVerifier,
{
    /// Service from explicit parts.
    pub fn with_parts(store: S, env: E, verifier: V, auditor: Arc<dyn AuditLogger>) -> Self {
        Self { store, env, verifier, auditor }
    }

    /// Underlying key store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a user's identity key, signed prekey and initial OPKs.
    ///
    /// The SPK signature is checked first; an invalid signature is rejected
    /// without touching the store.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the SPK was not signed by the identity key
    /// - `Store` with `IdentityKeyConflict`, `EmptyKeyId` or `DuplicateKeyId`
    ///   for rejected registrations, or a backend failure
    /// - `DeadlineExceeded` if the caller's deadline passed
    pub fn store_bundle(
        &self,
        ctx: &RequestContext,
        req: &RegisterBundleRequest,
    ) -> Result<(), ServiceError> {
        let op = Operation::StoreBundle;
        let user_id = req.user_id.as_str();
        let num_opks = req.one_time_prekeys.len();

        if let Err(source) = self.verifier.verify_signed_prekey(
            &req.identity_key,
            &req.signed_prekey,
            &req.spk_signature,
        ) {
            self.emit(
                &self.event(
                    ctx,
                    user_id,
                    AuditAction::RegisterBundle,
                    AuditStatus::Failure,
                    "Invalid SPK signature",
                )
                .with_metadata("reason", source.to_string()),
            );
            let err = ServiceError::InvalidSignature { op, source };
            report_failure(user_id, &err);
            return Err(err);
        }

        match self.run_step(ctx, op, Step::StoreBundle, |store| store.store_bundle(req)) {
            Ok(()) => {
                tracing::info!(user_id, num_opks, "registered key bundle");
                self.emit(
                    &self.event(
                        ctx,
                        user_id,
                        AuditAction::RegisterBundle,
                        AuditStatus::Success,
                        "Stored X3DH bundle",
                    )
                    .with_metadata("num_opks", num_opks),
                );
                Ok(())
            },
            Err(err) => {
                report_failure(user_id, &err);
                self.emit(
                    &self.event(
                        ctx,
                        user_id,
                        AuditAction::RegisterBundle,
                        AuditStatus::Failure,
                        "Failed to store bundle",
                    )
                    .with_metadata("num_opks", num_opks)
                    .with_step(&err),
                );
                Err(err)
            },
        }
    }

    /// Build the bundle a peer needs to start a session with `user_id`.
    ///
    /// Consumes the user's oldest unused OPK. Once the supply is exhausted
    /// the bundle is returned without one. An expired SPK is still served.
    ///
    /// # Errors
    ///
    /// - `Store` naming the failing step (`identity_key`, `signed_prekey` or
    ///   `one_time_prekey`). An unregistered user fails at `identity_key`
    ///   with `NotFound`.
    /// - `DeadlineExceeded` if the caller's deadline passed
    pub fn get_bundle(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<BundleResponse, ServiceError> {
        match self.fetch_bundle(ctx, user_id) {
            Ok((bundle, spk_expired)) => {
                tracing::debug!(user_id, has_opk = bundle.has_opk(), "served key bundle");
                self.emit(
                    &self.event(
                        ctx,
                        user_id,
                        AuditAction::GetBundle,
                        AuditStatus::Success,
                        "Fetched X3DH bundle",
                    )
                    .with_metadata("has_opk", bundle.has_opk())
                    .with_metadata("spk_expired", spk_expired),
                );
                Ok(bundle)
            },
            Err(err) => {
                report_failure(user_id, &err);
                let description = match err.step() {
                    Some(Step::IdentityKey) => "Failed to fetch IK",
                    Some(Step::SignedPreKey) => "Failed to fetch SPK",
                    _ => "Failed to consume OPK",
                };
                self.emit(
                    &self.event(
                        ctx,
                        user_id,
                        AuditAction::GetBundle,
                        AuditStatus::Failure,
                        description,
                    )
                    .with_metadata("has_opk", false)
                    .with_step(&err),
                );
                Err(err)
            },
        }
    }

    fn fetch_bundle(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<(BundleResponse, bool), ServiceError> {
        let op = Operation::GetBundle;

        let identity_key =
            self.run_step(ctx, op, Step::IdentityKey, |store| store.get_identity_key(user_id))?;
        let spk =
            self.run_step(ctx, op, Step::SignedPreKey, |store| store.get_signed_prekey(user_id))?;

        let opk = match self.run_step(ctx, op, Step::OneTimePreKey, |store| {
            store.consume_one_time_prekey(user_id)
        }) {
            Ok(opk) => Some(opk),
            Err(ServiceError::Store { source: StorageError::NoOpksAvailable { .. }, .. }) => {
                tracing::debug!(user_id, "no one-time prekeys left, serving bundle without OPK");
                None
            },
            Err(err) => return Err(err),
        };

        let spk_expired = spk.is_expired(self.env.wall_clock_secs());
        if spk_expired {
            tracing::warn!(
                user_id,
                expires_at = spk.expires_at_secs,
                "serving expired signed prekey"
            );
        }

        let (one_time_prekey, opk_id) = match opk {
            Some(opk) => (Some(opk.public_key), Some(opk.key_id)),
            None => (None, None),
        };

        let bundle = BundleResponse {
            identity_key: identity_key.public_key,
            signed_prekey: spk.public_key,
            spk_signature: spk.signature,
            one_time_prekey,
            opk_id,
        };

        Ok((bundle, spk_expired))
    }

    /// Add one-time prekeys to the user's supply.
    ///
    /// All-or-nothing. Users are not required to have registered first.
    ///
    /// # Errors
    ///
    /// - `Store` with `EmptyKeyId` or `DuplicateKeyId` for a rejected batch,
    ///   or a backend failure
    /// - `DeadlineExceeded` if the caller's deadline passed
    pub fn refill_opks(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        opks: &[OneTimePreKeyUpload],
    ) -> Result<(), ServiceError> {
        let result = self
            .run_step(ctx, Operation::RefillOpks, Step::InsertOpks, |store| {
                store.insert_opks(user_id, opks)
            });

        let event = match &result {
            Ok(()) => {
                tracing::info!(user_id, num_opks = opks.len(), "refilled one-time prekeys");
                self.event(
                    ctx,
                    user_id,
                    AuditAction::RefillOpks,
                    AuditStatus::Success,
                    "Refilled OPKs",
                )
            },
            Err(err) => {
                report_failure(user_id, err);
                self.event(
                    ctx,
                    user_id,
                    AuditAction::RefillOpks,
                    AuditStatus::Failure,
                    "Failed to refill OPKs",
                )
                .with_step(err)
            },
        };
        self.emit(&event.with_metadata("num_opks", opks.len()));

        result
    }

    /// Replace the user's signed prekey.
    ///
    /// The new SPK must be signed by the user's registered identity key.
    ///
    /// # Errors
    ///
    /// - `Store` at `identity_key` if the user is unknown or the lookup failed
    /// - `InvalidSignature` if the new SPK does not verify; the current SPK
    ///   stays in place
    /// - `Store` at `rotate_signed_prekey` if the write failed
    /// - `DeadlineExceeded` if the caller's deadline passed
    pub fn rotate_spk(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        new_spk: &str,
        signature: &str,
        expires_at: Option<u64>,
    ) -> Result<(), ServiceError> {
        let op = Operation::RotateSpk;

        let identity_key =
            match self.run_step(ctx, op, Step::IdentityKey, |store| store.get_identity_key(user_id))
            {
                Ok(identity_key) => identity_key,
                Err(err) => {
                    report_failure(user_id, &err);
                    let description = if err.is_not_found() {
                        "Identity key missing"
                    } else {
                        "Failed to fetch IK"
                    };
                    self.emit(
                        &self.event(
                            ctx,
                            user_id,
                            AuditAction::RotateSpk,
                            AuditStatus::Failure,
                            description,
                        )
                        .with_step(&err),
                    );
                    return Err(err);
                },
            };

        if let Err(source) =
            self.verifier.verify_signed_prekey(&identity_key.public_key, new_spk, signature)
        {
            self.emit(
                &self.event(
                    ctx,
                    user_id,
                    AuditAction::RotateSpk,
                    AuditStatus::Failure,
                    "Invalid SPK signature",
                )
                .with_metadata("reason", source.to_string()),
            );
            let err = ServiceError::InvalidSignature { op, source };
            report_failure(user_id, &err);
            return Err(err);
        }

        let result = self.run_step(ctx, op, Step::RotateSignedPreKey, |store| {
            store.rotate_signed_prekey(user_id, new_spk, signature, expires_at)
        });

        let event = match &result {
            Ok(()) => {
                tracing::info!(user_id, expires_at, "rotated signed prekey");
                self.event(
                    ctx,
                    user_id,
                    AuditAction::RotateSpk,
                    AuditStatus::Success,
                    "Rotated SPK",
                )
            },
            Err(err) => {
                report_failure(user_id, err);
                self.event(
                    ctx,
                    user_id,
                    AuditAction::RotateSpk,
                    AuditStatus::Failure,
                    "Failed to store rotated SPK",
                )
                .with_step(err)
            },
        };
        let event = match expires_at {
            Some(expires_at) => event.with_metadata("expires_at", expires_at),
            None => event,
        };
        self.emit(&event);

        result
    }

    /// Number of unused one-time prekeys the user has left.
    ///
    /// Zero for unknown users.
    ///
    /// # Errors
    ///
    /// - `Store` at `count_opks` on a backend failure
    /// - `DeadlineExceeded` if the caller's deadline passed
    pub fn count_available_opks(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<usize, ServiceError> {
        let result = self.run_step(ctx, Operation::CountOpks, Step::CountOpks, |store| {
            store.count_available_opks(user_id)
        });

        let event = match &result {
            Ok(count) => self
                .event(
                    ctx,
                    user_id,
                    AuditAction::CountOpks,
                    AuditStatus::Success,
                    "Counted available OPKs",
                )
                .with_metadata("available_opks", *count),
            Err(err) => {
                report_failure(user_id, err);
                self.event(
                    ctx,
                    user_id,
                    AuditAction::CountOpks,
                    AuditStatus::Failure,
                    "Failed to count OPKs",
                )
                .with_step(err)
            },
        };
        self.emit(&event);

        result
    }

    /// Check the deadline, then run one store step.
    fn run_step<T>(
        &self,
        ctx: &RequestContext,
        op: Operation,
        step: Step,
        f: impl FnOnce(&S) -> Result<T, StorageError>,
    ) -> Result<T, ServiceError> {
        if ctx.is_expired(self.env.wall_clock_secs()) {
            return Err(ServiceError::DeadlineExceeded { op, step });
        }
        f(&self.store).map_err(|source| ServiceError::Store { op, step, source })
    }

    fn event(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        action: AuditAction,
        status: AuditStatus,
        description: &str,
    ) -> AuditEvent {
        AuditEvent::new(action, status, description, user_id, self.env.wall_clock_secs())
            .with_actor(AuditActor {
                id: ctx.actor_id_or(user_id).to_string(),
                role: ctx.actor_role().to_string(),
                user_agent: ctx.user_agent.clone().unwrap_or_default(),
            })
    }

    /// Hand an event to the audit logger. Failures are dropped.
    fn emit(&self, event: &AuditEvent) {
        if let Err(err) = self.auditor.log(event) {
            tracing::debug!(
                action = event.action.as_str(),
                error = %err,
                "dropping audit event"
            );
        }
    }
}

/// Log a failed operation: caller mistakes at debug, backend trouble at warn.
fn report_failure(user_id: &str, err: &ServiceError) {
    if err.is_client_error() {
        tracing::debug!(user_id, op = %err.operation(), error = %err, "request rejected");
    } else {
        tracing::warn!(user_id, op = %err.operation(), error = %err, "operation failed");
    }
}

trait WithStep {
    #[must_use]
    fn with_step(self, err: &ServiceError) -> Self;
}

impl WithStep for AuditEvent {
    /// Record the failing store step, if there was one.
    fn with_step(self, err: &ServiceError) -> Self {
        match err.step() {
            Some(step) => self.with_metadata("step", step.as_str()),
            None => self,
        }
    }
}
