//! X3DH prekey bundle server.
//!
//! Stores and hands out the public key material peers need to bootstrap an
//! end-to-end encrypted session: a long-term identity key, a signed prekey
//! and a supply of one-time prekeys per user.
//!
//! # Architecture
//!
//! ```text
//!             ┌──────────────────┐      ┌──────────────────┐
//!  callers ──►│  BundleService   │─────►│   AuditLogger    │
//!             └──┬────────────┬──┘      └──────────────────┘
//!                │            │
//!                ▼            ▼
//!      ┌──────────────┐  ┌──────────────┐
//!      │   KeyStore   │  │ PreKeyVerif. │
//!      └──────▲───────┘  └──────────────┘
//!             │
//!      ┌──────┴───────┐      ┌──────────────┐
//!      │  OpkMonitor  │─────►│  AlertSink   │
//!      └──────────────┘      └──────────────┘
//! ```
//!
//! # Components
//!
//! - [`BundleService`]: register, fetch, refill, rotate and count
//! - [`KeyStore`]: persistence trait with [`MemoryKeyStore`],
//!   [`RedbKeyStore`] and the fault-injecting [`ChaoticKeyStore`]
//! - [`OpkMonitor`]: background scan for users running out of OPKs
//! - [`AuditLogger`]: fire-and-forget audit trail
//! - [`PrekeyServer`]: wiring used by the `prekey-server` binary

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod audit;
mod context;
mod env;
mod error;
mod monitor;
mod service;
pub mod storage;
mod types;

use std::{path::PathBuf, sync::Arc};

pub use audit::{
    AUDIT_SERVICE, AUDIT_TARGET_TYPE, AuditAction, AuditActor, AuditError, AuditEvent,
    AuditLogger, AuditStatus, AuditTarget, JsonLinesAuditLogger, MemoryAuditLogger,
    TracingAuditLogger,
};
pub use context::{DEFAULT_ACTOR_ROLE, RequestContext};
pub use env::{Environment, ManualEnv, SystemEnv};
pub use error::{Operation, ServerError, ServiceError, Step};
pub use monitor::{
    AlertSink, DEFAULT_INTERVAL, DEFAULT_THRESHOLD, LowUser, MonitorConfig, MonitorError,
    MonitorHandle, MonitorState, OpkMonitor, TickReport, TracingAlertSink,
};
pub use service::BundleService;
pub use storage::{
    ChaoticKeyStore, KeyStore, MemoryKeyStore, RecordKind, RedbKeyStore, StorageError,
};
pub use types::{
    BundleResponse, IdentityKey, OneTimePreKey, OneTimePreKeyUpload, RefillOpkRequest,
    RegisterBundleRequest, RotateSpkRequest, SignedPreKey,
};

/// Configuration for a durable server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Redb database file
    pub db_path: PathBuf,
    /// JSON-lines audit file. Audit events go to `tracing` when unset.
    pub audit_log: Option<PathBuf>,
    /// OPK monitor settings
    pub monitor: MonitorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("prekeys.redb"),
            audit_log: None,
            monitor: MonitorConfig::default(),
        }
    }
}

/// Bundle service over a Redb key store, plus monitor wiring.
pub struct PrekeyServer {
    service: BundleService<RedbKeyStore>,
}

impl PrekeyServer {
    /// Open the key store and audit sink named by `config`.
    ///
    /// # Errors
    ///
    /// - `Storage` if the database cannot be opened or created
    /// - `Audit` if the audit file cannot be opened
    pub fn open(config: &ServerConfig) -> Result<Self, ServerError> {
        let store = RedbKeyStore::open(&config.db_path)?;

        let auditor: Arc<dyn AuditLogger> = match &config.audit_log {
            Some(path) => Arc::new(JsonLinesAuditLogger::open(path)?),
            None => Arc::new(TracingAuditLogger),
        };

        tracing::debug!(
            db = %config.db_path.display(),
            audit_file = config.audit_log.is_some(),
            "opened prekey server"
        );

        Ok(Self { service: BundleService::new(store, auditor) })
    }

    /// Bundle service backed by the opened store.
    pub fn service(&self) -> &BundleService<RedbKeyStore> {
        &self.service
    }

    /// New, not yet started OPK monitor over the database named by `config`.
    ///
    /// The monitor opens the database only while it scans, so a server can
    /// open the same file between ticks.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the database cannot be opened or created.
    pub fn monitor(config: &ServerConfig) -> Result<OpkMonitor<RedbKeyStore>, ServerError> {
        let store = RedbKeyStore::detached(config.db_path.clone())?;
        Ok(OpkMonitor::new(store, config.monitor))
    }
}
