//! Audit trail for key bundle operations.
//!
//! Every protocol operation emits one [`AuditEvent`] through an
//! [`AuditLogger`]. Logging is fire-and-forget: callers never fail an
//! operation because its audit event could not be written.

#![allow(clippy::disallowed_types, reason = "Synchronous sink access only")]

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Service name stamped on every event
pub const AUDIT_SERVICE: &str = "x3dh";

/// Target type stamped on every event
pub const AUDIT_TARGET_TYPE: &str = "key_bundle";

/// Protocol operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Initial bundle registration
    RegisterBundle,
    /// Bundle fetch by a peer
    GetBundle,
    /// OPK batch upload
    RefillOpks,
    /// Signed prekey replacement
    RotateSpk,
    /// OPK supply query
    CountOpks,
}

impl AuditAction {
    /// Wire name, e.g. `GET_BUNDLE`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterBundle => "REGISTER_BUNDLE",
            Self::GetBundle => "GET_BUNDLE",
            Self::RefillOpks => "REFILL_OPKS",
            Self::RotateSpk => "ROTATE_SPK",
            Self::CountOpks => "COUNT_OPKS",
        }
    }
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Operation completed
    Success,
    /// Operation failed
    Failure,
}

impl AuditStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Who performed the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    /// Actor identifier
    pub id: String,
    /// Actor role
    pub role: String,
    /// Client user agent, empty if unknown
    pub user_agent: String,
}

/// What the operation acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTarget {
    /// Always [`AUDIT_TARGET_TYPE`]
    #[serde(rename = "type")]
    pub kind: String,
    /// Owner of the key bundle
    pub id: String,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Operation
    pub action: AuditAction,
    /// Always [`AUDIT_SERVICE`]
    pub service: String,
    /// Outcome
    pub status: AuditStatus,
    /// Human-readable summary
    pub description: String,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Caller
    pub actor: AuditActor,
    /// Affected key bundle
    pub target: AuditTarget,
    /// Operation-specific details (`has_opk`, `num_opks`, `step`, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AuditEvent {
    /// Event about `user_id`'s key bundle, acted on by that same user.
    pub fn new(
        action: AuditAction,
        status: AuditStatus,
        description: impl Into<String>,
        user_id: &str,
        timestamp: u64,
    ) -> Self {
        Self {
            action,
            service: AUDIT_SERVICE.to_string(),
            status,
            description: description.into(),
            timestamp,
            actor: AuditActor {
                id: user_id.to_string(),
                role: crate::context::DEFAULT_ACTOR_ROLE.to_string(),
                user_agent: String::new(),
            },
            target: AuditTarget { kind: AUDIT_TARGET_TYPE.to_string(), id: user_id.to_string() },
            metadata: Map::new(),
        }
    }

    /// Replace the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: AuditActor) -> Self {
        self.actor = actor;
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Errors writing an audit event
#[derive(Error, Debug)]
pub enum AuditError {
    /// Sink I/O failed
    #[error("audit sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event could not be encoded
    #[error("audit event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Sink lock poisoned by a panicking writer
    #[error("audit sink lock poisoned")]
    Poisoned,
}

/// Destination for audit events.
pub trait AuditLogger: Send + Sync {
    /// Record one event.
    ///
    /// # Errors
    ///
    /// Returns `AuditError` if the sink could not record the event. Callers
    /// treat this as non-fatal.
    fn log(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Emits audit events as structured `tracing` events on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let metadata = serde_json::to_string(&event.metadata)?;

        tracing::info!(
            target: "audit",
            action = event.action.as_str(),
            status = event.status.as_str(),
            user_id = %event.target.id,
            actor = %event.actor.id,
            timestamp = event.timestamp,
            metadata = %metadata,
            "{}",
            event.description
        );

        Ok(())
    }
}

/// Appends one JSON document per event to a file.
pub struct JsonLinesAuditLogger {
    file: Mutex<File>,
}

impl JsonLinesAuditLogger {
    /// Open `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Io` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl AuditLogger for JsonLinesAuditLogger {
    fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        // One write per line so concurrent writers never interleave
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().map_err(|_| AuditError::Poisoned)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// Keeps events in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditLogger {
    /// Empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded event, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|events| events.iter().cloned().collect()).unwrap_or_default()
    }

    /// Most recent event, if any.
    pub fn last(&self) -> Option<AuditEvent> {
        self.events.lock().ok().and_then(|events| events.last().cloned())
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().map_err(|_| AuditError::Poisoned)?.push(event.clone());
        Ok(())
    }
}
