//! Audit event types for registration, issuance and revocation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action being audited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Registry
    /// An identity was registered through the API.
    IdentityRegistered,
    /// An identity was loaded from bootstrap configuration.
    IdentityBootstrapped,

    // Issuance
    /// An enrollment certificate was issued.
    CertificateIssued,
    /// A certificate was re-issued to an enrolled caller.
    CertificateReenrolled,
    /// A transaction certificate was issued.
    TcertIssued,
    /// A certificate was signed but could not be recorded and was withheld.
    IssuanceWithheld,
    /// A certificate was revoked.
    CertificateRevoked,

    // Authorization
    /// A request failed authentication.
    AuthnRejected,
    /// An authenticated caller was denied.
    AuthzDenied,
}

/// Target of an audit action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum AuditTarget {
    /// Action targeted an identity.
    Identity(String),
    /// Action targeted a certificate, by serial and AKI.
    Certificate { serial: String, aki: String },
    /// Action targeted an API endpoint.
    Endpoint(String),
}

/// An audit event recording an action in the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub ts: DateTime<Utc>,

    /// Identity that performed the action (None for system-initiated).
    pub actor: Option<String>,

    /// What action was performed.
    pub action: AuditAction,

    /// What the action targeted.
    pub target: AuditTarget,

    /// Additional contextual information.
    /// Using BTreeMap for deterministic serialization order.
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Create a new audit event with the current timestamp.
    pub fn new(actor: Option<String>, action: AuditAction, target: AuditTarget) -> Self {
        Self::with_timestamp(Utc::now(), actor, action, target)
    }

    /// Create a new audit event with specific timestamp.
    pub fn with_timestamp(
        ts: DateTime<Utc>,
        actor: Option<String>,
        action: AuditAction,
        target: AuditTarget,
    ) -> Self {
        Self {
            ts,
            actor,
            action,
            target,
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the event (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
