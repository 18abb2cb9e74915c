//! Audit trail.
//!
//! Events are written as JSON through `tracing` under the `audit` target so
//! they can be routed separately from operational logs.

use ledgerca_core::{AuditAction, AuditEvent, AuditTarget};

pub const TARGET: &str = "audit";

/// Emit one audit event.
pub fn record(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!(target: TARGET, action = ?event.action, "{json}"),
        Err(e) => tracing::warn!(error = %e, action = ?event.action, "Failed to encode audit event"),
    }
}

/// Shorthand for the common actor/action/target case.
pub fn emit(actor: Option<&str>, action: AuditAction, target: AuditTarget) {
    record(&AuditEvent::new(actor.map(str::to_string), action, target));
}

pub fn certificate(serial: &str, aki: &str) -> AuditTarget {
    AuditTarget::Certificate {
        serial: serial.to_string(),
        aki: aki.to_string(),
    }
}
