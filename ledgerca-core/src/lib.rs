//! # LedgerCA Core
//!
//! Pure domain types and policy for the LedgerCA certificate authority.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! Everything here is a plain struct, enum or function. Persistence, signing
//! and the HTTP surface live in `ledgerca-server`.
//!
//! ## Modules
//!
//! - [`identity`] - Identity records, attribute names and registrar/revoker checks
//! - [`affiliation`] - Dotted affiliation paths and the bootstrap tree
//! - [`quota`] - Enrollment quota resolution and enforcement
//! - [`certificate`] - Issued-certificate records and revocation reasons
//! - [`audit`] - Audit events for issuance and registration

pub mod affiliation;
pub mod audit;
pub mod certificate;
pub mod identity;
pub mod quota;

pub use affiliation::{AffiliationEntry, AffiliationNode};
pub use audit::{AuditAction, AuditEvent, AuditTarget};
pub use certificate::{CertStatus, CertificateRecord, RevocationReason};
pub use identity::{Attributes, AuthzDecision, Identity, NewIdentity};
pub use quota::{check_enrollment, resolve_max_enrollments, QuotaError};
