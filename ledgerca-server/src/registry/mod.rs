//! Identity and affiliation registry.
//!
//! One trait, two backends chosen at startup:
//! - [`SqlRegistry`] keeps identities, affiliations and counters in the
//!   relational store
//! - [`DirectoryRegistry`] asks a directory service who exists and checks
//!   secrets by binding, while affiliations and counters stay local

mod directory;
mod sql;

use async_trait::async_trait;
use ledgerca_core::{Identity, NewIdentity};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub use directory::{Directory, DirectoryEntry, DirectoryRegistry, LdapDirectory};
pub use sql::SqlRegistry;

#[cfg(test)]
pub(crate) use directory::test_support;

/// Errors from registry operations.
///
/// `NotFound` is kept apart from backend failures because bootstrap
/// decides idempotence on it.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("identity '{0}' not found")]
    NotFound(String),
    #[error("identity '{0}' is already registered")]
    DuplicateId(String),
    #[error("parent affiliation '{parent}' of '{path}' does not exist")]
    MissingParent { path: String, parent: String },
    #[error("affiliation '{0}' does not exist")]
    MissingAffiliation(String),
    #[error("invalid credentials for '{0}'")]
    InvalidCredentials(String),
    #[error("identity '{id}' has used all {cap} enrollments")]
    QuotaExceeded { id: String, cap: i64 },
    #[error("operation not supported by the {0} registry")]
    Unsupported(&'static str),
    #[error("corrupt record for '{0}'")]
    Corrupt(String),
    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("directory error: {0}")]
    Directory(String),
}

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Created,
    AlreadyPresent,
}

/// Identity and affiliation storage used by every other component.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Whether `insert_user` can ever succeed.
    fn supports_insert(&self) -> bool {
        true
    }

    /// Look up an identity, returning only the attributes named in
    /// `attr_names`.
    async fn get_user(&self, id: &str, attr_names: &[&str]) -> Result<Identity, RegistryError>;

    /// Insert a new identity. Its affiliation must exist.
    async fn insert_user(&self, identity: &NewIdentity) -> Result<(), RegistryError>;

    /// Insert an affiliation under `parent`. Idempotent.
    async fn insert_group(&self, path: &str, parent: &str) -> Result<Insertion, RegistryError>;

    async fn affiliation_exists(&self, path: &str) -> Result<bool, RegistryError>;

    /// Check a basic credential.
    async fn verify_secret(&self, id: &str, secret: &str) -> Result<Identity, RegistryError>;

    /// Atomically add one enrollment unless `cap` (non-zero) is reached.
    /// Returns the new count.
    async fn record_enrollment(&self, id: &str, cap: i64) -> Result<i64, RegistryError>;

    /// Undo a reservation whose certificate was never handed out.
    async fn release_enrollment(&self, id: &str) -> Result<(), RegistryError>;
}

/// Hash a secret for storage as `salt$hex(sha256(salt || secret))`.
pub(crate) fn hash_secret(secret: &str) -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    format!("{}${}", hex::encode(salt), digest(&salt, secret))
}

/// Compare a secret against a stored hash in constant time.
pub(crate) fn secret_matches(stored: &str, secret: &str) -> bool {
    let Some((salt_hex, expected)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    digest(&salt, secret)
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into()
}

fn digest(salt: &[u8], secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a random enrollment secret for identities registered without one.
pub(crate) fn generate_secret() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
