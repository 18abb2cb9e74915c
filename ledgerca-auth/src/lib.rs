//! Pure authentication library for LedgerCA.
//!
//! This crate is intentionally IO-free:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! The server supplies the trust anchor (its CA certificate) and the raw
//! request body; everything that needs storage, such as the certificate
//! status lookup, happens in the server after [`authn::verify_token`]
//! succeeds.
//!
//! # Example
//!
//! ```ignore
//! use ledgerca_auth::{authn::*, cert::TrustAnchor, identity::PrivateKey};
//!
//! // Client signs the body with the key its enrollment certificate binds
//! let token = AuthToken::create(&cert_der, body, &private_key)?;
//! let header = token.encode();
//!
//! // Server checks chain and signature against the same body
//! let caller = verify_token(&AuthToken::parse(&header)?, body, &anchor, now)?;
//! ```

pub mod authn;
pub mod cert;
pub mod identity;

pub use authn::{verify_token, AuthToken, AuthnError, BasicCredentials, VerifiedCaller};
pub use cert::{decode_certificate, inspect, CertError, CertId, CertInfo, TrustAnchor};
pub use identity::{Fingerprint, KeyError, PrivateKey, PublicKey, Signature};
