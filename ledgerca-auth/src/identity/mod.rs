//! Cryptographic identity types.
//!
//! Enrollment certificates issued by the CA bind an identity id to an
//! Ed25519 public key. The matching [`PrivateKey`] signs per-request tokens;
//! the server checks them with the [`PublicKey`] recovered from the
//! certificate.
//!
//! ```
//! use ledgerca_auth::identity::PrivateKey;
//!
//! let private_key = PrivateKey::generate();
//! let signature = private_key.sign(b"payload");
//! assert!(private_key.public_key().verify(b"payload", &signature));
//! ```

mod keys;

pub use keys::{Fingerprint, KeyError, PrivateKey, PublicKey, SecretBytes, Signature};
