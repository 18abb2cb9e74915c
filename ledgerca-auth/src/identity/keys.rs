//! Ed25519 key types used for CA and enrollment identities.
//!
//! - Private keys are zeroized on drop and never implement `Debug`
//! - PKCS#8 exports are wrapped in [`SecretBytes`]
//! - Key identifiers compare in constant time

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors that can occur during key operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The provided bytes have an invalid length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The provided bytes do not represent a valid key.
    #[error("invalid key format")]
    InvalidFormat,
}

/// A zeroize-on-drop wrapper for secret bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for SecretBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::Deref for SecretBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A private Ed25519 signing key.
///
/// Used by enrolled clients to sign request tokens and, through its PKCS#8
/// form, by the CA key-material bootstrap.
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generate a new random private key.
    #[must_use]
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Export the private key as PKCS#8 DER (the form rcgen and rustls accept).
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidFormat` if encoding fails.
    pub fn to_pkcs8_der(&self) -> Result<SecretBytes, KeyError> {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        let doc = self
            .0
            .to_pkcs8_der()
            .map_err(|_| KeyError::InvalidFormat)?;
        Ok(SecretBytes(doc.as_bytes().to_vec()))
    }
}

// Explicitly NO Debug implementation for PrivateKey

/// A public Ed25519 verification key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Load a public key from raw bytes, e.g. a certificate's
    /// `subjectPublicKey` bit string.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 32 bytes.
    /// Returns `KeyError::InvalidFormat` if the bytes don't represent a valid point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        let key =
            ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(key))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Verify a signature over a message.
    ///
    /// Uses `verify_strict` to reject weak/small-order keys.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(message, &signature.0).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", Fingerprint::from_public_key(self))
    }
}

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Load a signature from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 64,
            actual: bytes.len(),
        })?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_bytes();
        write!(
            f,
            "Signature({:02x}{:02x}{:02x}{:02x}...)",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }
}

/// A SHA-256 fingerprint of a public key, `SHA256:{base64url_no_padding}`.
///
/// Logged at startup so operators can pin the CA identity.
#[derive(Clone, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::derived_hash_with_manual_eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const PREFIX: &'static str = "SHA256:";

    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = Sha256::digest(public_key.to_bytes());
        Self(format!("{}{}", Self::PREFIX, URL_SAFE_NO_PAD.encode(hash)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_and_signing() {
        let private_key = PrivateKey::generate();
        let public_key = private_key.public_key();

        let signature = private_key.sign(b"enroll alice");

        assert!(public_key.verify(b"enroll alice", &signature));
        assert!(!public_key.verify(b"enroll mallory", &signature));
    }

    #[test]
    fn test_signature_wrong_key_rejected() {
        let key1 = PrivateKey::generate();
        let key2 = PrivateKey::generate();

        let signature = key1.sign(b"register bob");

        assert!(!key2.public_key().verify(b"register bob", &signature));
    }

    #[test]
    fn test_fingerprint_format_and_determinism() {
        let public_key = PrivateKey::generate().public_key();

        let fp1 = Fingerprint::from_public_key(&public_key);
        let fp2 = Fingerprint::from_public_key(&public_key);

        assert!(fp1.as_str().starts_with("SHA256:"));
        // 7 (prefix) + 43 (base64 of 32 bytes, no padding)
        assert_eq!(fp1.as_str().len(), 50);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(PublicKey::from_bytes(&[0u8; 16]).is_err());
        assert!(Signature::from_bytes(&[0u8; 32]).is_err());
        assert!(PublicKey::from_bytes(&[0u8; 64]).is_err());
        assert!(Signature::from_bytes(&[0u8; 128]).is_err());
    }
}
