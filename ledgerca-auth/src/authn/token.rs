//! Per-request authentication token.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::cert::MAX_CERT_SIZE;
use crate::identity::{PrivateKey, Signature};

use super::error::AuthnError;

/// Magic preamble for signed payloads.
const AUTH_MAGIC: &[u8; 16] = b"LEDGERCA-AUTH-v1";

/// A caller certificate plus its signature over one request body.
///
/// Header form: `base64(cert DER) "." base64(signature)`. Tokens are never
/// stored; each request carries a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    cert_der: Vec<u8>,
    signature: Signature,
}

impl AuthToken {
    /// Sign `body` with the key bound by `cert_der`.
    ///
    /// # Errors
    ///
    /// Returns `AuthnError::MalformedToken` if the certificate exceeds the
    /// size limit.
    pub fn create(cert_der: &[u8], body: &[u8], key: &PrivateKey) -> Result<Self, AuthnError> {
        let payload = build_signed_payload(cert_der, body)?;
        Ok(Self {
            cert_der: cert_der.to_vec(),
            signature: key.sign(&payload),
        })
    }

    /// Parse an `Authorization` header value.
    ///
    /// # Errors
    ///
    /// Returns `AuthnError::MalformedToken` unless the value is exactly two
    /// base64 segments and the second decodes to a 64-byte signature.
    pub fn parse(header: &str) -> Result<Self, AuthnError> {
        let (cert_b64, sig_b64) = header
            .trim()
            .split_once('.')
            .ok_or(AuthnError::MalformedToken)?;
        if sig_b64.contains('.') {
            return Err(AuthnError::MalformedToken);
        }

        let cert_der = STANDARD
            .decode(cert_b64)
            .map_err(|_| AuthnError::MalformedToken)?;
        if cert_der.is_empty() || cert_der.len() > MAX_CERT_SIZE {
            return Err(AuthnError::MalformedToken);
        }
        let sig_bytes = STANDARD
            .decode(sig_b64)
            .map_err(|_| AuthnError::MalformedToken)?;
        let signature = Signature::from_bytes(&sig_bytes).map_err(|_| AuthnError::MalformedToken)?;

        Ok(Self {
            cert_der,
            signature,
        })
    }

    /// Render the token as an `Authorization` header value.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}.{}",
            STANDARD.encode(&self.cert_der),
            STANDARD.encode(self.signature.to_bytes())
        )
    }

    #[must_use]
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// Build the payload a token signature covers.
///
/// Wire format (all multi-byte integers are big-endian):
///
/// | Field     | Size | Description                   |
/// |-----------|------|-------------------------------|
/// | magic     | 16   | "LEDGERCA-AUTH-v1"            |
/// | cert_len  | 4    | Length of the certificate     |
/// | cert      | var  | Caller certificate, DER       |
/// | body_hash | 32   | SHA-256 of the request body   |
///
/// # Errors
///
/// Returns `AuthnError::MalformedToken` if the certificate exceeds 16KB.
pub fn build_signed_payload(cert_der: &[u8], body: &[u8]) -> Result<Vec<u8>, AuthnError> {
    if cert_der.len() > MAX_CERT_SIZE {
        return Err(AuthnError::MalformedToken);
    }

    let mut msg = Vec::with_capacity(AUTH_MAGIC.len() + 4 + cert_der.len() + 32);
    msg.extend_from_slice(AUTH_MAGIC);
    // Bounded by MAX_CERT_SIZE above
    msg.extend_from_slice(&(cert_der.len() as u32).to_be_bytes());
    msg.extend_from_slice(cert_der);
    msg.extend_from_slice(&Sha256::digest(body));
    Ok(msg)
}
