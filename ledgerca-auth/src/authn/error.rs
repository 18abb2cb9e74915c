//! Authentication error types.

use crate::cert::CertError;

/// Errors that can occur during request authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthnError {
    /// The signature does not cover this certificate and body.
    #[error("invalid signature")]
    InvalidSignature,

    /// The token header is not `base64(cert).base64(signature)`.
    #[error("malformed token")]
    MalformedToken,

    /// The basic credential header could not be decoded.
    #[error("malformed basic credentials")]
    MalformedCredentials,

    /// The presented certificate does not chain to the CA.
    #[error("untrusted certificate: {0}")]
    UntrustedCertificate(#[from] CertError),

    /// The certificate carries a key that cannot verify Ed25519 signatures.
    #[error("certificate key is not Ed25519")]
    UnsupportedKey,
}
