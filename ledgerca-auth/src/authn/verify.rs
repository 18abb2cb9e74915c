//! Token verification.

use crate::cert::{CertId, TrustAnchor};
use crate::identity::PublicKey;

use super::error::AuthnError;
use super::token::{build_signed_payload, AuthToken};

/// Result of successful token verification.
///
/// This proves only that the certificate chains to the CA and that its key
/// signed the body. The server still has to check the certificate record
/// and the owning identity before trusting the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCaller {
    enrollment_id: String,
    cert_id: CertId,
    public_key: PublicKey,
}

impl VerifiedCaller {
    /// Crate-private so a `VerifiedCaller` can only come out of
    /// [`verify_token`].
    #[must_use]
    pub(crate) fn new(enrollment_id: String, cert_id: CertId, public_key: PublicKey) -> Self {
        Self {
            enrollment_id,
            cert_id,
            public_key,
        }
    }

    /// The identity id, taken from the certificate's common name.
    #[must_use]
    pub fn enrollment_id(&self) -> &str {
        &self.enrollment_id
    }

    #[must_use]
    pub fn cert_id(&self) -> &CertId {
        &self.cert_id
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// Verify a token against the request body it arrived with.
///
/// # Errors
///
/// Returns `AuthnError::UntrustedCertificate` if the certificate does not
/// chain to `anchor` or is outside its validity window at `now_utc_seconds`.
/// Returns `AuthnError::UnsupportedKey` if the certificate key is not Ed25519.
/// Returns `AuthnError::InvalidSignature` if the signature does not cover
/// this certificate and body.
#[must_use = "verification result must be checked"]
pub fn verify_token(
    token: &AuthToken,
    body: &[u8],
    anchor: &TrustAnchor,
    now_utc_seconds: i64,
) -> Result<VerifiedCaller, AuthnError> {
    let info = anchor.verify_issued(token.cert_der(), now_utc_seconds)?;
    let public_key = info.public_key.ok_or(AuthnError::UnsupportedKey)?;

    let payload = build_signed_payload(token.cert_der(), body)?;
    if !public_key.verify(&payload, token.signature()) {
        return Err(AuthnError::InvalidSignature);
    }

    Ok(VerifiedCaller::new(info.common_name, info.id, public_key))
}
