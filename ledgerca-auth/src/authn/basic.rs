//! Basic credentials for the bootstrap enroll.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::AuthnError;

const BASIC_PREFIX: &str = "Basic ";

/// An identity id and its enrollment secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BasicCredentials {
    id: String,
    secret: String,
}

impl BasicCredentials {
    #[must_use]
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    /// Whether a header value uses the basic scheme.
    #[must_use]
    pub fn is_basic(header: &str) -> bool {
        header.trim_start().starts_with(BASIC_PREFIX)
    }

    /// Parse `Basic base64(id:secret)`.
    ///
    /// # Errors
    ///
    /// Returns `AuthnError::MalformedCredentials` if the scheme, encoding or
    /// `id:secret` shape is wrong, or either half is empty.
    pub fn parse(header: &str) -> Result<Self, AuthnError> {
        let encoded = header
            .trim()
            .strip_prefix(BASIC_PREFIX)
            .ok_or(AuthnError::MalformedCredentials)?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthnError::MalformedCredentials)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthnError::MalformedCredentials)?;
        let (id, secret) = decoded
            .split_once(':')
            .ok_or(AuthnError::MalformedCredentials)?;
        if id.is_empty() || secret.is_empty() {
            return Err(AuthnError::MalformedCredentials);
        }
        Ok(Self::new(id, secret))
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{BASIC_PREFIX}{}",
            STANDARD.encode(format!("{}:{}", self.id, self.secret))
        )
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
