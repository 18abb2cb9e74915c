//! Certificate utilities for X.509 parsing and chain checks.
//!
//! # Security
//!
//! - Input is limited to 16KB to prevent DoS
//! - The x509_parser library handles ASN.1 parsing safely
//! - Only Ed25519-signed certificates are accepted by [`TrustAnchor`]

use thiserror::Error;
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::prelude::*;

use crate::identity::{KeyError, PublicKey, Signature};

/// Maximum certificate size (16KB is generous for a single cert)
pub const MAX_CERT_SIZE: usize = 16 * 1024;

/// Extension carrying the identity attributes as a JSON object.
pub const ATTRIBUTES_EXTENSION_OID: &str = "1.2.3.4.5.6.7.8.1";

/// Errors that can occur during certificate parsing and verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CertError {
    #[error("certificate too large: {0} bytes (max {MAX_CERT_SIZE})")]
    TooLarge(usize),

    #[error("failed to decode PEM: {0}")]
    Pem(String),

    #[error("failed to parse X.509 certificate: {0}")]
    ParseError(String),

    #[error("certificate has no common name")]
    MissingCommonName,

    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid certificate key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("certificate not valid before {0}")]
    NotYetValid(i64),

    #[error("certificate expired at {0}")]
    Expired(i64),

    #[error("certificate was not signed by this CA")]
    BadIssuerSignature,

    #[error("authority key identifier does not match this CA")]
    IssuerMismatch,
}

/// Serial number and authority key identifier of an issued certificate.
///
/// Together they uniquely identify a certificate record. The serial is
/// rendered in decimal, the AKI in lowercase hex (empty when absent).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertId {
    pub serial: String,
    pub aki: String,
}

impl std::fmt::Display for CertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.serial, self.aki)
    }
}

/// Fields of a certificate the server needs after parsing.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub id: CertId,
    pub common_name: String,
    pub organizational_unit: Option<String>,
    /// Subject key identifier in lowercase hex.
    pub ski: Option<String>,
    pub not_before: i64,
    pub not_after: i64,
    pub public_key: Option<PublicKey>,
    /// Raw value of the attributes extension, if present.
    pub attributes: Option<Vec<u8>>,
}

/// Accept either a PEM block or raw DER and return the DER bytes.
///
/// # Errors
///
/// Returns `CertError::TooLarge` if the input exceeds 16KB.
/// Returns `CertError::Pem` if the input looks like PEM but cannot be decoded.
pub fn decode_certificate(input: &[u8]) -> Result<Vec<u8>, CertError> {
    if input.len() > MAX_CERT_SIZE {
        return Err(CertError::TooLarge(input.len()));
    }

    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    let trimmed = &input[start..];
    if trimmed.starts_with(b"-----BEGIN") {
        let (_, pem) = x509_parser::pem::parse_x509_pem(trimmed)
            .map_err(|e| CertError::Pem(format!("{:?}", e)))?;
        return Ok(pem.contents);
    }

    Ok(input.to_vec())
}

/// Parse a DER-encoded certificate into the fields the server uses.
///
/// The public key is only decoded when the certificate carries a 32-byte
/// Ed25519 key; other key types yield `public_key: None`.
///
/// # Errors
///
/// Returns `CertError::TooLarge` if certificate exceeds 16KB.
/// Returns `CertError::ParseError` if the certificate is malformed.
/// Returns `CertError::MissingCommonName` if the subject has no CN.
pub fn inspect(cert_der: &[u8]) -> Result<CertInfo, CertError> {
    let cert = parse(cert_der)?;
    info_from(&cert)
}

fn parse(cert_der: &[u8]) -> Result<X509Certificate<'_>, CertError> {
    // Input size validation (DoS protection)
    if cert_der.len() > MAX_CERT_SIZE {
        return Err(CertError::TooLarge(cert_der.len()));
    }

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CertError::ParseError(format!("{:?}", e)))?;
    Ok(cert)
}

fn info_from(cert: &X509Certificate<'_>) -> Result<CertInfo, CertError> {
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or(CertError::MissingCommonName)?;
    let organizational_unit = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok())
        .map(str::to_string);

    let mut aki = String::new();
    let mut ski = None;
    let mut attributes = None;
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::AuthorityKeyIdentifier(id) => {
                if let Some(key_id) = &id.key_identifier {
                    aki = hex::encode(key_id.0);
                }
            }
            ParsedExtension::SubjectKeyIdentifier(key_id) => {
                ski = Some(hex::encode(key_id.0));
            }
            _ if ext.oid.to_id_string() == ATTRIBUTES_EXTENSION_OID => {
                attributes = Some(ext.value.to_vec());
            }
            _ => {}
        }
    }

    let key_bytes = &cert.public_key().subject_public_key.data;
    let public_key = if key_bytes.len() == 32 {
        PublicKey::from_bytes(key_bytes).ok()
    } else {
        None
    };

    let validity = cert.validity();
    Ok(CertInfo {
        id: CertId {
            serial: cert.tbs_certificate.serial.to_string(),
            aki,
        },
        common_name,
        organizational_unit,
        ski,
        not_before: validity.not_before.timestamp(),
        not_after: validity.not_after.timestamp(),
        public_key,
        attributes,
    })
}

/// The CA certificate every presented client certificate must chain to.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    public_key: PublicKey,
    ski: Option<String>,
    der: Vec<u8>,
}

impl TrustAnchor {
    /// Build a trust anchor from the CA certificate (PEM or DER).
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate cannot be parsed or does not carry
    /// an Ed25519 public key.
    pub fn from_certificate(input: &[u8]) -> Result<Self, CertError> {
        let der = decode_certificate(input)?;
        let info = inspect(&der)?;
        let public_key = info.public_key.ok_or(CertError::InvalidKey(KeyError::InvalidFormat))?;
        Ok(Self {
            public_key,
            ski: info.ski,
            der,
        })
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The CA certificate in DER form.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Verify that `cert_der` was issued by this CA and is valid at `now`.
    ///
    /// Checks, in order: Ed25519 signature algorithm, the CA signature over
    /// the TBS bytes, the validity window, and AKI against the CA's SKI when
    /// both are present.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a `CertError`.
    pub fn verify_issued(&self, cert_der: &[u8], now: i64) -> Result<CertInfo, CertError> {
        let cert = parse(cert_der)?;

        if cert.signature_algorithm.algorithm != OID_SIG_ED25519 {
            return Err(CertError::UnsupportedAlgorithm(
                cert.signature_algorithm.algorithm.to_id_string(),
            ));
        }

        let signature = Signature::from_bytes(&cert.signature_value.data)?;
        if !self.public_key.verify(cert.tbs_certificate.as_ref(), &signature) {
            return Err(CertError::BadIssuerSignature);
        }

        let info = info_from(&cert)?;
        if now < info.not_before {
            return Err(CertError::NotYetValid(info.not_before));
        }
        if now > info.not_after {
            return Err(CertError::Expired(info.not_after));
        }

        if let Some(ski) = &self.ski {
            if !info.id.aki.is_empty() && &info.id.aki != ski {
                return Err(CertError::IssuerMismatch);
            }
        }

        Ok(info)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, PKCS_ED25519,
    };

    use crate::identity::PrivateKey;

    pub struct TestCa {
        pub cert: Certificate,
        pub key: KeyPair,
    }

    impl TestCa {
        pub fn new(name: &str) -> Self {
            let key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.distinguished_name.push(DnType::CommonName, name);
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let cert = params.self_signed(&key).unwrap();
            Self { cert, key }
        }

        pub fn der(&self) -> Vec<u8> {
            self.cert.der().to_vec()
        }

        /// Issue a leaf certificate for `client`'s key with the given CN.
        pub fn issue(&self, client: &PrivateKey, common_name: &str) -> Vec<u8> {
            self.issue_with(client, common_name, |_| {})
        }

        pub fn issue_with(
            &self,
            client: &PrivateKey,
            common_name: &str,
            customize: impl FnOnce(&mut CertificateParams),
        ) -> Vec<u8> {
            let pkcs8 = client.to_pkcs8_der().unwrap();
            let client_key = KeyPair::try_from(pkcs8.as_bytes()).unwrap();
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.distinguished_name.push(DnType::CommonName, common_name);
            params.distinguished_name.push(DnType::OrganizationalUnitName, "user");
            params.use_authority_key_identifier_extension = true;
            params.serial_number = Some(rcgen::SerialNumber::from_slice(&[0x01, 0x02, 0x03]));
            customize(&mut params);
            params
                .signed_by(&client_key, &self.cert, &self.key)
                .unwrap()
                .der()
                .to_vec()
        }
    }
}
