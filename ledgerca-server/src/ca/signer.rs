//! Certificate signing.
//!
//! A [`CertSigner`] resolves the signing profile for a request and hands the
//! request to either the local CA key or a remote signing authority.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledgerca_auth::cert::ATTRIBUTES_EXTENSION_OID;
use ledgerca_auth::{decode_certificate, inspect, CertError, CertInfo};
use ledgerca_core::Attributes;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateSigningRequestParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};

use super::keymaterial::CaKeyMaterial;
use crate::config::{parse_duration, ProfileConfig, SigningConfig};

/// Attributes extension OID as arcs.
const ATTRIBUTES_OID_ARCS: &[u64] = &[1, 2, 3, 4, 5, 6, 7, 8, 1];

const SERIAL_LEN: usize = 20;
const REMOTE_SIGN_PATH: &str = "/api/v1/cfssl/sign";
const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from signing a single request. None of them affect the CA.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("unknown signing profile '{0}'")]
    UnknownProfile(String),
    #[error("unknown key usage '{0}'")]
    InvalidUsage(String),
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),
    #[error("signing failed: {0}")]
    Signing(#[from] rcgen::Error),
    #[error("issued certificate is unreadable: {0}")]
    Issued(#[from] CertError),
    #[error("remote signer error: {0}")]
    Remote(String),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// A usage a profile may grant.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Usage {
    Key(KeyUsagePurpose),
    Extended(ExtendedKeyUsagePurpose),
}

fn parse_usage(name: &str) -> Result<Usage, SignError> {
    let usage = match name.trim().to_ascii_lowercase().as_str() {
        "digital signature" | "signing" => Usage::Key(KeyUsagePurpose::DigitalSignature),
        "content commitment" => Usage::Key(KeyUsagePurpose::ContentCommitment),
        "key encipherment" => Usage::Key(KeyUsagePurpose::KeyEncipherment),
        "key agreement" => Usage::Key(KeyUsagePurpose::KeyAgreement),
        "cert sign" => Usage::Key(KeyUsagePurpose::KeyCertSign),
        "crl sign" => Usage::Key(KeyUsagePurpose::CrlSign),
        "server auth" => Usage::Extended(ExtendedKeyUsagePurpose::ServerAuth),
        "client auth" => Usage::Extended(ExtendedKeyUsagePurpose::ClientAuth),
        "code signing" => Usage::Extended(ExtendedKeyUsagePurpose::CodeSigning),
        _ => return Err(SignError::InvalidUsage(name.to_string())),
    };
    Ok(usage)
}

/// A resolved signing profile.
#[derive(Debug, Clone)]
pub struct Profile {
    usage: Vec<Usage>,
    usage_names: Vec<String>,
    pub expiry: Duration,
    pub local_only: bool,
    /// Remote authority this profile delegates to, if any.
    pub remote: Option<String>,
}

impl Profile {
    fn from_config(config: &ProfileConfig) -> Result<Self, SignError> {
        let usage = config
            .usage
            .iter()
            .map(|name| parse_usage(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            usage,
            usage_names: config.usage.clone(),
            expiry: parse_duration(&config.expiry)?,
            local_only: config.local_only,
            remote: config.remote.clone(),
        })
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }
}

/// The default profile plus named profiles.
#[derive(Debug, Clone)]
pub struct SigningPolicy {
    default: Profile,
    profiles: BTreeMap<String, Profile>,
}

impl SigningPolicy {
    /// # Errors
    ///
    /// Returns `SignError` if a usage or expiry is invalid.
    pub fn from_config(config: &SigningConfig) -> Result<Self, SignError> {
        let default = Profile::from_config(&config.default)?;
        let profiles = config
            .profiles
            .iter()
            .map(|(name, profile)| Ok((name.clone(), Profile::from_config(profile)?)))
            .collect::<Result<_, SignError>>()?;
        Ok(Self { default, profiles })
    }

    /// Point every profile that may delegate at `remote`. Names are kept.
    pub fn override_remotes(&mut self, remote: &str) {
        for profile in std::iter::once(&mut self.default).chain(self.profiles.values_mut()) {
            if !profile.local_only {
                profile.remote = Some(remote.to_string());
            }
        }
    }

    /// The named profile, or the default when `name` is `None` or empty.
    ///
    /// # Errors
    ///
    /// Returns `SignError::UnknownProfile` for a name that is not configured.
    pub fn profile(&self, name: Option<&str>) -> Result<&Profile, SignError> {
        match name.filter(|n| !n.is_empty()) {
            None => Ok(&self.default),
            Some(name) => self
                .profiles
                .get(name)
                .ok_or_else(|| SignError::UnknownProfile(name.to_string())),
        }
    }

    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

/// What to put in an issued certificate.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// PEM-encoded PKCS#10 request. Only its public key and SANs are used.
    pub csr_pem: String,
    /// Becomes the subject CN.
    pub enrollment_id: String,
    /// Becomes the subject OU.
    pub identity_type: String,
    /// Overrides the SANs of the request when non-empty.
    pub hosts: Vec<String>,
    pub profile: Option<String>,
    /// Embedded in the attributes extension.
    pub attributes: Attributes,
}

#[derive(Serialize, Deserialize)]
struct AttributesExtension {
    attrs: Attributes,
}

fn attributes_json(attributes: &Attributes) -> Result<Vec<u8>, SignError> {
    let ext = AttributesExtension {
        attrs: attributes.clone(),
    };
    serde_json::to_vec(&ext).map_err(|e| SignError::InvalidRequest(e.to_string()))
}

/// Decode the attributes extension of an issued certificate.
pub fn decode_attributes(raw: &[u8]) -> Option<Attributes> {
    serde_json::from_slice::<AttributesExtension>(raw)
        .ok()
        .map(|ext| ext.attrs)
}

/// A certificate a signer produced.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    pub pem: String,
    pub info: CertInfo,
}

impl SignedCertificate {
    fn from_pem(pem: String) -> Result<Self, SignError> {
        let der = decode_certificate(pem.as_bytes())?;
        let info = inspect(&der)?;
        Ok(Self { pem, info })
    }
}

/// Something that turns a request into a PEM certificate.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, request: &SignRequest, profile: &Profile) -> Result<String, SignError>;
}

/// Signs with the CA key held by this process.
pub struct LocalSigner {
    ca: Arc<CaKeyMaterial>,
}

impl LocalSigner {
    pub fn new(ca: Arc<CaKeyMaterial>) -> Self {
        Self { ca }
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    OsRng.fill_bytes(&mut bytes);
    // Positive and minimal in DER
    bytes[0] &= 0x7f;
    if bytes[0] == 0 {
        bytes[0] = 0x01;
    }
    SerialNumber::from_slice(&bytes)
}

fn san_for(host: &str) -> Result<SanType, SignError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = host
        .to_string()
        .try_into()
        .map_err(|_| SignError::InvalidRequest(format!("invalid host '{host}'")))?;
    Ok(SanType::DnsName(name))
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, request: &SignRequest, profile: &Profile) -> Result<String, SignError> {
        let mut csr = CertificateSigningRequestParams::from_pem(&request.csr_pem)
            .map_err(|e| SignError::InvalidRequest(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, request.enrollment_id.as_str());
        dn.push(DnType::OrganizationalUnitName, request.identity_type.as_str());

        let params = &mut csr.params;
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.serial_number = Some(random_serial());
        params.use_authority_key_identifier_extension = true;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + profile.expiry;
        params.key_usages.clear();
        params.extended_key_usages.clear();
        for usage in &profile.usage {
            match usage {
                Usage::Key(k) => params.key_usages.push(*k),
                Usage::Extended(e) => params.extended_key_usages.push(e.clone()),
            }
        }
        if !request.hosts.is_empty() {
            params.subject_alt_names = request
                .hosts
                .iter()
                .map(|h| san_for(h))
                .collect::<Result<_, _>>()?;
        }
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            ATTRIBUTES_OID_ARCS,
            attributes_json(&request.attributes)?,
        )];

        let cert = csr.signed_by(self.ca.issuer(), self.ca.key())?;
        Ok(cert.pem())
    }
}

#[derive(Serialize)]
struct RemoteSubject<'a> {
    #[serde(rename = "CN")]
    cn: &'a str,
    names: [RemoteName<'a>; 1],
}

#[derive(Serialize)]
struct RemoteName<'a> {
    #[serde(rename = "OU")]
    ou: &'a str,
}

#[derive(Serialize)]
struct RemoteExtension {
    id: &'static str,
    critical: bool,
    value: String,
}

#[derive(Serialize)]
struct RemoteSignRequest<'a> {
    certificate_request: &'a str,
    profile: &'a str,
    hosts: &'a [String],
    subject: RemoteSubject<'a>,
    extensions: [RemoteExtension; 1],
}

#[derive(Deserialize)]
struct RemoteSignResponse {
    success: bool,
    #[serde(default)]
    result: Option<RemoteSignResult>,
    #[serde(default)]
    errors: Vec<RemoteMessage>,
}

#[derive(Deserialize)]
struct RemoteSignResult {
    certificate: String,
}

#[derive(Deserialize)]
struct RemoteMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Delegates signing to a CFSSL-compatible authority over HTTP.
pub struct RemoteSigner {
    http: reqwest::Client,
}

impl RemoteSigner {
    /// # Errors
    ///
    /// Returns `SignError::Remote` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, SignError> {
        let http = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .user_agent(concat!("ledgerca-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SignError::Remote(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn sign(&self, request: &SignRequest, profile: &Profile) -> Result<String, SignError> {
        let Some(remote) = profile.remote.as_deref() else {
            return Err(SignError::Remote("profile has no remote".into()));
        };
        let url = format!("{}{REMOTE_SIGN_PATH}", remote.trim_end_matches('/'));
        let body = RemoteSignRequest {
            certificate_request: &request.csr_pem,
            profile: request.profile.as_deref().unwrap_or(""),
            hosts: &request.hosts,
            subject: RemoteSubject {
                cn: &request.enrollment_id,
                names: [RemoteName {
                    ou: &request.identity_type,
                }],
            },
            extensions: [RemoteExtension {
                id: ATTRIBUTES_EXTENSION_OID,
                critical: false,
                value: hex::encode(attributes_json(&request.attributes)?),
            }],
        };

        tracing::debug!(%url, id = %request.enrollment_id, "Sending remote sign request");
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SignError::Remote(format!("HTTP error: {e}")))?;
        let status = response.status();
        let reply: RemoteSignResponse = response
            .json()
            .await
            .map_err(|e| SignError::Remote(format!("HTTP {status}: {e}")))?;

        match reply.result {
            Some(result) if reply.success => Ok(result.certificate),
            _ => {
                let detail = reply
                    .errors
                    .first()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_else(|| format!("HTTP {status}"));
                Err(SignError::Remote(detail))
            }
        }
    }
}

/// Profile-aware signer shared by every request handler.
pub struct CertSigner {
    policy: SigningPolicy,
    local: LocalSigner,
    remote: RemoteSigner,
}

impl CertSigner {
    /// # Errors
    ///
    /// Returns `SignError` if the policy is invalid.
    pub fn new(
        ca: Arc<CaKeyMaterial>,
        signing: &SigningConfig,
        remote: Option<&str>,
    ) -> Result<Self, SignError> {
        let mut policy = SigningPolicy::from_config(signing)?;
        if let Some(remote) = remote {
            tracing::info!(%remote, "Delegating signing profiles to remote authority");
            policy.override_remotes(remote);
        }
        Ok(Self {
            policy,
            local: LocalSigner::new(ca),
            remote: RemoteSigner::new()?,
        })
    }

    pub fn policy(&self) -> &SigningPolicy {
        &self.policy
    }

    /// Sign with the profile the request names.
    ///
    /// # Errors
    ///
    /// Returns `SignError` on any failure; the CA is unaffected.
    pub async fn sign(&self, request: &SignRequest) -> Result<SignedCertificate, SignError> {
        let profile = self.policy.profile(request.profile.as_deref())?.clone();
        self.sign_with(request, &profile).await
    }

    /// Sign with an explicit profile.
    ///
    /// # Errors
    ///
    /// Returns `SignError` on any failure; the CA is unaffected.
    pub async fn sign_with(
        &self,
        request: &SignRequest,
        profile: &Profile,
    ) -> Result<SignedCertificate, SignError> {
        let pem = if profile.remote.is_some() {
            self.remote.sign(request, profile).await?
        } else {
            self.local.sign(request, profile).await?
        };
        let signed = SignedCertificate::from_pem(pem)?;
        tracing::debug!(
            id = %request.enrollment_id,
            serial = %signed.info.id.serial,
            profile = request.profile.as_deref().unwrap_or("default"),
            usage = ?profile.usage_names,
            "Signed certificate"
        );
        Ok(signed)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::csr_pem;
    use super::*;
    use crate::ca::keymaterial::{ensure_key_material, test_files};
    use crate::config::CsrTemplate;

    fn ca() -> (Arc<CaKeyMaterial>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let files = test_files(dir.path());
        ensure_key_material(&files, &CsrTemplate::default(), false).unwrap();
        (Arc::new(CaKeyMaterial::load(&files).unwrap()), dir)
    }

    fn request(csr: String) -> SignRequest {
        let mut attributes = Attributes::new();
        attributes.insert("hf.EnrollmentID".into(), "alice".into());
        attributes.insert("hf.Affiliation".into(), "org1.dept1".into());
        SignRequest {
            csr_pem: csr,
            enrollment_id: "alice".into(),
            identity_type: "user".into(),
            hosts: vec!["peer0.org1".into(), "10.0.0.1".into()],
            profile: None,
            attributes,
        }
    }

    #[tokio::test]
    async fn local_signer_issues_chained_certificate() {
        let (ca, _dir) = ca();
        let signer = CertSigner::new(ca.clone(), &SigningConfig::default(), None).unwrap();
        let (key, csr) = csr_pem();

        let signed = signer.sign(&request(csr)).await.unwrap();

        let der = decode_certificate(signed.pem.as_bytes()).unwrap();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let info = ca.anchor().verify_issued(&der, now).unwrap();
        assert_eq!(info.common_name, "alice");
        assert_eq!(info.organizational_unit.as_deref(), Some("user"));
        assert_eq!(info.public_key, Some(key.public_key()));
        assert!(!info.id.aki.is_empty());
        assert!(info.not_after - info.not_before >= 8760 * 3600 - 1);

        let attrs = decode_attributes(info.attributes.as_deref().unwrap()).unwrap();
        assert_eq!(attrs.get("hf.Affiliation").map(String::as_str), Some("org1.dept1"));
    }

    #[tokio::test]
    async fn serials_are_unique() {
        let (ca, _dir) = ca();
        let signer = CertSigner::new(ca, &SigningConfig::default(), None).unwrap();

        let a = signer.sign(&request(csr_pem().1)).await.unwrap();
        let b = signer.sign(&request(csr_pem().1)).await.unwrap();

        assert_ne!(a.info.id.serial, b.info.id.serial);
        assert_eq!(a.info.id.aki, b.info.id.aki);
    }

    #[tokio::test]
    async fn garbage_csr_rejected() {
        let (ca, _dir) = ca();
        let signer = CertSigner::new(ca, &SigningConfig::default(), None).unwrap();

        let result = signer.sign(&request("not a csr".into())).await;

        assert!(matches!(result, Err(SignError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn unknown_profile_rejected() {
        let (ca, _dir) = ca();
        let signer = CertSigner::new(ca, &SigningConfig::default(), None).unwrap();
        let mut req = request(csr_pem().1);
        req.profile = Some("nope".into());

        assert!(matches!(
            signer.sign(&req).await,
            Err(SignError::UnknownProfile(p)) if p == "nope"
        ));
    }

    #[test]
    fn remote_override_keeps_names_and_local_only() {
        let mut config = SigningConfig::default();
        config.profiles.insert("tls".into(), ProfileConfig::default());
        config.profiles.insert(
            "ca".into(),
            ProfileConfig {
                local_only: true,
                ..ProfileConfig::default()
            },
        );
        let mut policy = SigningPolicy::from_config(&config).unwrap();

        policy.override_remotes("http://signer:8888");

        assert_eq!(policy.profile_names().collect::<Vec<_>>(), vec!["ca", "tls"]);
        assert_eq!(
            policy.profile(None).unwrap().remote.as_deref(),
            Some("http://signer:8888")
        );
        assert_eq!(
            policy.profile(Some("tls")).unwrap().remote.as_deref(),
            Some("http://signer:8888")
        );
        assert!(policy.profile(Some("ca")).unwrap().remote.is_none());
    }

    #[test]
    fn invalid_usage_rejected() {
        let mut config = SigningConfig::default();
        config.default.usage = vec!["teleport".into()];

        assert!(matches!(
            SigningPolicy::from_config(&config),
            Err(SignError::InvalidUsage(u)) if u == "teleport"
        ));
    }

    #[test]
    fn serial_is_positive() {
        for _ in 0..32 {
            let serial = random_serial();
            let bytes = serial.to_bytes();
            assert_eq!(bytes.len(), SERIAL_LEN);
            assert!(bytes[0] > 0 && bytes[0] < 0x80);
        }
    }
}
