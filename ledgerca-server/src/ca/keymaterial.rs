//! CA key material bootstrap and loading.
//!
//! The CA key and certificate are generated once and reused on every
//! restart. Generating them again is only done on explicit renewal.

use std::path::{Path, PathBuf};

use ledgerca_auth::cert::{decode_certificate, TrustAnchor};
use ledgerca_auth::identity::{Fingerprint, PrivateKey};
use ledgerca_auth::{CertError, KeyError};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};

use crate::config::{parse_duration, CaFiles, ConfigError, CsrTemplate};

/// OID of the subject `serialNumber` attribute.
const SUBJECT_SERIAL_NUMBER: &[u64] = &[2, 5, 4, 5];

/// Errors from CA key material handling. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum KeyMaterialError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CA key: {0}")]
    Key(#[from] KeyError),
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("invalid CA certificate: {0}")]
    Certificate(#[from] CertError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeyMaterialError + '_ {
    move |source| KeyMaterialError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What [`ensure_key_material`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// Both files were already present.
    Existing,
    /// A new key and self-signed certificate were written.
    Generated,
}

/// Make sure the CA key and certificate exist.
///
/// A no-op when both files exist and `renew` is false, so restarts never
/// replace the CA identity.
///
/// # Errors
///
/// Returns `KeyMaterialError` if generation or writing fails.
pub fn ensure_key_material(
    files: &CaFiles,
    template: &CsrTemplate,
    renew: bool,
) -> Result<Provisioned, KeyMaterialError> {
    let key_path = Path::new(&files.keyfile);
    let cert_path = Path::new(&files.certfile);

    if !renew && key_path.exists() && cert_path.exists() {
        tracing::info!(
            certfile = %files.certfile,
            keyfile = %files.keyfile,
            "CA key and certificate already exist"
        );
        return Ok(Provisioned::Existing);
    }

    let private_key = PrivateKey::generate();
    let pkcs8 = private_key.to_pkcs8_der()?;
    let key_pair = KeyPair::try_from(pkcs8.as_bytes())?;
    let cert = self_signed_ca(&key_pair, template)?;

    write_file(key_path, key_pair.serialize_pem().as_bytes(), 0o600)?;
    write_file(cert_path, cert.pem().as_bytes(), 0o644)?;

    tracing::info!(
        certfile = %files.certfile,
        fingerprint = %Fingerprint::from_public_key(&private_key.public_key()),
        renew,
        "Generated CA key and certificate"
    );
    Ok(Provisioned::Generated)
}

fn self_signed_ca(
    key_pair: &KeyPair,
    template: &CsrTemplate,
) -> Result<Certificate, KeyMaterialError> {
    let mut params = CertificateParams::new(template.hosts.clone())?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, template.cn.as_str());
    for name in &template.names {
        let fields = [
            (DnType::CountryName, &name.c),
            (DnType::StateOrProvinceName, &name.st),
            (DnType::LocalityName, &name.l),
            (DnType::OrganizationName, &name.o),
            (DnType::OrganizationalUnitName, &name.ou),
        ];
        for (ty, value) in fields {
            if let Some(value) = value {
                dn.push(ty, value.as_str());
            }
        }
    }
    if let Some(serial) = &template.serial_number {
        dn.push(
            DnType::CustomDnType(SUBJECT_SERIAL_NUMBER.to_vec()),
            serial.as_str(),
        );
    }
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let lifetime = parse_duration(&template.expiry)?;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + lifetime;

    Ok(params.self_signed(key_pair)?)
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), KeyMaterialError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    std::fs::write(path, contents).map_err(io_err(path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(io_err(path))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Loaded CA key material, shared read-only for the process lifetime.
pub struct CaKeyMaterial {
    cert_pem: String,
    key: KeyPair,
    issuer: Certificate,
    anchor: TrustAnchor,
}

impl CaKeyMaterial {
    /// Load the CA key and certificate from disk.
    ///
    /// # Errors
    ///
    /// Returns `KeyMaterialError` if either file is missing or invalid.
    pub fn load(files: &CaFiles) -> Result<Self, KeyMaterialError> {
        let key_path = Path::new(&files.keyfile);
        let cert_path = Path::new(&files.certfile);
        let key_pem = std::fs::read_to_string(key_path).map_err(io_err(key_path))?;
        let cert_pem = std::fs::read_to_string(cert_path).map_err(io_err(cert_path))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// # Errors
    ///
    /// Returns `KeyMaterialError` if the PEM blocks are invalid.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, KeyMaterialError> {
        let key = KeyPair::from_pem(key_pem)?;
        let anchor = TrustAnchor::from_certificate(cert_pem.as_bytes())?;
        // Rebuilt from the stored certificate so issued certificates carry
        // its subject and key identifier.
        let issuer = CertificateParams::from_ca_cert_pem(cert_pem)?.self_signed(&key)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key,
            issuer,
            anchor,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> Result<Vec<u8>, CertError> {
        decode_certificate(self.cert_pem.as_bytes())
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn issuer(&self) -> &Certificate {
        &self.issuer
    }

    pub fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(self.anchor.public_key())
    }
}

impl std::fmt::Debug for CaKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaKeyMaterial")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_files(dir: &Path) -> CaFiles {
    CaFiles {
        certfile: dir.join("ca-cert.pem").to_string_lossy().into_owned(),
        keyfile: dir.join("msp/keystore/ca-key.pem").to_string_lossy().into_owned(),
    }
}
