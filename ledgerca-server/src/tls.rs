//! Listener TLS configuration.
//!
//! Server authentication only; callers prove their identity in the
//! `Authorization` header, not with client certificates.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::config::ListenerTls;

/// TLS handshake timeout to prevent slow-loris style attacks.
pub const TLS_HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Errors that can occur during TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("TLS is enabled but {0} is not set")]
    MissingFile(&'static str),
    #[error("failed to read {path}: {reason}")]
    Pem { path: String, reason: String },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("failed to build config: {0}")]
    Config(#[from] rustls::Error),
}

/// Build the rustls config for the listener from PEM files.
///
/// # Errors
///
/// Returns `TlsConfigError` if a file is missing or unreadable or the key
/// does not match the certificate.
pub fn server_config(tls: &ListenerTls) -> Result<Arc<ServerConfig>, TlsConfigError> {
    if tls.certfile.is_empty() {
        return Err(TlsConfigError::MissingFile("tls.certfile"));
    }
    if tls.keyfile.is_empty() {
        return Err(TlsConfigError::MissingFile("tls.keyfile"));
    }

    let certs = load_certs(Path::new(&tls.certfile))?;
    let key = PrivateKeyDer::from_pem_file(&tls.keyfile).map_err(|e| TlsConfigError::Pem {
        path: tls.keyfile.clone(),
        reason: e.to_string(),
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    tracing::info!(certfile = %tls.certfile, "Loaded listener TLS certificate");
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let pem_err = |e: rustls::pki_types::pem::Error| TlsConfigError::Pem {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_err)?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}
