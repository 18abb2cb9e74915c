//! Request authentication layer.
//!
//! Stateless: each request proves who sent it.
//! - `Basic` endpoints take `Authorization: Basic base64(id:secret)` and
//!   check it against the registry
//! - `Token` endpoints take `Authorization: <cert>.<sig>`, a signature by an
//!   issued certificate over that certificate and the body digest
//!
//! On success the caller is attached to the request extensions as
//! [`Caller`]. On failure the handler never runs.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ledgerca_auth::{verify_token, AuthToken, BasicCredentials, CertId};
use ledgerca_core::identity::attrs;
use ledgerca_core::{AuditAction, AuditTarget, Identity};

use crate::api::ApiError;
use crate::audit;
use crate::registry::RegistryError;
use crate::server::ServerContext;

/// Largest request body accepted.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Attributes every authenticated caller is loaded with.
const CALLER_ATTRIBUTES: &[&str] = &[attrs::REGISTRAR_ROLES, attrs::DELEGATE_ROLES, attrs::REVOKER];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Enrollment secret.
    Basic,
    /// Signature by an issued certificate.
    Token,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub identity: Identity,
    /// The certificate the request was signed with; `None` for basic auth.
    pub cert: Option<CertId>,
}

/// State of one endpoint's authentication layer.
#[derive(Clone)]
pub struct AuthLayer {
    ctx: Arc<ServerContext>,
    mode: AuthMode,
}

impl AuthLayer {
    pub fn new(ctx: Arc<ServerContext>, mode: AuthMode) -> Self {
        Self { ctx, mode }
    }
}

/// Authenticate the request and hand it on with a [`Caller`] attached.
pub async fn authenticate(
    State(layer): State<AuthLayer>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::PayloadTooLarge.into_response(),
    };
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let result = match (layer.mode, header) {
        (_, None) => Err(ApiError::Unauthenticated("missing authorization header".into())),
        (AuthMode::Basic, Some(header)) => basic(&layer.ctx, &header).await,
        (AuthMode::Token, Some(header)) => token(&layer.ctx, &header, &body).await,
    };

    match result {
        Ok(caller) => {
            tracing::debug!(id = %caller.identity.id, %path, "Authenticated request");
            parts.extensions.insert(caller);
            next.run(Request::from_parts(parts, Body::from(body))).await
        }
        Err(e) => {
            tracing::warn!(%path, error = %e, "Rejected request");
            audit::record(
                &ledgerca_core::AuditEvent::new(
                    None,
                    AuditAction::AuthnRejected,
                    AuditTarget::Endpoint(path),
                )
                .with_metadata("reason", e.to_string()),
            );
            e.into_response()
        }
    }
}

async fn basic(ctx: &ServerContext, header: &str) -> Result<Caller, ApiError> {
    let credentials = BasicCredentials::parse(header)
        .map_err(|e| ApiError::Unauthenticated(e.to_string()))?;
    let identity = ctx
        .registry
        .verify_secret(credentials.id(), credentials.secret())
        .await
        .map_err(|e| match e {
            RegistryError::NotFound(_) | RegistryError::InvalidCredentials(_) => {
                ApiError::Unauthenticated(format!("invalid credentials for '{}'", credentials.id()))
            }
            other => other.into(),
        })?;
    Ok(Caller {
        identity,
        cert: None,
    })
}

async fn token(ctx: &ServerContext, header: &str, body: &[u8]) -> Result<Caller, ApiError> {
    let token = AuthToken::parse(header).map_err(|e| ApiError::Unauthenticated(e.to_string()))?;
    let now = chrono::Utc::now().timestamp();
    let verified = verify_token(&token, body, ctx.ca.anchor(), now)
        .map_err(|e| ApiError::Unauthenticated(e.to_string()))?;

    let cert_id = verified.cert_id();
    let record = ctx
        .certs
        .get(&cert_id.serial, &cert_id.aki)
        .await?
        .ok_or_else(|| ApiError::Unauthenticated(format!("certificate {cert_id} is unknown")))?;
    if !record.is_valid() {
        return Err(ApiError::Unauthenticated(format!(
            "certificate {cert_id} has been revoked"
        )));
    }
    if record.id != verified.enrollment_id() {
        return Err(ApiError::Unauthenticated(format!(
            "certificate {cert_id} does not belong to '{}'",
            verified.enrollment_id()
        )));
    }

    let identity = ctx
        .registry
        .get_user(verified.enrollment_id(), CALLER_ATTRIBUTES)
        .await
        .map_err(|e| match e {
            RegistryError::NotFound(id) => {
                ApiError::Unauthenticated(format!("identity '{id}' is not registered"))
            }
            other => other.into(),
        })?;

    Ok(Caller {
        identity,
        cert: Some(cert_id.clone()),
    })
}
