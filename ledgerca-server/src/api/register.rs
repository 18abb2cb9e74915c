use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::Extension;
use ledgerca_core::identity::{authorize_register, DEFAULT_IDENTITY_TYPE};
use ledgerca_core::quota::{resolve_max_enrollments, INHERIT};
use ledgerca_core::{Attributes, AuditAction, AuditEvent, AuditTarget, AuthzDecision, NewIdentity};
use serde::{Deserialize, Serialize};

use super::{parse_body, ApiError, ApiResult, EndpointError, Envelope, Handler};
use crate::audit;
use crate::authn::Caller;
use crate::registry::generate_secret;
use crate::server::ServerContext;

#[derive(Deserialize)]
struct RegisterRequest {
    id: String,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default, rename = "type")]
    identity_type: Option<String>,
    #[serde(default)]
    affiliation: String,
    #[serde(default, alias = "attributes")]
    attrs: Attributes,
    #[serde(default = "inherit")]
    max_enrollments: i64,
}

fn inherit() -> i64 {
    INHERIT
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub secret: String,
}

pub(super) fn endpoint(ctx: &ServerContext) -> Result<Handler, EndpointError> {
    if !ctx.registry.supports_insert() {
        return Err(EndpointError::Unsupported(ctx.registry.backend()));
    }
    Ok(post(register))
}

async fn register(
    State(ctx): State<Arc<ServerContext>>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ApiResult<RegisterResponse> {
    let request: RegisterRequest = parse_body(&body)?;
    if request.id.trim().is_empty() {
        return Err(ApiError::BadRequest("identity id is required".into()));
    }
    let identity_type = request
        .identity_type
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_IDENTITY_TYPE.to_string());

    let registrar = &caller.identity;
    if let AuthzDecision::Deny { reason } =
        authorize_register(registrar, &identity_type, &request.affiliation, &request.attrs)
    {
        audit::record(
            &AuditEvent::new(
                Some(registrar.id.clone()),
                AuditAction::AuthzDenied,
                AuditTarget::Identity(request.id.clone()),
            )
            .with_metadata("reason", reason.clone()),
        );
        return Err(ApiError::Forbidden(reason));
    }

    if !ctx.registry.affiliation_exists(&request.affiliation).await? {
        return Err(ApiError::BadRequest(format!(
            "affiliation '{}' does not exist",
            request.affiliation
        )));
    }

    let max_enrollments =
        resolve_max_enrollments(ctx.config.registry.max_enrollments, request.max_enrollments)?;
    let secret = request
        .secret
        .filter(|s| !s.is_empty())
        .unwrap_or_else(generate_secret);

    ctx.registry
        .insert_user(&NewIdentity {
            id: request.id.clone(),
            secret: secret.clone(),
            identity_type,
            affiliation: request.affiliation.clone(),
            attributes: request.attrs,
            max_enrollments,
        })
        .await?;

    tracing::info!(
        id = %request.id,
        registrar = %registrar.id,
        affiliation = %request.affiliation,
        max_enrollments,
        "Registered identity"
    );
    audit::emit(
        Some(&registrar.id),
        AuditAction::IdentityRegistered,
        AuditTarget::Identity(request.id),
    );
    Ok(Envelope::ok(RegisterResponse { secret }))
}
