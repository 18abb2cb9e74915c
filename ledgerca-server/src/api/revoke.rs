use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::Extension;
use ledgerca_core::identity::authorize_revoke;
use ledgerca_core::{
    AuditAction, AuditEvent, AuditTarget, AuthzDecision, CertificateRecord, Identity,
    RevocationReason,
};
use serde::{Deserialize, Serialize};

use super::{parse_body, ApiError, ApiResult, EndpointError, Envelope, Handler};
use crate::audit;
use crate::authn::Caller;
use crate::registry::RegistryError;
use crate::server::ServerContext;

#[derive(Deserialize)]
struct RevokeRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    aki: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevokedCertificate {
    pub serial: String,
    pub aki: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub revoked: Vec<RevokedCertificate>,
}

pub(super) fn endpoint(_ctx: &ServerContext) -> Result<Handler, EndpointError> {
    Ok(post(revoke))
}

async fn revoke(
    State(ctx): State<Arc<ServerContext>>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ApiResult<RevokeResponse> {
    let request: RevokeRequest = parse_body(&body)?;
    let reason_name = request.reason.as_deref().unwrap_or("");
    let reason = RevocationReason::from_name(reason_name)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown revocation reason '{reason_name}'")))?;

    let (owner, targets) = match (request.serial, request.aki, request.id) {
        (Some(serial), Some(aki), _) => {
            let record = ctx
                .certs
                .get(&serial, &aki.to_ascii_lowercase())
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("certificate {serial}/{aki} not found")))?;
            if !record.is_valid() {
                return Err(ApiError::Conflict(format!(
                    "certificate {serial}/{aki} is already revoked"
                )));
            }
            (record.id.clone(), vec![record])
        }
        (None, None, Some(id)) => {
            let records: Vec<CertificateRecord> = ctx
                .certs
                .list_by_owner(&id)
                .await?
                .into_iter()
                .filter(CertificateRecord::is_valid)
                .collect();
            (id, records)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "either id or both serial and aki are required".into(),
            ));
        }
    };

    let target = lookup_owner(&ctx, &owner).await?;
    authorize(&caller.identity, &owner, target.as_ref())?;

    let revoked_at = chrono::Utc::now().timestamp();
    let mut revoked = Vec::with_capacity(targets.len());
    for record in targets {
        if ctx
            .certs
            .revoke(&record.serial, &record.aki, reason.code(), revoked_at)
            .await?
        {
            audit::record(
                &AuditEvent::new(
                    Some(caller.identity.id.clone()),
                    AuditAction::CertificateRevoked,
                    audit::certificate(&record.serial, &record.aki),
                )
                .with_metadata("owner", owner.clone())
                .with_metadata("reason", reason.code().to_string()),
            );
            revoked.push(RevokedCertificate {
                serial: record.serial,
                aki: record.aki,
            });
        }
    }

    tracing::info!(
        owner = %owner,
        revoker = %caller.identity.id,
        count = revoked.len(),
        "Revoked certificates"
    );
    Ok(Envelope::ok(RevokeResponse { revoked }))
}

/// The owner's registry record, or `None` if it no longer exists.
async fn lookup_owner(ctx: &ServerContext, owner: &str) -> Result<Option<Identity>, ApiError> {
    match ctx.registry.get_user(owner, &[]).await {
        Ok(identity) => Ok(Some(identity)),
        Err(RegistryError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn authorize(revoker: &Identity, owner: &str, target: Option<&Identity>) -> Result<(), ApiError> {
    let decision = authorize_revoke(revoker, target.map(|t| t.affiliation.as_str()));
    if let AuthzDecision::Deny { reason } = decision {
        audit::record(
            &AuditEvent::new(
                Some(revoker.id.clone()),
                AuditAction::AuthzDenied,
                AuditTarget::Identity(owner.to_string()),
            )
            .with_metadata("reason", reason.clone()),
        );
        return Err(ApiError::Forbidden(reason));
    }
    Ok(())
}
