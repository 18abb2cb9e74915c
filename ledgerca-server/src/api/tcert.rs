use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::Extension;
use serde::{Deserialize, Serialize};

use super::{parse_body, ApiError, ApiResult, EndpointError, Envelope, Handler};
use crate::authn::Caller;
use crate::ca::TcertRequest;
use crate::config::parse_duration;
use crate::server::ServerContext;

#[derive(Deserialize)]
struct TcertBody {
    certificate_requests: Vec<String>,
    #[serde(default)]
    attr_names: Vec<String>,
    /// Duration string such as `30m`.
    #[serde(default)]
    validity: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Tcert {
    pub cert: String,
    pub serial: String,
    pub aki: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TcertResponse {
    pub certs: Vec<Tcert>,
    pub ca_chain: String,
}

pub(super) fn endpoint(_ctx: &ServerContext) -> Result<Handler, EndpointError> {
    Ok(post(tcert))
}

async fn tcert(
    State(ctx): State<Arc<ServerContext>>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ApiResult<TcertResponse> {
    let request: TcertBody = parse_body(&body)?;
    let validity = request
        .validity
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let names: Vec<&str> = request.attr_names.iter().map(String::as_str).collect();
    let identity = ctx.registry.get_user(&caller.identity.id, &names).await?;

    let issued = ctx
        .engine
        .issue_tcerts(
            &identity,
            &TcertRequest {
                csrs: request.certificate_requests,
                attr_names: request.attr_names,
                validity,
            },
        )
        .await?;

    Ok(Envelope::ok(TcertResponse {
        certs: issued
            .into_iter()
            .map(|cert| Tcert {
                cert: cert.pem,
                serial: cert.id.serial,
                aki: cert.id.aki,
            })
            .collect(),
        ca_chain: ctx.engine.ca_chain().to_string(),
    }))
}
