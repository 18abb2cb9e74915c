use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::Extension;
use serde::{Deserialize, Serialize};

use super::{parse_body, ApiResult, EndpointError, Envelope, Handler};
use crate::authn::Caller;
use crate::ca::{EnrollRequest, IssuedCertificate};
use crate::server::ServerContext;

#[derive(Deserialize)]
struct EnrollBody {
    certificate_request: String,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    hosts: Vec<String>,
}

impl From<EnrollBody> for EnrollRequest {
    fn from(body: EnrollBody) -> Self {
        Self {
            csr_pem: body.certificate_request,
            profile: body.profile,
            hosts: body.hosts,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub cert: String,
    pub ca_chain: String,
}

impl From<IssuedCertificate> for EnrollResponse {
    fn from(issued: IssuedCertificate) -> Self {
        Self {
            cert: issued.pem,
            ca_chain: issued.ca_chain,
        }
    }
}

pub(super) fn enroll_endpoint(_ctx: &ServerContext) -> Result<Handler, EndpointError> {
    Ok(post(enroll))
}

pub(super) fn reenroll_endpoint(_ctx: &ServerContext) -> Result<Handler, EndpointError> {
    Ok(post(reenroll))
}

async fn enroll(
    State(ctx): State<Arc<ServerContext>>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ApiResult<EnrollResponse> {
    let request: EnrollBody = parse_body(&body)?;
    let issued = ctx.engine.enroll(&caller.identity, &request.into()).await?;
    Ok(Envelope::ok(issued.into()))
}

async fn reenroll(
    State(ctx): State<Arc<ServerContext>>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ApiResult<EnrollResponse> {
    let request: EnrollBody = parse_body(&body)?;
    let issued = ctx.engine.reenroll(&caller.identity, &request.into()).await?;
    Ok(Envelope::ok(issued.into()))
}
