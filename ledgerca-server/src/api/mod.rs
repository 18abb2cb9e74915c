//! HTTP API.
//!
//! Every endpoint is `POST /api/v1/<name>` with a JSON body and answers with
//! the envelope `{success, result, errors, messages}`. Each endpoint opts
//! into one authentication mode when it is wired; an endpoint whose
//! constructor reports it is unsupported is left out of the router.

mod enroll;
mod register;
mod revoke;
mod tcert;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::{Json, Router};
use ledgerca_core::QuotaError;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::authn::{authenticate, AuthLayer, AuthMode};
use crate::ca::EnrollError;
use crate::certdb::CertStoreError;
use crate::registry::RegistryError;
use crate::server::ServerContext;

pub const API_PREFIX: &str = "/api/v1";

/// Why an endpoint could not be constructed.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("not supported by the {0} registry")]
    Unsupported(&'static str),
}

type Handler = MethodRouter<Arc<ServerContext>>;

struct Endpoint {
    name: &'static str,
    mode: AuthMode,
    build: fn(&ServerContext) -> Result<Handler, EndpointError>,
}

const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        name: "register",
        mode: AuthMode::Token,
        build: register::endpoint,
    },
    Endpoint {
        name: "enroll",
        mode: AuthMode::Basic,
        build: enroll::enroll_endpoint,
    },
    Endpoint {
        name: "reenroll",
        mode: AuthMode::Token,
        build: enroll::reenroll_endpoint,
    },
    Endpoint {
        name: "revoke",
        mode: AuthMode::Token,
        build: revoke::endpoint,
    },
    Endpoint {
        name: "tcert",
        mode: AuthMode::Token,
        build: tcert::endpoint,
    },
];

/// Build the router with every supported endpoint behind its
/// authentication layer.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    let mut router = Router::new();
    for endpoint in ENDPOINTS {
        match (endpoint.build)(&ctx) {
            Ok(handler) => {
                let layer = AuthLayer::new(ctx.clone(), endpoint.mode);
                router = router.route(
                    &format!("{API_PREFIX}/{}", endpoint.name),
                    handler.layer(axum::middleware::from_fn_with_state(layer, authenticate)),
                );
                tracing::debug!(endpoint = endpoint.name, mode = ?endpoint.mode, "Endpoint enabled");
            }
            Err(e) => {
                tracing::warn!("Endpoint '{}' is disabled: {}", endpoint.name, e);
            }
        }
    }
    router.with_state(ctx)
}

/// One error or informational message in the envelope.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ApiMessage {
    pub code: u32,
    pub message: String,
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize, serde::Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub result: Option<T>,
    pub errors: Vec<ApiMessage>,
    pub messages: Vec<ApiMessage>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(result: T) -> Json<Self> {
        Json(Self {
            success: true,
            result: Some(result),
            errors: Vec::new(),
            messages: Vec::new(),
        })
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Request failure as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication failure: {0}")]
    Unauthenticated(String),
    #[error("authorization failure: {0}")]
    Forbidden(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable numeric code for clients.
    pub fn code(&self) -> u32 {
        match self {
            Self::Unauthenticated(_) => 1000,
            Self::Forbidden(_) => 1001,
            Self::QuotaExceeded(_) => 1002,
            Self::BadRequest(_) => 1003,
            Self::NotFound(_) => 1004,
            Self::Conflict(_) => 1005,
            Self::PayloadTooLarge => 1006,
            Self::Internal => 1100,
        }
    }

    fn internal(error: &dyn std::fmt::Display) -> Self {
        tracing::error!(error = %error, "Request failed");
        Self::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            success: false,
            result: None,
            errors: vec![ApiMessage {
                code: self.code(),
                message: self.to_string(),
            }],
            messages: Vec::new(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => Self::NotFound(e.to_string()),
            RegistryError::DuplicateId(_) => Self::Conflict(e.to_string()),
            RegistryError::MissingParent { .. } | RegistryError::MissingAffiliation(_) => {
                Self::BadRequest(e.to_string())
            }
            RegistryError::InvalidCredentials(_) => Self::Unauthenticated(e.to_string()),
            RegistryError::QuotaExceeded { .. } => Self::QuotaExceeded(e.to_string()),
            RegistryError::Unsupported(_) => Self::BadRequest(e.to_string()),
            RegistryError::Corrupt(_) | RegistryError::Backend(_) | RegistryError::Directory(_) => {
                Self::internal(&e)
            }
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::Exhausted { .. } => Self::QuotaExceeded(e.to_string()),
            _ => Self::BadRequest(e.to_string()),
        }
    }
}

impl From<CertStoreError> for ApiError {
    fn from(e: CertStoreError) -> Self {
        match e {
            CertStoreError::Duplicate { .. } => Self::Conflict(e.to_string()),
            _ => Self::internal(&e),
        }
    }
}

impl From<EnrollError> for ApiError {
    fn from(e: EnrollError) -> Self {
        match e {
            EnrollError::Quota(QuotaError::Exhausted { cap }) => {
                Self::QuotaExceeded(format!("enrollment quota of {cap} exhausted"))
            }
            EnrollError::Quota(q) => Self::BadRequest(q.to_string()),
            EnrollError::Registry(r) => r.into(),
            EnrollError::Store(s) => s.into(),
            EnrollError::InvalidRequest(msg) => Self::BadRequest(msg),
            EnrollError::Sign(crate::ca::SignError::InvalidRequest(msg)) => {
                Self::BadRequest(format!("invalid certificate request: {msg}"))
            }
            EnrollError::Sign(crate::ca::SignError::UnknownProfile(p)) => {
                Self::BadRequest(format!("unknown signing profile '{p}'"))
            }
            EnrollError::Sign(_) | EnrollError::Unrecorded { .. } => Self::internal(&e),
        }
    }
}

/// Decode a JSON request body.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}
