//! Error taxonomy for the routing/proxying core and its
//! mapping onto HTTP status codes and caller-facing API-style error bodies
//! ( "Exit/status codes").

use crate::domain::ApiStyle;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Every error the core pipeline (C1-C11) can produce. Retryable upstream
/// errors never reach this type directly — they are consumed inside the
/// proxy engine's failover loop (`proxy.rs`) and only surface here once
/// failover is exhausted or the error is terminal.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("model is disabled")]
    ModelDisabled,
    #[error("model requires the responses endpoint")]
    RequiresResponsesEndpoint,
    #[error("model does not support required capability: {0:?}")]
    CapabilityMissing(crate::domain::Capability),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("insufficient credit balance")]
    CreditInsufficient,
    #[error("provider restricted: {0}")]
    ProviderRestricted(String),
    #[error("no eligible candidates for model {0}")]
    NoEligibleCandidates(String),
    #[error("all candidate providers are rate limited")]
    AllProvidersRateLimited { retry_after_secs: u64 },
    #[error("all candidate providers are down")]
    AllProvidersDown,
    #[error("upstream retryable error: {0}")]
    UpstreamRetryable(String),
    #[error("upstream terminal error ({status}): {body}")]
    UpstreamTerminal { status: u16, body: String },
    #[error("upstream timeout")]
    UpstreamTimeout,
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "UNAUTHENTICATED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::UnknownModel(_) => "UNKNOWN_MODEL",
            GatewayError::ModelDisabled => "MODEL_DISABLED",
            GatewayError::RequiresResponsesEndpoint => "REQUIRES_RESPONSES_ENDPOINT",
            GatewayError::CapabilityMissing(_) => "CAPABILITY_MISSING",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::CreditInsufficient => "CREDIT_INSUFFICIENT",
            GatewayError::ProviderRestricted(_) => "PROVIDER_RESTRICTED",
            GatewayError::NoEligibleCandidates(_) => "NO_ELIGIBLE_CANDIDATES",
            GatewayError::AllProvidersRateLimited { .. } => "ALL_PROVIDERS_RATE_LIMITED",
            GatewayError::AllProvidersDown => "ALL_PROVIDERS_DOWN",
            GatewayError::UpstreamRetryable(_) => "UPSTREAM_RETRYABLE",
            GatewayError::UpstreamTerminal { .. } => "UPSTREAM_TERMINAL",
            GatewayError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamProtocolError(_) => "UPSTREAM_PROTOCOL_ERROR",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) | GatewayError::ProviderRestricted(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::UnknownModel(_)
            | GatewayError::ModelDisabled
            | GatewayError::RequiresResponsesEndpoint
            | GatewayError::CapabilityMissing(_)
            | GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::CreditInsufficient => StatusCode::PAYMENT_REQUIRED,
            GatewayError::NoEligibleCandidates(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AllProvidersRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::AllProvidersDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamRetryable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTerminal { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamProtocolError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error body translated into the caller's own API style.
    pub fn to_body(&self, style: ApiStyle) -> serde_json::Value {
        let message = self.to_string();
        let code = self.code();
        match style {
            ApiStyle::Openai | ApiStyle::Responses => json!({
                "error": { "message": message, "type": code.to_lowercase(), "code": code }
            }),
            ApiStyle::Claude => json!({
                "type": "error",
                "error": { "type": code.to_lowercase(), "message": message }
            }),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = self.to_body(ApiStyle::Openai);
        if let GatewayError::AllProvidersRateLimited { retry_after_secs } = &self {
            body["retry_after"] = json!(retry_after_secs);
            let mut response = (status, Json(body)).into_response();
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
            return response;
        }
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
