//! # HTTP Request Handlers Module
//!
//! Thin axum handlers for the wire surface: they extract the
//! bearer token and request body, delegate the actual routing/proxying work
//! to the `Orchestrator`, and shape the result back into an HTTP response —
//! a JSON body for unary outcomes, an SSE byte stream for streaming ones.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - OpenAI-compatible chat completions
//! - `POST /v1/messages` - Anthropic Messages API
//! - `POST /v1/responses` - OpenAI Responses API
//! - `GET /v1/models` - Union of visible providers' model catalogs
//! - `GET /health` - Liveness check

use crate::domain::ApiStyle;
use crate::error::GatewayError;
use crate::orchestrator::AuthenticatedCaller;
use crate::proxy::ProxyOutcome;
use crate::registry::UserContext;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::{json, Value};

const CONVERSATION_HEADER: &str = "x-conversation-id";
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(GatewayError::Unauthenticated)
}

fn conversation_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONVERSATION_HEADER).and_then(|v| v.to_str().ok())
}

fn idempotency_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(IDEMPOTENCY_HEADER).and_then(|v| v.to_str().ok())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedCaller, GatewayError> {
    let token = bearer_token(headers)?;
    state.orchestrator.authenticate(token).await
}

fn error_response(err: &GatewayError, style: ApiStyle) -> Response {
    let status = err.status();
    let mut body = err.to_body(style);
    if let GatewayError::AllProvidersRateLimited { retry_after_secs } = err {
        body["retry_after"] = json!(retry_after_secs);
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = retry_after_secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }
    (status, Json(body)).into_response()
}

/// Runs the shared request pipeline for one of the three wire endpoints and
/// shapes the `ProxyOutcome` into a response in the caller's API style.
async fn handle_endpoint(state: AppState, headers: HeaderMap, endpoint_style: ApiStyle, body: Value) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return error_response(&err, endpoint_style),
    };

    let lookup_id = match body.get("model").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return error_response(&GatewayError::BadRequest("missing 'model'".to_string()), endpoint_style),
    };

    let conv_id = conversation_id(&headers).map(|s| s.to_string());
    let idempotency_key = idempotency_key(&headers).map(|s| s.to_string());

    let outcome = state
        .orchestrator
        .handle(&caller, &lookup_id, &body, endpoint_style, conv_id.as_deref(), idempotency_key.as_deref())
        .await;

    match outcome {
        Ok(ProxyOutcome::Unary { body, .. }) => Json(body).into_response(),
        Ok(ProxyOutcome::Stream(stream)) => {
            let body = Body::from_stream(stream.map(Ok::<_, std::io::Error>));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(body)
                .unwrap_or_else(|_| {
                    error_response(&GatewayError::Internal("failed to build stream response".to_string()), endpoint_style)
                })
        }
        Err(err) => error_response(&err, endpoint_style),
    }
}

pub async fn chat_completions(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_endpoint(state, headers, ApiStyle::Openai, body).await
}

pub async fn messages(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_endpoint(state, headers, ApiStyle::Claude, body).await
}

pub async fn responses(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_endpoint(state, headers, ApiStyle::Responses, body).await
}

/// `GET /v1/models`: union of visible providers' catalogs, with
/// disabled `(provider, model)` pairs omitted. Authenticates the same way
/// the proxying endpoints do so an unauthenticated caller learns nothing
/// about the provider set.
pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(err) => return error_response(&err, ApiStyle::Openai),
    };

    let user_ctx = UserContext { user_id: caller.user_id.clone(), is_superuser: false };
    let visible = state.orchestrator.registry.list_visible_providers(&user_ctx);

    let mut models = Vec::new();
    for provider in visible {
        if caller
            .allowed_provider_ids
            .as_ref()
            .is_some_and(|allowlist| !allowlist.contains(&provider.id))
        {
            continue;
        }
        let provider_models = match state.orchestrator.store.list_provider_models(&provider.id).await {
            Ok(models) => models,
            Err(_) => continue,
        };
        for model in provider_models.into_iter().filter(|m| !m.disabled) {
            models.push(json!({
                "id": model.model_id,
                "object": "model",
                "owned_by": provider.id,
                "provider": provider.id,
            }));
        }
    }

    Json(json!({ "object": "list", "data": models })).into_response()
}

/// `GET /health`, ambient to every deployment of this stack.
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
