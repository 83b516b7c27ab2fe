//! The daemon's HTTP surface: the OpenAI-style proxy endpoints, the
//! `/upstream/:model/*rest` passthrough, and the read-only control/admin
//! endpoints (`/processes`, `/healthz`).
//!
//! One shared `Arc`-wrapped state struct, handlers returning `impl
//! IntoResponse`, JSON for everything except the proxied bodies themselves.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;

use crate::process::manager::ProcessManager;
use crate::proxy::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProcessManager>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/processes", get(list_processes))
        .route("/v1/chat/completions", any(openai_proxy))
        .route("/v1/completions", any(openai_proxy))
        .route("/v1/embeddings", any(openai_proxy))
        .route("/v1/models", get(list_models))
        .route("/slots", any(aggregate_proxy))
        .route("/props", any(aggregate_proxy))
        .route("/upstream/{*rest}", any(upstream_proxy))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct ModelListEntry {
    id: String,
    object: &'static str,
}

/// OpenAI-shaped `/v1/models`: every non-`unlisted` model, by id.
async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let entries: Vec<ModelListEntry> = state
        .manager
        .each_process()
        .await
        .into_iter()
        .filter(|p| !p.unlisted)
        .map(|p| ModelListEntry {
            id: p.model,
            object: "model",
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": entries }))
}

async fn list_processes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.each_process().await)
}

/// The model name for an OpenAI-style body is the JSON `"model"` field, not
/// the URL — this is the one handler that has to peek at the body before
/// dispatch can resolve who to talk to.
async fn openai_proxy(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("reading request body: {err}")).into_response()
        }
    };
    let model_name = match serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
    {
        Some(name) => name,
        None => return (StatusCode::BAD_REQUEST, "request body missing \"model\"").into_response(),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(parts.uri.path());

    match state
        .dispatcher
        .forward(&model_name, method, path_and_query, headers, axum::body::Body::from(bytes))
        .await
    {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

/// `/upstream/:model/...` forwards the remainder of the path verbatim,
/// including WebSocket upgrade requests, which are bridged as raw bytes
/// rather than handled as ordinary HTTP.
async fn upstream_proxy(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    method: Method,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let Some((model_name, forwarded_path)) = crate::proxy::dispatcher::split_upstream_path(&rest) else {
        return (StatusCode::BAD_REQUEST, "expected /upstream/<model>/<path>").into_response();
    };
    let model_name = model_name.to_string();
    let path_and_query = match request.uri().query() {
        Some(q) => format!("/{forwarded_path}?{q}"),
        None => format!("/{forwarded_path}"),
    };

    let is_upgrade = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_upgrade {
        return match state
            .dispatcher
            .forward_upgrade(&model_name, request, &path_and_query)
            .await
        {
            Ok(response) => response,
            Err(err) => error_response(err),
        };
    }

    let (_, body) = request.into_parts();
    match state
        .dispatcher
        .forward(&model_name, method, &path_and_query, headers, body)
        .await
    {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

/// Non-model-scoped aggregate views (`/slots`, `/props`): there is no model
/// name in the request to resolve, so dispatch goes to whichever backend
/// most recently came READY.
async fn aggregate_proxy(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(request.uri().path())
        .to_string();
    let (_, body) = request.into_parts();

    match state
        .dispatcher
        .forward_aggregate(&state.manager, method, &path_and_query, headers, body)
        .await
    {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

fn error_response(err: crate::error::SwapError) -> Response {
    let status = err.status_code();
    (status, err.to_string()).into_response()
}
