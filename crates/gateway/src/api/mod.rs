//! HTTP surface: `/v1/api` (conversations, streaming, elicitations,
//! payloads) and `/v1/workspace` (definition documents + tool catalogue).

pub mod conversations;
pub mod elicitations;
pub mod payloads;
pub mod stream;
pub mod workspace_api;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Standardized JSON error body: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Map a domain error onto the HTTP surface.
pub(crate) fn domain_error(e: agently_domain::error::Error) -> Response {
    use agently_domain::error::Error;
    match &e {
        Error::Validation(_) | Error::ToolNotFound(_) => {
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        Error::Config(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Requesting user: `x-agently-user` header or the local default.
pub(crate) fn user_subject(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-agently-user")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("default")
        .to_string()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/conversations",
            post(conversations::create).get(conversations::list),
        )
        .route(
            "/conversations/:id/messages",
            post(conversations::post_message).get(conversations::get_messages),
        )
        .route("/conversations/:id/cancel", post(conversations::cancel))
        .route("/conversations/:id/stream", get(stream::sse))
        .route("/conversations/:id/poll", get(stream::poll))
        .route(
            "/conversations/:id/elicitations/pending",
            get(elicitations::pending),
        )
        .route(
            "/conversations/:id/elicitations/:eid/resolve",
            post(elicitations::resolve),
        )
        .route("/payload/:id", get(payloads::get_payload));

    let workspace = Router::new()
        .route("/tool", get(workspace_api::tool_catalogue))
        .route("/:kind", get(workspace_api::list_kind))
        .route(
            "/:kind/:name",
            get(workspace_api::get_document)
                .put(workspace_api::put_document)
                .delete(workspace_api::delete_document),
        );

    Router::new()
        .route("/health", get(health))
        .nest("/v1/api", api)
        .nest("/v1/workspace", workspace)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
