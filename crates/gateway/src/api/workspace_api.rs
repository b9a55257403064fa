//! Workspace API: definition document CRUD and the tool catalogue.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::api::{api_error, domain_error};
use crate::state::AppState;
use crate::workspace::WorkspaceKind;

fn parse_kind(raw: &str) -> Result<WorkspaceKind, axum::response::Response> {
    WorkspaceKind::parse(raw)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown kind `{raw}`")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Documents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_kind(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.workspace.list(kind) {
        Ok(names) => Json(names).into_response(),
        Err(e) => domain_error(e),
    }
}

pub async fn get_document(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.workspace.get(kind, &name) {
        Ok(Some(body)) => {
            ([(header::CONTENT_TYPE, "application/yaml")], body).into_response()
        }
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("{name} not found")),
        Err(e) => domain_error(e),
    }
}

pub async fn put_document(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
    body: String,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.workspace.put(kind, &name, &body) {
        Ok(()) => Json(json!({ "saved": name })).into_response(),
        Err(e) => domain_error(e),
    }
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.workspace.delete(kind, &name) {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => domain_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/workspace/tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_size() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct ToolQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_size")]
    pub size: usize,
}

pub async fn tool_catalogue(
    State(state): State<AppState>,
    Query(query): Query<ToolQuery>,
) -> impl IntoResponse {
    let all = if let Some(name) = &query.name {
        state
            .registry
            .get(name)
            .map(|entry| vec![entry.definition])
            .unwrap_or_default()
    } else if let Some(pattern) = &query.pattern {
        state.registry.matching(pattern)
    } else {
        state.registry.list(true)
    };

    let total = all.len();
    let size = query.size.max(1);
    let page: Vec<_> = all.into_iter().skip(query.page * size).take(size).collect();
    Json(json!({
        "tools": page,
        "total": total,
        "page": query.page,
        "size": size,
    }))
}
