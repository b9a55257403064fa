//! Payload retrieval: raw bytes or the JSON metadata envelope.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::api::{api_error, domain_error};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PayloadQuery {
    #[serde(default)]
    pub raw: Option<u8>,
    #[serde(default)]
    pub meta: Option<u8>,
}

pub async fn get_payload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PayloadQuery>,
) -> impl IntoResponse {
    let (meta, bytes) = match state.store.read_payload(&id) {
        Ok(Some(found)) => found,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, format!("payload {id} not found")),
        Err(e) => return domain_error(e),
    };

    if query.meta == Some(1) {
        return Json(meta).into_response();
    }

    if bytes.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    ([(header::CONTENT_TYPE, meta.media_type)], bytes).into_response()
}
