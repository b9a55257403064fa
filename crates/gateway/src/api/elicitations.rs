//! Elicitation endpoints: list pending, resolve.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use agently_domain::error::{Error, Result};
use agently_domain::model::{Elicitation, ElicitationOutcome};

use crate::api::{api_error, domain_error};
use crate::runtime::elicitation::ElicitKey;
use crate::runtime::events::EventKind;
use crate::state::AppState;

pub async fn pending(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.store.list_pending_elicitations(id) {
        Ok(pending) => Json(pending).into_response(),
        Err(e) => domain_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveAction {
    Accept,
    Decline,
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub action: ResolveAction,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn resolve(
    State(state): State<AppState>,
    Path((id, eid)): Path<(Uuid, Uuid)>,
    Json(body): Json<ResolveBody>,
) -> impl IntoResponse {
    let Some(elicitation) = state.store.get_elicitation(eid).ok().flatten() else {
        return api_error(StatusCode::NOT_FOUND, format!("elicitation {eid} not found"));
    };
    if elicitation.conversation_id != id {
        return api_error(StatusCode::NOT_FOUND, "elicitation not in this conversation");
    }

    let outcome = match body.action {
        ResolveAction::Accept => {
            let payload = body.payload.unwrap_or_else(|| json!({}));
            if let Err(e) = validate_payload(&elicitation.requested_schema, &payload) {
                return api_error(StatusCode::BAD_REQUEST, e.to_string());
            }
            ElicitationOutcome::Accept { payload }
        }
        ResolveAction::Decline => ElicitationOutcome::Decline {
            reason: body.reason,
        },
    };

    match resolve_and_deliver(&state, &elicitation, outcome) {
        Ok(resolved) => Json(json!({
            "id": resolved.id,
            "status": resolved.status,
        }))
        .into_response(),
        Err(e) => domain_error(e),
    }
}

/// Validate an accept payload against the requested JSON-schema subset.
pub fn validate_payload(schema: &Value, payload: &Value) -> Result<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| Error::Validation(format!("requested schema is invalid: {e}")))?;
    if !validator.is_valid(payload) {
        return Err(Error::Validation(
            "payload does not match the requested schema".into(),
        ));
    }
    Ok(())
}

/// Resolve in the store (idempotently), wake the waiter, and publish the
/// `elicitation` event. Shared by the HTTP handler and the CLI awaiter.
/// Repeated calls after the first resolution are no-ops that report the
/// stored resolution.
pub fn resolve_and_deliver(
    state: &AppState,
    elicitation: &Elicitation,
    outcome: ElicitationOutcome,
) -> Result<Elicitation> {
    let resolved = state
        .store
        .resolve_elicitation(elicitation.id, &outcome)?
        .ok_or_else(|| Error::Validation(format!("elicitation {} vanished", elicitation.id)))?;

    // Deliver the stored truth, not the request: a replayed resolve with
    // a different action must not override the first resolution.
    let stored_outcome = match resolved.status {
        agently_domain::model::ElicitationStatus::Accepted => ElicitationOutcome::Accept {
            payload: resolved.payload.clone().unwrap_or_else(|| json!({})),
        },
        agently_domain::model::ElicitationStatus::Declined => ElicitationOutcome::Decline {
            reason: resolved.decline_reason.clone(),
        },
        agently_domain::model::ElicitationStatus::Timeout => ElicitationOutcome::Timeout,
        agently_domain::model::ElicitationStatus::Pending => {
            return Err(Error::Elicitation("resolution did not apply".into()))
        }
    };
    state.elicitations.deliver(
        resolved.conversation_id,
        ElicitKey::Id(resolved.id),
        stored_outcome,
    );

    state.hub.publish(
        resolved.conversation_id,
        resolved.turn_id,
        None,
        EventKind::Elicitation,
        json!({
            "phase": "resolved",
            "id": resolved.id,
            "status": resolved.status,
        }),
    );
    Ok(resolved)
}
