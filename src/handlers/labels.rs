//! Label handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::config::AppState;
use crate::error::AppResult;
use crate::models::{CookieSession, LabelValueType};
use crate::write::{AddLabelDefInput, LabelOpOutcome, PerformLabelOpInput};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddLabelDefBody {
    pub name: String,
    pub value_type: LabelValueType,
    pub scope: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub multiple: bool,
}

/// POST /api/repo/:name/labels
pub async fn add_label_def(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
    Json(body): Json<AddLabelDefBody>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    let def = state
        .writes
        .add_label_def(
            &pds,
            AddLabelDefInput {
                repo_name: name,
                name: body.name,
                value_type: body.value_type,
                scope: body.scope,
                color: body.color,
                multiple: body.multiple,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "uri": def.at_uri().to_string(), "name": def.name })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DefQuery {
    pub uri: String,
}

/// DELETE /api/repo/:name/labels?uri=at://...
pub async fn delete_label_def(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
    Query(query): Query<DefQuery>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state.writes.delete_label_def(&pds, &name, &query.uri).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LabelPair {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct PerformLabelOpBody {
    pub subject: String,
    pub desired: Vec<LabelPair>,
}

/// PUT /api/labels
///
/// The UI submits the desired final state. A no-op submission writes
/// nothing and answers with an `HX-Refresh` header so the page simply
/// reloads its current state.
pub async fn perform_label_op(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<PerformLabelOpBody>,
) -> AppResult<Response> {
    let pds = state.sessions.authorized_client(&session).await?;
    let outcome = state
        .writes
        .perform_label_op(
            &pds,
            PerformLabelOpInput {
                subject: body.subject,
                desired: body
                    .desired
                    .into_iter()
                    .map(|pair| (pair.key, pair.value))
                    .collect(),
            },
        )
        .await?;

    let response = match outcome {
        LabelOpOutcome::NoOp => ([("HX-Refresh", "true")], Json(json!({ "ops": 0 }))).into_response(),
        LabelOpOutcome::Applied { ops, rkey } => {
            Json(json!({ "ops": ops, "rkey": rkey })).into_response()
        }
    };
    Ok(response)
}
