//! Repo handlers: landing view, raw read projections, and every coordinated
//! write around repos, branches, collaborators, artifacts and secrets.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::config::AppState;
use crate::error::{AppError, AppResult};
use crate::ingest::{EventSource, SourceKind};
use crate::models::CookieSession;
use crate::write::{
    AddCollaboratorInput, AddSecretInput, CreateRepoInput, DeleteArtifactInput, EditRepoInput,
    ForkRepoInput, UploadArtifactInput,
};

/// Owners arrive as handles or DIDs in page URLs.
async fn resolve_owner(state: &AppState, owner: &str) -> AppResult<String> {
    if owner.starts_with("did:") {
        return Ok(owner.to_string());
    }
    Ok(state
        .identity
        .resolve_identifier(owner.trim_start_matches('@'))
        .await?
        .did)
}

#[derive(Debug, Deserialize)]
pub struct RefQuery {
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
}

/// GET /api/repos/:owner/:name
pub async fn landing(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<RefQuery>,
) -> AppResult<impl IntoResponse> {
    let did = resolve_owner(&state, &owner).await?;
    let view = state
        .reads
        .repo_landing(&did, &name, query.ref_name.as_deref())
        .await?;
    Ok(Json(view))
}

/// GET /api/repos/:owner/:name/diff?ref=...
pub async fn diff(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<RefQuery>,
) -> AppResult<impl IntoResponse> {
    let did = resolve_owner(&state, &owner).await?;
    let repo = crate::index::repos::get_by_owner_name(state.index.pool(), &did, &name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("repository {name}")))?;
    let ref_name = query
        .ref_name
        .ok_or_else(|| AppError::Validation("ref required".into()))?;
    let value = state.knots.diff(&repo.knot, &repo.did, &repo.name, &ref_name).await?;
    Ok(Json(value))
}

/// GET /api/repos/:owner/:name/compare/:rev1/:rev2
pub async fn compare(
    State(state): State<AppState>,
    Path((owner, name, rev1, rev2)): Path<(String, String, String, String)>,
) -> AppResult<impl IntoResponse> {
    let did = resolve_owner(&state, &owner).await?;
    let repo = crate::index::repos::get_by_owner_name(state.index.pool(), &did, &name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("repository {name}")))?;
    let value = state
        .knots
        .compare(&repo.knot, &repo.did, &repo.name, &rev1, &rev2)
        .await?;
    Ok(Json(value))
}

/// GET /api/repos/:owner/:name/archive?ref=...
pub async fn archive(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<RefQuery>,
) -> AppResult<impl IntoResponse> {
    let did = resolve_owner(&state, &owner).await?;
    let repo = crate::index::repos::get_by_owner_name(state.index.pool(), &did, &name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("repository {name}")))?;
    let ref_name = query
        .ref_name
        .ok_or_else(|| AppError::Validation("ref required".into()))?;
    let value = state
        .knots
        .archive(&repo.knot, &repo.did, &repo.name, &ref_name)
        .await?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
pub struct BlobQuery {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub path: String,
}

/// GET /api/repos/:owner/:name/blob?ref=...&path=...
pub async fn blob(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<BlobQuery>,
) -> AppResult<impl IntoResponse> {
    let did = resolve_owner(&state, &owner).await?;
    let repo = crate::index::repos::get_by_owner_name(state.index.pool(), &did, &name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("repository {name}")))?;
    let blob = state
        .knots
        .blob(&repo.knot, &repo.did, &repo.name, &query.ref_name, &query.path)
        .await?;
    Ok(Json(json!({ "contents": blob.contents, "binary": blob.binary })))
}

/// GET /api/repos/:owner/:name/collaborators
pub async fn list_collaborators(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let did = resolve_owner(&state, &owner).await?;
    let repo = crate::index::repos::get_by_owner_name(state.index.pool(), &did, &name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("repository {name}")))?;
    let rows = crate::index::collaborators::list_for_repo(
        state.index.pool(),
        &repo.at_uri().to_string(),
    )
    .await?;
    let subjects: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| json!({ "subject": row.subject_did, "addedAt": row.created_at }))
        .collect();
    Ok(Json(json!({ "collaborators": subjects })))
}

/// GET /api/repos/:owner/:name/artifacts/:tag
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path((owner, name, tag)): Path<(String, String, String)>,
) -> AppResult<impl IntoResponse> {
    let did = resolve_owner(&state, &owner).await?;
    let repo = crate::index::repos::get_by_owner_name(state.index.pool(), &did, &name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("repository {name}")))?;
    let rows = crate::index::artifacts::list_for_tag(
        state.index.pool(),
        &repo.at_uri().to_string(),
        &tag,
    )
    .await?;
    let artifacts: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "name": row.name,
                "rkey": row.rkey,
                "size": row.size,
                "mimeType": row.mime_type,
                "blobCid": row.blob_cid,
            })
        })
        .collect();
    Ok(Json(json!({ "artifacts": artifacts })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRepoBody {
    pub name: String,
    pub knot: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub website: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// POST /api/repos
pub async fn create_repo(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<CreateRepoBody>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    let row = state
        .writes
        .create_repo(
            &pds,
            CreateRepoInput {
                name: body.name,
                knot: body.knot,
                description: body.description,
                website: body.website,
                topics: body.topics,
                default_branch: body.default_branch,
            },
        )
        .await?;
    // A previously unseen knot becomes an event source.
    if let Err(e) = state
        .ingestor
        .add_source(EventSource {
            kind: SourceKind::Knot,
            host: row.knot.clone(),
        })
        .await
    {
        tracing::warn!(host = %row.knot, error = %e, "could not subscribe to knot events");
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "uri": row.at_uri().to_string(), "name": row.name })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ForkBody {
    pub source: String,
    pub knot: String,
}

/// POST /api/repos/fork
pub async fn fork_repo(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Json(body): Json<ForkBody>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    let row = state
        .writes
        .fork_repo(
            &pds,
            ForkRepoInput {
                source: body.source,
                knot: body.knot,
            },
        )
        .await?;
    if let Err(e) = state
        .ingestor
        .add_source(EventSource {
            kind: SourceKind::Knot,
            host: row.knot.clone(),
        })
        .await
    {
        tracing::warn!(host = %row.knot, error = %e, "could not subscribe to knot events");
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "uri": row.at_uri().to_string(), "name": row.name })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRepoBody {
    pub description: Option<String>,
    pub website: Option<Vec<String>>,
    pub topics: Option<Vec<String>>,
    /// Present-and-null clears the binding; absent leaves it alone.
    #[serde(default, with = "double_option")]
    pub spindle: Option<Option<String>>,
}

/// Distinguishes `"spindle": null` from the field being absent.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

/// PATCH /api/repo/:name
pub async fn edit_repo(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
    Json(body): Json<EditRepoBody>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    let row = state
        .writes
        .edit_repo(
            &pds,
            &name,
            EditRepoInput {
                description: body.description,
                website: body.website,
                topics: body.topics,
                spindle: body.spindle,
            },
        )
        .await?;
    if let Some(spindle) = &row.spindle {
        if let Err(e) = state
            .ingestor
            .add_source(EventSource {
                kind: SourceKind::Spindle,
                host: spindle.clone(),
            })
            .await
        {
            tracing::warn!(host = %spindle, error = %e, "could not subscribe to spindle events");
        }
    }
    Ok(Json(json!({ "uri": row.at_uri().to_string() })))
}

/// DELETE /api/repo/:name
pub async fn delete_repo(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state.writes.delete_repo(&pds, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BranchBody {
    pub branch: String,
}

/// PUT /api/repo/:name/default-branch
pub async fn set_default_branch(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
    Json(body): Json<BranchBody>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state
        .writes
        .set_default_branch(&pds, &name, &body.branch)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/repo/:name/branch/:branch
pub async fn delete_branch(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path((name, branch)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state.writes.delete_branch(&pds, &name, &branch).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/repo/:name/sync
pub async fn fork_sync(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state.writes.fork_sync(&pds, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CollaboratorBody {
    pub subject: String,
}

/// POST /api/repo/:name/collaborators
pub async fn add_collaborator(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
    Json(body): Json<CollaboratorBody>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    let row = state
        .writes
        .add_collaborator(
            &pds,
            AddCollaboratorInput {
                repo_name: name,
                subject: body.subject,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "subject": row.subject_did, "repo": row.repo_at })),
    ))
}

/// DELETE /api/repo/:name/collaborators/:subject
pub async fn remove_collaborator(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path((name, subject)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state.writes.remove_collaborator(&pds, &name, &subject).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadArtifactBody {
    pub tag: String,
    pub name: String,
    pub content_type: String,
    /// Base64-encoded artifact bytes.
    pub data: String,
}

/// POST /api/repo/:name/artifacts
pub async fn upload_artifact(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
    Json(body): Json<UploadArtifactBody>,
) -> AppResult<impl IntoResponse> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&body.data)
        .map_err(|_| AppError::Validation("artifact data is not valid base64".into()))?;
    let pds = state.sessions.authorized_client(&session).await?;
    let row = state
        .writes
        .upload_artifact(
            &pds,
            UploadArtifactInput {
                repo_name: name,
                tag: body.tag,
                file_name: body.name,
                content_type: body.content_type,
                bytes,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "name": row.name, "rkey": row.rkey, "size": row.size })),
    ))
}

/// DELETE /api/repo/:name/artifacts/:rkey
pub async fn delete_artifact(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path((name, rkey)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state
        .writes
        .delete_artifact(
            &pds,
            DeleteArtifactInput {
                repo_name: name,
                rkey,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SecretBody {
    pub key: String,
    pub value: String,
}

/// POST /api/repo/:name/secrets
pub async fn add_secret(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
    Json(body): Json<SecretBody>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state
        .writes
        .add_secret(
            &pds,
            AddSecretInput {
                repo_name: name,
                key: body.key,
                value: body.value,
            },
        )
        .await?;
    Ok(StatusCode::CREATED)
}

/// DELETE /api/repo/:name/secrets/:key
pub async fn remove_secret(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path((name, key)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    state.writes.remove_secret(&pds, &name, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/repo/:name/secrets
pub async fn list_secrets(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    let pds = state.sessions.authorized_client(&session).await?;
    let secrets = state.writes.list_secrets(&pds, &name).await?;
    Ok(Json(json!({ "secrets": secrets })))
}
