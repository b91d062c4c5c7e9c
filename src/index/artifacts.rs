//! Artifact rows
//!
//! The binary lives as a blob on the uploader's PDS; these rows are the
//! listing projection.

use crate::error::AppResult;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRow {
    pub did: String,
    pub rkey: String,
    pub repo_at: String,
    pub tag: String,
    pub blob_cid: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

fn from_row(row: &SqliteRow) -> AppResult<ArtifactRow> {
    Ok(ArtifactRow {
        did: row.try_get("did")?,
        rkey: row.try_get("rkey")?,
        repo_at: row.try_get("repo_at")?,
        tag: row.try_get("tag")?,
        blob_cid: row.try_get("blob_cid")?,
        name: row.try_get("name")?,
        size: row.try_get("size")?,
        mime_type: row.try_get("mime_type")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn add<'e, E: SqliteExecutor<'e>>(exec: E, artifact: &ArtifactRow) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO artifacts (did, rkey, repo_at, tag, blob_cid, name, size, mime_type, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&artifact.did)
    .bind(&artifact.rkey)
    .bind(&artifact.repo_at)
    .bind(&artifact.tag)
    .bind(&artifact.blob_cid)
    .bind(&artifact.name)
    .bind(artifact.size)
    .bind(&artifact.mime_type)
    .bind(artifact.created_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn remove<'e, E: SqliteExecutor<'e>>(exec: E, did: &str, rkey: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM artifacts WHERE did = ? AND rkey = ?")
        .bind(did)
        .bind(rkey)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get<'e, E: SqliteExecutor<'e>>(
    exec: E,
    did: &str,
    rkey: &str,
) -> AppResult<Option<ArtifactRow>> {
    let row = sqlx::query(
        "SELECT did, rkey, repo_at, tag, blob_cid, name, size, mime_type, created_at \
         FROM artifacts WHERE did = ? AND rkey = ?",
    )
    .bind(did)
    .bind(rkey)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list_for_tag<'e, E: SqliteExecutor<'e>>(
    exec: E,
    repo_at: &str,
    tag: &str,
) -> AppResult<Vec<ArtifactRow>> {
    let rows = sqlx::query(
        "SELECT did, rkey, repo_at, tag, blob_cid, name, size, mime_type, created_at \
         FROM artifacts WHERE repo_at = ? AND tag = ? ORDER BY created_at ASC",
    )
    .bind(repo_at)
    .bind(tag)
    .fetch_all(exec)
    .await?;
    rows.iter().map(from_row).collect()
}
