//! Collaborator rows
//!
//! The authoritative grant lives on the grantor's PDS; these rows are the
//! query-side convenience.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

#[derive(Debug, Clone, PartialEq)]
pub struct CollaboratorRow {
    pub did: String,
    pub rkey: String,
    pub subject_did: String,
    pub repo_at: String,
    pub created_at: DateTime<Utc>,
}

fn from_row(row: &SqliteRow) -> AppResult<CollaboratorRow> {
    Ok(CollaboratorRow {
        did: row.try_get("did")?,
        rkey: row.try_get("rkey")?,
        subject_did: row.try_get("subject_did")?,
        repo_at: row.try_get("repo_at")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn add<'e, E: SqliteExecutor<'e>>(exec: E, row: &CollaboratorRow) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO collaborators (did, rkey, subject_did, repo_at, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&row.did)
    .bind(&row.rkey)
    .bind(&row.subject_did)
    .bind(&row.repo_at)
    .bind(row.created_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn remove<'e, E: SqliteExecutor<'e>>(
    exec: E,
    repo_at: &str,
    subject_did: &str,
) -> AppResult<()> {
    sqlx::query("DELETE FROM collaborators WHERE repo_at = ? AND subject_did = ?")
        .bind(repo_at)
        .bind(subject_did)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get<'e, E: SqliteExecutor<'e>>(
    exec: E,
    repo_at: &str,
    subject_did: &str,
) -> AppResult<Option<CollaboratorRow>> {
    let row = sqlx::query(
        "SELECT did, rkey, subject_did, repo_at, created_at FROM collaborators \
         WHERE repo_at = ? AND subject_did = ?",
    )
    .bind(repo_at)
    .bind(subject_did)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list_for_repo<'e, E: SqliteExecutor<'e>>(
    exec: E,
    repo_at: &str,
) -> AppResult<Vec<CollaboratorRow>> {
    let rows = sqlx::query(
        "SELECT did, rkey, subject_did, repo_at, created_at FROM collaborators \
         WHERE repo_at = ? ORDER BY created_at ASC",
    )
    .bind(repo_at)
    .fetch_all(exec)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn delete_for_repo<'e, E: SqliteExecutor<'e>>(exec: E, repo_at: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM collaborators WHERE repo_at = ?")
        .bind(repo_at)
        .execute(exec)
        .await
        .map_err(AppError::from)?;
    Ok(())
}
