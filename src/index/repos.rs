//! Repo rows

use crate::error::{AppError, AppResult};
use crate::index::Filters;
use crate::models::{AtUri, REPO_NSID};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteExecutor};

#[derive(Debug, Clone, PartialEq)]
pub struct RepoRow {
    pub did: String,
    pub name: String,
    pub rkey: String,
    pub knot: String,
    pub description: String,
    pub website: Vec<String>,
    pub topics: Vec<String>,
    pub spindle: Option<String>,
    pub source_at_uri: Option<String>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RepoRow {
    pub fn at_uri(&self) -> AtUri {
        AtUri::new(&self.did, REPO_NSID, &self.rkey)
    }
}

fn json_list(raw: &str) -> AppResult<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| AppError::Internal(format!("corrupt list column: {e}")))
}

fn from_row(row: &SqliteRow) -> AppResult<RepoRow> {
    Ok(RepoRow {
        did: row.try_get("did")?,
        name: row.try_get("name")?,
        rkey: row.try_get("rkey")?,
        knot: row.try_get("knot")?,
        description: row.try_get("description")?,
        website: json_list(row.try_get::<String, _>("website")?.as_str())?,
        topics: json_list(row.try_get::<String, _>("topics")?.as_str())?,
        spindle: row.try_get("spindle")?,
        source_at_uri: row.try_get("source_at_uri")?,
        labels: json_list(row.try_get::<String, _>("labels")?.as_str())?,
        created_at: row.try_get("created_at")?,
    })
}

const COLUMNS: &str =
    "did, name, rkey, knot, description, website, topics, spindle, source_at_uri, labels, created_at";

pub async fn add_repo<'e, E: SqliteExecutor<'e>>(exec: E, repo: &RepoRow) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO repos (did, name, rkey, knot, description, website, topics, spindle, source_at_uri, labels, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&repo.did)
    .bind(&repo.name)
    .bind(&repo.rkey)
    .bind(&repo.knot)
    .bind(&repo.description)
    .bind(serde_json::to_string(&repo.website)?)
    .bind(serde_json::to_string(&repo.topics)?)
    .bind(&repo.spindle)
    .bind(&repo.source_at_uri)
    .bind(serde_json::to_string(&repo.labels)?)
    .bind(repo.created_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn update_repo<'e, E: SqliteExecutor<'e>>(exec: E, repo: &RepoRow) -> AppResult<()> {
    sqlx::query(
        "UPDATE repos SET description = ?, website = ?, topics = ?, spindle = ?, labels = ? \
         WHERE did = ? AND rkey = ?",
    )
    .bind(&repo.description)
    .bind(serde_json::to_string(&repo.website)?)
    .bind(serde_json::to_string(&repo.topics)?)
    .bind(&repo.spindle)
    .bind(serde_json::to_string(&repo.labels)?)
    .bind(&repo.did)
    .bind(&repo.rkey)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn delete_repo<'e, E: SqliteExecutor<'e>>(
    exec: E,
    did: &str,
    rkey: &str,
) -> AppResult<()> {
    sqlx::query("DELETE FROM repos WHERE did = ? AND rkey = ?")
        .bind(did)
        .bind(rkey)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get_by_at_uri<'e, E: SqliteExecutor<'e>>(
    exec: E,
    uri: &AtUri,
) -> AppResult<Option<RepoRow>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM repos WHERE did = ? AND rkey = ?"
    ))
    .bind(&uri.did)
    .bind(&uri.rkey)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_owner_name<'e, E: SqliteExecutor<'e>>(
    exec: E,
    did: &str,
    name: &str,
) -> AppResult<Option<RepoRow>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM repos WHERE did = ? AND name = ?"
    ))
    .bind(did)
    .bind(name)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn set_labels<'e, E: SqliteExecutor<'e>>(
    exec: E,
    did: &str,
    rkey: &str,
    labels: &[String],
) -> AppResult<()> {
    sqlx::query("UPDATE repos SET labels = ? WHERE did = ? AND rkey = ?")
        .bind(serde_json::to_string(labels)?)
        .bind(did)
        .bind(rkey)
        .execute(exec)
        .await?;
    Ok(())
}

/// Composable listing used by the explore surfaces and the ingest
/// bootstrapper.
pub async fn list<'e, E: SqliteExecutor<'e>>(exec: E, filters: &Filters) -> AppResult<Vec<RepoRow>> {
    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!("SELECT {COLUMNS} FROM repos"));
    filters.push_where(&mut qb);
    qb.push(" ORDER BY created_at DESC");
    let rows = qb.build().fetch_all(exec).await?;
    rows.iter().map(from_row).collect()
}

/// Every distinct knot host at least one repo depends on.
pub async fn distinct_knots<'e, E: SqliteExecutor<'e>>(exec: E) -> AppResult<Vec<String>> {
    let rows = sqlx::query("SELECT DISTINCT knot FROM repos")
        .fetch_all(exec)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("knot").map_err(AppError::from))
        .collect()
}

/// Every distinct spindle host at least one repo is bound to.
pub async fn distinct_spindles<'e, E: SqliteExecutor<'e>>(exec: E) -> AppResult<Vec<String>> {
    let rows = sqlx::query("SELECT DISTINCT spindle FROM repos WHERE spindle IS NOT NULL")
        .fetch_all(exec)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("spindle").map_err(AppError::from))
        .collect()
}
