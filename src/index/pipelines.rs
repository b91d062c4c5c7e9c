//! CI pipeline status rows, fed by spindle events

use crate::error::AppResult;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatusRow {
    pub spindle: String,
    pub repo_at: String,
    pub sha: String,
    pub workflow: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

fn from_row(row: &SqliteRow) -> AppResult<PipelineStatusRow> {
    Ok(PipelineStatusRow {
        spindle: row.try_get("spindle")?,
        repo_at: row.try_get("repo_at")?,
        sha: row.try_get("sha")?,
        workflow: row.try_get("workflow")?,
        status: row.try_get("status")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn upsert<'e, E: SqliteExecutor<'e>>(exec: E, status: &PipelineStatusRow) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO pipeline_statuses (spindle, repo_at, sha, workflow, status, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (repo_at, sha, workflow) DO UPDATE \
         SET spindle = excluded.spindle, status = excluded.status, updated_at = excluded.updated_at",
    )
    .bind(&status.spindle)
    .bind(&status.repo_at)
    .bind(&status.sha)
    .bind(&status.workflow)
    .bind(&status.status)
    .bind(status.updated_at)
    .execute(exec)
    .await?;
    Ok(())
}

/// Latest status per commit in one page of the log.
pub async fn for_shas<'e, E: SqliteExecutor<'e>>(
    exec: E,
    repo_at: &str,
    shas: &[String],
) -> AppResult<HashMap<String, PipelineStatusRow>> {
    if shas.is_empty() {
        return Ok(HashMap::new());
    }
    let mut qb = sqlx::QueryBuilder::new(
        "SELECT spindle, repo_at, sha, workflow, status, updated_at \
         FROM pipeline_statuses WHERE repo_at = ",
    );
    qb.push_bind(repo_at.to_string());
    qb.push(" AND sha IN (");
    for (i, sha) in shas.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push_bind(sha.clone());
    }
    qb.push(") ORDER BY updated_at ASC");
    let rows = qb.build().fetch_all(exec).await?;
    let mut map = HashMap::new();
    for row in &rows {
        let status = from_row(row)?;
        // Later updates win.
        map.insert(status.sha.clone(), status);
    }
    Ok(map)
}

pub async fn delete_for_repo<'e, E: SqliteExecutor<'e>>(exec: E, repo_at: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM pipeline_statuses WHERE repo_at = ?")
        .bind(repo_at)
        .execute(exec)
        .await?;
    Ok(())
}
