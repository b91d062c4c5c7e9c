//! Language-breakdown cache, keyed by `(repo_at, ref)`

use crate::error::AppResult;
use chrono::Utc;
use sqlx::{Row, SqliteExecutor};
use std::collections::BTreeMap;

pub async fn get<'e, E: SqliteExecutor<'e>>(
    exec: E,
    repo_at: &str,
    ref_name: &str,
) -> AppResult<Option<BTreeMap<String, u64>>> {
    let row = sqlx::query(
        "SELECT languages FROM language_cache WHERE repo_at = ? AND ref_name = ?",
    )
    .bind(repo_at)
    .bind(ref_name)
    .fetch_optional(exec)
    .await?;
    Ok(row.and_then(|row| {
        let raw: String = row.get("languages");
        serde_json::from_str(&raw).ok()
    }))
}

pub async fn put<'e, E: SqliteExecutor<'e>>(
    exec: E,
    repo_at: &str,
    ref_name: &str,
    languages: &BTreeMap<String, u64>,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO language_cache (repo_at, ref_name, languages, computed_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (repo_at, ref_name) DO UPDATE \
         SET languages = excluded.languages, computed_at = excluded.computed_at",
    )
    .bind(repo_at)
    .bind(ref_name)
    .bind(serde_json::to_string(languages)?)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn invalidate_repo<'e, E: SqliteExecutor<'e>>(exec: E, repo_at: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM language_cache WHERE repo_at = ?")
        .bind(repo_at)
        .execute(exec)
        .await?;
    Ok(())
}
