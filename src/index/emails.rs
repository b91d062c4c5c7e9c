//! Commit email -> DID mapping and registered signing keys

use crate::error::AppResult;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteExecutor};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct PublicKeyRow {
    pub did: String,
    pub name: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

pub async fn set_email_did<'e, E: SqliteExecutor<'e>>(
    exec: E,
    email: &str,
    did: &str,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO email_dids (email, did) VALUES (?, ?) \
         ON CONFLICT (email) DO UPDATE SET did = excluded.did",
    )
    .bind(email)
    .bind(did)
    .execute(exec)
    .await?;
    Ok(())
}

/// Map a batch of commit emails to DIDs. Unknown emails are simply absent.
pub async fn map_emails<'e, E: SqliteExecutor<'e>>(
    exec: E,
    emails: &[String],
) -> AppResult<HashMap<String, String>> {
    if emails.is_empty() {
        return Ok(HashMap::new());
    }
    let mut qb = sqlx::QueryBuilder::new("SELECT email, did FROM email_dids WHERE email IN (");
    for (i, email) in emails.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push_bind(email.clone());
    }
    qb.push(")");
    let rows = qb.build().fetch_all(exec).await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("email"), row.get("did")))
        .collect())
}

pub async fn add_public_key<'e, E: SqliteExecutor<'e>>(
    exec: E,
    did: &str,
    name: &str,
    key: &str,
) -> AppResult<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO public_keys (did, name, key, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(did)
    .bind(name)
    .bind(key)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn keys_for_did<'e, E: SqliteExecutor<'e>>(exec: E, did: &str) -> AppResult<Vec<String>> {
    let rows = sqlx::query("SELECT key FROM public_keys WHERE did = ?")
        .bind(did)
        .fetch_all(exec)
        .await?;
    Ok(rows.iter().map(|row| row.get("key")).collect())
}
