//! Event-source cursors and the dead-letter log

use crate::error::AppResult;
use chrono::Utc;
use sqlx::{Row, SqliteExecutor};

#[derive(Debug, Clone, PartialEq)]
pub struct SourceCursor {
    pub host: String,
    pub kind: String,
    pub cursor: i64,
}

pub async fn get<'e, E: SqliteExecutor<'e>>(exec: E, host: &str) -> AppResult<Option<SourceCursor>> {
    let row = sqlx::query("SELECT host, kind, cursor FROM event_cursors WHERE host = ?")
        .bind(host)
        .fetch_optional(exec)
        .await?;
    Ok(row.map(|row| SourceCursor {
        host: row.get("host"),
        kind: row.get("kind"),
        cursor: row.get("cursor"),
    }))
}

/// Register a source at cursor 0 if it is not already tracked.
pub async fn register<'e, E: SqliteExecutor<'e>>(exec: E, host: &str, kind: &str) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO event_cursors (host, kind, cursor, updated_at) VALUES (?, ?, 0, ?) \
         ON CONFLICT (host) DO NOTHING",
    )
    .bind(host)
    .bind(kind)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

/// Persist a new cursor position. The stored cursor never moves backwards.
pub async fn advance<'e, E: SqliteExecutor<'e>>(exec: E, host: &str, seq: i64) -> AppResult<()> {
    sqlx::query("UPDATE event_cursors SET cursor = ?, updated_at = ? WHERE host = ? AND cursor < ?")
        .bind(seq)
        .bind(Utc::now())
        .bind(host)
        .bind(seq)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn remove<'e, E: SqliteExecutor<'e>>(exec: E, host: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM event_cursors WHERE host = ?")
        .bind(host)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn list<'e, E: SqliteExecutor<'e>>(exec: E) -> AppResult<Vec<SourceCursor>> {
    let rows = sqlx::query("SELECT host, kind, cursor FROM event_cursors ORDER BY host")
        .fetch_all(exec)
        .await?;
    Ok(rows
        .iter()
        .map(|row| SourceCursor {
            host: row.get("host"),
            kind: row.get("kind"),
            cursor: row.get("cursor"),
        })
        .collect())
}

/// Park an event that exhausted its retries.
pub async fn dead_letter<'e, E: SqliteExecutor<'e>>(
    exec: E,
    host: &str,
    seq: i64,
    kind: &str,
    payload: &str,
    error: &str,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO dead_events (host, seq, kind, payload, error, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(host)
    .bind(seq)
    .bind(kind)
    .bind(payload)
    .bind(error)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn dead_letter_count<'e, E: SqliteExecutor<'e>>(exec: E, host: &str) -> AppResult<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM dead_events WHERE host = ?")
        .bind(host)
        .fetch_one(exec)
        .await?;
    Ok(row.get("n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let index = Index::in_memory().await.unwrap();
        register(index.pool(), "knot.example.com", "knot")
            .await
            .unwrap();
        // Double registration is a no-op.
        register(index.pool(), "knot.example.com", "knot")
            .await
            .unwrap();

        advance(index.pool(), "knot.example.com", 42).await.unwrap();
        advance(index.pool(), "knot.example.com", 7).await.unwrap();
        let cursor = get(index.pool(), "knot.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.cursor, 42);

        advance(index.pool(), "knot.example.com", 43).await.unwrap();
        let cursor = get(index.pool(), "knot.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.cursor, 43);
    }
}
