//! Label definition and operation rows
//!
//! Ops are append-only; the label state for a subject is the deterministic
//! reduction of its ordered op-log, computed in the write path.

use crate::error::{AppError, AppResult};
use crate::models::{AtUri, LabelOpEntry, LabelOperation, LabelValueType, LABEL_DEFINITION_NSID};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

#[derive(Debug, Clone, PartialEq)]
pub struct LabelDefRow {
    pub did: String,
    pub rkey: String,
    pub name: String,
    pub value_type: LabelValueType,
    pub scope: Vec<String>,
    pub color: Option<String>,
    pub multiple: bool,
    pub created_at: DateTime<Utc>,
}

impl LabelDefRow {
    pub fn at_uri(&self) -> AtUri {
        AtUri::new(&self.did, LABEL_DEFINITION_NSID, &self.rkey)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelOpRow {
    pub did: String,
    pub rkey: String,
    pub subject: String,
    pub operation: LabelOperation,
    pub operand_key: String,
    pub operand_value: String,
    pub performed_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

fn def_from_row(row: &SqliteRow) -> AppResult<LabelDefRow> {
    let value_type: String = row.try_get("value_type")?;
    let scope: String = row.try_get("scope")?;
    Ok(LabelDefRow {
        did: row.try_get("did")?,
        rkey: row.try_get("rkey")?,
        name: row.try_get("name")?,
        value_type: serde_json::from_str(&value_type)
            .map_err(|e| AppError::Internal(format!("corrupt value_type column: {e}")))?,
        scope: serde_json::from_str(&scope)
            .map_err(|e| AppError::Internal(format!("corrupt scope column: {e}")))?,
        color: row.try_get("color")?,
        multiple: row.try_get("multiple")?,
        created_at: row.try_get("created_at")?,
    })
}

fn op_from_row(row: &SqliteRow) -> AppResult<LabelOpRow> {
    let operation: String = row.try_get("operation")?;
    let operation = match operation.as_str() {
        "add" => LabelOperation::Add,
        "del" => LabelOperation::Del,
        other => {
            return Err(AppError::Internal(format!(
                "corrupt operation column: {other}"
            )))
        }
    };
    Ok(LabelOpRow {
        did: row.try_get("did")?,
        rkey: row.try_get("rkey")?,
        subject: row.try_get("subject")?,
        operation,
        operand_key: row.try_get("operand_key")?,
        operand_value: row.try_get("operand_value")?,
        performed_at: row.try_get("performed_at")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

fn operation_str(op: LabelOperation) -> &'static str {
    match op {
        LabelOperation::Add => "add",
        LabelOperation::Del => "del",
    }
}

pub async fn add_def<'e, E: SqliteExecutor<'e>>(exec: E, def: &LabelDefRow) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO label_defs (did, rkey, name, value_type, scope, color, multiple, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&def.did)
    .bind(&def.rkey)
    .bind(&def.name)
    .bind(serde_json::to_string(&def.value_type)?)
    .bind(serde_json::to_string(&def.scope)?)
    .bind(&def.color)
    .bind(def.multiple)
    .bind(def.created_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn delete_def<'e, E: SqliteExecutor<'e>>(exec: E, did: &str, rkey: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM label_defs WHERE did = ? AND rkey = ?")
        .bind(did)
        .bind(rkey)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get_def<'e, E: SqliteExecutor<'e>>(
    exec: E,
    uri: &AtUri,
) -> AppResult<Option<LabelDefRow>> {
    let row = sqlx::query(
        "SELECT did, rkey, name, value_type, scope, color, multiple, created_at \
         FROM label_defs WHERE did = ? AND rkey = ?",
    )
    .bind(&uri.did)
    .bind(&uri.rkey)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(def_from_row).transpose()
}

/// Record one batch of ops. The rkey is shared by every entry of the batch.
pub async fn insert_ops(
    conn: &mut sqlx::SqliteConnection,
    did: &str,
    rkey: &str,
    subject: &str,
    ops: &[LabelOpEntry],
    performed_at: DateTime<Utc>,
) -> AppResult<()> {
    let indexed_at = Utc::now();
    for op in ops {
        sqlx::query(
            "INSERT OR IGNORE INTO label_ops \
             (did, rkey, subject, operation, operand_key, operand_value, performed_at, indexed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(did)
        .bind(rkey)
        .bind(subject)
        .bind(operation_str(op.operation))
        .bind(&op.key)
        .bind(&op.value)
        .bind(performed_at)
        .bind(indexed_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// The ordered op-log for one subject.
pub async fn ops_for_subject<'e, E: SqliteExecutor<'e>>(
    exec: E,
    subject: &str,
) -> AppResult<Vec<LabelOpRow>> {
    let rows = sqlx::query(
        "SELECT did, rkey, subject, operation, operand_key, operand_value, performed_at, indexed_at \
         FROM label_ops WHERE subject = ? ORDER BY id ASC",
    )
    .bind(subject)
    .fetch_all(exec)
    .await?;
    rows.iter().map(op_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use crate::models::{ConcreteType, ValueFormat};

    #[tokio::test]
    async fn defs_and_ops_round_trip() {
        let index = Index::in_memory().await.unwrap();
        let def = LabelDefRow {
            did: "did:plc:alice".into(),
            rkey: "3kdef".into(),
            name: "status".into(),
            value_type: LabelValueType {
                concrete_type: ConcreteType::String,
                format: ValueFormat::Any,
                enum_values: vec!["open".into()],
            },
            scope: vec!["sh.tangled.repo".into()],
            color: None,
            multiple: false,
            created_at: Utc::now(),
        };
        add_def(index.pool(), &def).await.unwrap();
        let found = get_def(index.pool(), &def.at_uri()).await.unwrap().unwrap();
        assert_eq!(found, def);

        let subject = "at://did:plc:alice/sh.tangled.repo/3krepo";
        let ops = vec![LabelOpEntry {
            operation: LabelOperation::Add,
            key: def.at_uri().to_string(),
            value: "open".into(),
        }];
        let mut conn = index.pool().acquire().await.unwrap();
        insert_ops(&mut *conn, "did:plc:alice", "3kop", subject, &ops, Utc::now())
            .await
            .unwrap();
        drop(conn);
        let log = ops_for_subject(index.pool(), subject).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, LabelOperation::Add);
        assert_eq!(log[0].operand_value, "open");
    }
}
