//! Event envelopes from knot and spindle feeds
//!
//! One JSON envelope per WebSocket frame: `{seq, kind, payload}` with a
//! monotonically increasing per-source sequence number. Unknown kinds decode
//! to `Unknown` so newer hosts never wedge an older appview.

use crate::error::{AppError, AppResult};
use crate::models::{LabelOpEntry, LabelValueType};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub seq: i64,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoCreatePayload {
    pub did: String,
    pub rkey: String,
    pub name: String,
    pub knot: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoDeletePayload {
    pub did: String,
    pub rkey: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorAddPayload {
    pub did: String,
    pub rkey: String,
    pub subject: String,
    pub repo: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorRemovePayload {
    pub subject: String,
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDefPayload {
    pub did: String,
    pub rkey: String,
    pub name: String,
    pub value_type: LabelValueType,
    pub scope: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelOpPayload {
    pub did: String,
    pub rkey: String,
    pub subject: String,
    pub ops: Vec<LabelOpEntry>,
    pub performed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineUpdatePayload {
    pub repo: String,
    pub sha: String,
    #[serde(default)]
    pub workflow: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultBranchPayload {
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    RepoCreate(RepoCreatePayload),
    RepoDelete(RepoDeletePayload),
    CollaboratorAdd(CollaboratorAddPayload),
    CollaboratorRemove(CollaboratorRemovePayload),
    LabelDef(LabelDefPayload),
    LabelOp(LabelOpPayload),
    PipelineUpdate(PipelineUpdatePayload),
    DefaultBranch(DefaultBranchPayload),
    Unknown { kind: String },
}

pub fn decode(envelope: &EventEnvelope) -> AppResult<Event> {
    let payload = envelope.payload.clone();
    let event = match envelope.kind.as_str() {
        "repo-create" => Event::RepoCreate(parse(payload)?),
        "repo-delete" => Event::RepoDelete(parse(payload)?),
        "collaborator-add" => Event::CollaboratorAdd(parse(payload)?),
        "collaborator-remove" => Event::CollaboratorRemove(parse(payload)?),
        "label-def" => Event::LabelDef(parse(payload)?),
        "label-op" => Event::LabelOp(parse(payload)?),
        "pipeline-update" => Event::PipelineUpdate(parse(payload)?),
        "default-branch" => Event::DefaultBranch(parse(payload)?),
        other => Event::Unknown {
            kind: other.to_string(),
        },
    };
    Ok(event)
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> AppResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| AppError::Validation(format!("malformed event payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_repo_create() {
        let envelope: EventEnvelope = serde_json::from_value(json!({
            "seq": 42,
            "kind": "repo-create",
            "payload": {
                "did": "did:plc:alice",
                "rkey": "3kao2cr7hgk22",
                "name": "demo",
                "knot": "knot.example.com",
                "createdAt": "2026-01-02T03:04:05Z",
            }
        }))
        .unwrap();
        assert_eq!(envelope.seq, 42);
        match decode(&envelope).unwrap() {
            Event::RepoCreate(payload) => {
                assert_eq!(payload.name, "demo");
                assert_eq!(payload.source, None);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn unknown_kinds_do_not_error() {
        let envelope = EventEnvelope {
            seq: 7,
            kind: "repo-star".into(),
            payload: json!({"whatever": true}),
        };
        assert!(matches!(
            decode(&envelope).unwrap(),
            Event::Unknown { .. }
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let envelope = EventEnvelope {
            seq: 8,
            kind: "repo-create".into(),
            payload: json!({"name": "missing-everything"}),
        };
        assert!(decode(&envelope).is_err());
    }
}
