//! Federated record variants
//!
//! Records travel as typed sum objects discriminated by `$type`. Only the
//! collections this appview writes are modeled; anything else survives as an
//! `Unknown` raw value so event ingestion never chokes on newer kinds.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REPO_NSID: &str = "sh.tangled.repo";
pub const COLLABORATOR_NSID: &str = "sh.tangled.repo.collaborator";
pub const LABEL_DEFINITION_NSID: &str = "sh.tangled.label.definition";
pub const LABEL_OP_NSID: &str = "sh.tangled.label.op";
pub const ARTIFACT_NSID: &str = "sh.tangled.repo.artifact";

/// A record as written to (or read from) a PDS repository.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Repo(RepoRecord),
    Collaborator(CollaboratorRecord),
    LabelDefinition(LabelDefinitionRecord),
    LabelOp(LabelOpRecord),
    Artifact(ArtifactRecord),
    Unknown { record_type: String, value: Value },
}

impl Record {
    pub fn record_type(&self) -> &str {
        match self {
            Record::Repo(_) => REPO_NSID,
            Record::Collaborator(_) => COLLABORATOR_NSID,
            Record::LabelDefinition(_) => LABEL_DEFINITION_NSID,
            Record::LabelOp(_) => LABEL_OP_NSID,
            Record::Artifact(_) => ARTIFACT_NSID,
            Record::Unknown { record_type, .. } => record_type,
        }
    }

    pub fn to_value(&self) -> Result<Value, AppError> {
        let mut value = match self {
            Record::Repo(r) => serde_json::to_value(r)?,
            Record::Collaborator(r) => serde_json::to_value(r)?,
            Record::LabelDefinition(r) => serde_json::to_value(r)?,
            Record::LabelOp(r) => serde_json::to_value(r)?,
            Record::Artifact(r) => serde_json::to_value(r)?,
            Record::Unknown { value, .. } => value.clone(),
        };
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "$type".to_string(),
                Value::String(self.record_type().to_string()),
            );
        }
        Ok(value)
    }

    pub fn from_value(value: Value) -> Result<Record, AppError> {
        let record_type = value
            .get("$type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("record missing $type".into()))?
            .to_string();
        let parsed = match record_type.as_str() {
            REPO_NSID => Record::Repo(serde_json::from_value(value)?),
            COLLABORATOR_NSID => Record::Collaborator(serde_json::from_value(value)?),
            LABEL_DEFINITION_NSID => Record::LabelDefinition(serde_json::from_value(value)?),
            LABEL_OP_NSID => Record::LabelOp(serde_json::from_value(value)?),
            ARTIFACT_NSID => Record::Artifact(serde_json::from_value(value)?),
            _ => Record::Unknown { record_type, value },
        };
        Ok(parsed)
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Record::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// `sh.tangled.repo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoRecord {
    pub name: String,
    pub knot: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub website: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spindle: Option<String>,
    /// AT-URI of the upstream repo when this one is a fork
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// AT-URIs of the label definitions this repo subscribes to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// `sh.tangled.repo.collaborator`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorRecord {
    pub subject: String,
    pub repo: String,
    pub created_at: DateTime<Utc>,
}

/// The shape a label's values must take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelValueType {
    #[serde(rename = "type")]
    pub concrete_type: ConcreteType,
    #[serde(default)]
    pub format: ValueFormat,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcreteType {
    Null,
    String,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueFormat {
    #[default]
    Any,
    Did,
}

/// `sh.tangled.label.definition`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDefinitionRecord {
    pub name: String,
    pub value_type: LabelValueType,
    /// Collection NSIDs whose records may carry this label
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelOperation {
    Add,
    Del,
}

/// One entry inside a label-op record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelOpEntry {
    pub operation: LabelOperation,
    /// AT-URI of the label definition
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// `sh.tangled.label.op` - an append-only batch of label mutations against
/// one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelOpRecord {
    pub subject: String,
    pub ops: Vec<LabelOpEntry>,
    pub performed_at: DateTime<Utc>,
}

/// Reference to a blob stored on a PDS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    #[serde(rename = "$type")]
    pub blob_type: String,
    #[serde(rename = "ref")]
    pub blob_ref: BlobLink,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobLink {
    #[serde(rename = "$link")]
    pub link: String,
}

/// `sh.tangled.repo.artifact`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub repo: String,
    /// Git object hash of the tag the artifact is attached to
    pub tag: String,
    pub blob: BlobRef,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
