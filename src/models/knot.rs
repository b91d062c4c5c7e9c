//! Wire projections returned by knot and spindle RPCs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub commit: Option<CommitMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMeta {
    pub sha: String,
    #[serde(default)]
    pub committer_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRef {
    pub name: String,
    pub sha: String,
    #[serde(default)]
    pub when: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitIdent {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

/// Signature material as the knot ships it: the armored signature plus the
/// exact payload bytes it signs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSignature {
    pub signature: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: GitIdent,
    pub committer: GitIdent,
    #[serde(default)]
    pub signature: Option<CommitSignature>,
}

impl Commit {
    /// First line of the message, the way list views render it.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BranchesResponse {
    #[serde(default)]
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub tags: Vec<TagRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogResponse {
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TreeResponse {
    #[serde(default)]
    pub entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LanguagesResponse {
    #[serde(default)]
    pub languages: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlobResponse {
    pub contents: String,
    #[serde(default)]
    pub binary: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretListing {
    #[serde(default)]
    pub secrets: Vec<SecretMeta>,
}

/// Secret values never come back from a spindle; only names and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMeta {
    pub key: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}
