//! Access policy
//!
//! The policy engine is an opaque oracle injected into the write coordinator.
//! Mutating writes bracket their policy changes: mutate in memory, persist
//! with `save_policy` once the write commits, and `load_policy` to resync
//! from the backing store when anything downstream fails.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Policy resource name for a repo: `<owner-did>/<name>`.
pub fn repo_resource(owner_did: &str, name: &str) -> String {
    format!("{owner_did}/{name}")
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Resync in-memory state from the backing store, discarding unsaved
    /// mutations.
    async fn load_policy(&self) -> AppResult<()>;

    /// Persist in-memory state to the backing store.
    async fn save_policy(&self) -> AppResult<()>;

    async fn add_repo(&self, owner_did: &str, knot: &str, resource: &str) -> AppResult<()>;

    async fn remove_repo(&self, owner_did: &str, knot: &str, resource: &str) -> AppResult<()>;

    async fn add_collaborator(&self, resource: &str, subject_did: &str) -> AppResult<()>;

    async fn remove_collaborator(&self, resource: &str, subject_did: &str) -> AppResult<()>;

    /// May `did` push to (and otherwise administer content of) `resource`?
    async fn can_write(&self, did: &str, resource: &str) -> AppResult<bool>;
}

#[derive(Debug, Default, Clone)]
struct PolicyData {
    /// (owner, knot, resource)
    repos: HashSet<(String, String, String)>,
    /// (resource, subject)
    collaborators: HashSet<(String, String)>,
}

impl PolicyData {
    fn can_write(&self, did: &str, resource: &str) -> bool {
        self.repos
            .iter()
            .any(|(owner, _, res)| owner.as_str() == did && res.as_str() == resource)
            || self
                .collaborators
                .contains(&(resource.to_string(), did.to_string()))
    }
}

/// In-process policy engine. `saved` stands in for the backing store.
#[derive(Default)]
pub struct InMemoryPolicy {
    working: RwLock<PolicyData>,
    saved: RwLock<PolicyData>,
}

impl InMemoryPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyEngine for InMemoryPolicy {
    async fn load_policy(&self) -> AppResult<()> {
        let saved = self.saved.read().await.clone();
        *self.working.write().await = saved;
        Ok(())
    }

    async fn save_policy(&self) -> AppResult<()> {
        let working = self.working.read().await.clone();
        *self.saved.write().await = working;
        Ok(())
    }

    async fn add_repo(&self, owner_did: &str, knot: &str, resource: &str) -> AppResult<()> {
        self.working.write().await.repos.insert((
            owner_did.to_string(),
            knot.to_string(),
            resource.to_string(),
        ));
        Ok(())
    }

    async fn remove_repo(&self, owner_did: &str, knot: &str, resource: &str) -> AppResult<()> {
        let key = (
            owner_did.to_string(),
            knot.to_string(),
            resource.to_string(),
        );
        let mut working = self.working.write().await;
        if !working.repos.remove(&key) {
            return Err(AppError::Internal(format!(
                "policy has no repo {resource} on {knot}"
            )));
        }
        working
            .collaborators
            .retain(|(res, _)| res.as_str() != resource);
        Ok(())
    }

    async fn add_collaborator(&self, resource: &str, subject_did: &str) -> AppResult<()> {
        self.working
            .write()
            .await
            .collaborators
            .insert((resource.to_string(), subject_did.to_string()));
        Ok(())
    }

    async fn remove_collaborator(&self, resource: &str, subject_did: &str) -> AppResult<()> {
        self.working
            .write()
            .await
            .collaborators
            .remove(&(resource.to_string(), subject_did.to_string()));
        Ok(())
    }

    async fn can_write(&self, did: &str, resource: &str) -> AppResult<bool> {
        Ok(self.working.read().await.can_write(did, resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_discards_unsaved_mutations() {
        let policy = InMemoryPolicy::new();
        policy
            .add_repo("did:plc:alice", "knot.example.com", "did:plc:alice/demo")
            .await
            .unwrap();
        policy.save_policy().await.unwrap();

        policy
            .add_collaborator("did:plc:alice/demo", "did:plc:bob")
            .await
            .unwrap();
        assert!(policy
            .can_write("did:plc:bob", "did:plc:alice/demo")
            .await
            .unwrap());

        // Compensation path: the unsaved collaborator grant evaporates.
        policy.load_policy().await.unwrap();
        assert!(!policy
            .can_write("did:plc:bob", "did:plc:alice/demo")
            .await
            .unwrap());
        // The saved repo grant survives.
        assert!(policy
            .can_write("did:plc:alice", "did:plc:alice/demo")
            .await
            .unwrap());
    }
}
