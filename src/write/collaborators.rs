//! Collaborator writes
//!
//! The grant record lives on the grantor's PDS; the index row and the policy
//! entry are projections of it.

use crate::error::{AppError, AppResult};
use crate::index::collaborators::{self, CollaboratorRow};
use crate::metrics;
use crate::models::{CollaboratorRecord, Record, COLLABORATOR_NSID};
use crate::rbac::repo_resource;
use crate::services::PdsClient;
use crate::tid;
use crate::write::{Compensator, Restore, WriteCoordinator};
use chrono::Utc;

#[derive(Debug, Clone)]
pub struct AddCollaboratorInput {
    pub repo_name: String,
    /// Handle or DID of the account being granted push access.
    pub subject: String,
}

impl WriteCoordinator {
    pub async fn add_collaborator(
        &self,
        pds: &PdsClient,
        input: AddCollaboratorInput,
    ) -> AppResult<CollaboratorRow> {
        let row = self.require_repo(pds.did(), &input.repo_name).await?;
        self.ensure_owner(pds, &row).await?;

        let subject = self.identity.resolve_identifier(&input.subject).await?;
        if subject.did == pds.did() {
            return Err(AppError::Validation(
                "you already own this repository".into(),
            ));
        }
        let repo_at = row.at_uri().to_string();
        if collaborators::get(self.index.pool(), &repo_at, &subject.did)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyExists(format!(
                "{} is already a collaborator",
                subject.handle
            )));
        }

        let rkey = tid::next_tid();
        let now = Utc::now();
        let collaborator = CollaboratorRow {
            did: pds.did().to_string(),
            rkey: rkey.clone(),
            subject_did: subject.did.clone(),
            repo_at: repo_at.clone(),
            created_at: now,
        };
        let record = Record::Collaborator(CollaboratorRecord {
            subject: subject.did.clone(),
            repo: repo_at.clone(),
            created_at: now,
        });

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        if let Err(e) = collaborators::add(&mut *txn, &collaborator).await {
            comp.run(txn).await;
            return Err(e);
        }

        let put = match pds.put_record(COLLABORATOR_NSID, &rkey, &record, None).await {
            Ok(put) => put,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        comp.created(put.uri.parse().unwrap_or_else(|_| {
            crate::models::AtUri::new(pds.did(), COLLABORATOR_NSID, &rkey)
        }));

        let resource = repo_resource(&row.did, &row.name);
        comp.policy_touched();
        if let Err(e) = self.policy.add_collaborator(&resource, &subject.did).await {
            comp.run(txn).await;
            return Err(AppError::Internal(format!(
                "failed to add collaborator: {e}"
            )));
        }

        crate::write::commit_and_save_policy(txn, comp, &self.policy, true).await?;
        metrics::record_write("add_collaborator");
        tracing::info!(repo = %repo_at, subject = %subject.did, "collaborator added");
        Ok(collaborator)
    }

    pub async fn remove_collaborator(
        &self,
        pds: &PdsClient,
        repo_name: &str,
        subject: &str,
    ) -> AppResult<()> {
        let row = self.require_repo(pds.did(), repo_name).await?;
        self.ensure_owner(pds, &row).await?;

        let subject = self.identity.resolve_identifier(subject).await?;
        let repo_at = row.at_uri().to_string();
        let existing = collaborators::get(self.index.pool(), &repo_at, &subject.did)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("{} is not a collaborator", subject.handle))
            })?;

        // Capture the record for best-effort restore on late failure.
        let previous = match pds.get_record(COLLABORATOR_NSID, &existing.rkey).await {
            Ok(current) => Some(Record::from_value(current.value)?),
            Err(AppError::Validation(_)) | Err(AppError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        if let Err(e) = collaborators::remove(&mut *txn, &repo_at, &subject.did).await {
            comp.run(txn).await;
            return Err(e);
        }

        if let Err(e) = pds.delete_record(COLLABORATOR_NSID, &existing.rkey).await {
            comp.run(txn).await;
            return Err(e);
        }
        if let Some(record) = previous {
            comp.restore(Restore {
                collection: COLLABORATOR_NSID.to_string(),
                rkey: existing.rkey.clone(),
                record,
                swap_cid: None,
            });
        }

        let resource = repo_resource(&row.did, &row.name);
        comp.policy_touched();
        if let Err(e) = self.policy.remove_collaborator(&resource, &subject.did).await {
            comp.run(txn).await;
            return Err(e);
        }

        crate::write::commit_and_save_policy(txn, comp, &self.policy, true).await?;
        metrics::record_write("remove_collaborator");
        tracing::info!(repo = %repo_at, subject = %subject.did, "collaborator removed");
        Ok(())
    }
}
