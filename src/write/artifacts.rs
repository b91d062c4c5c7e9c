//! Artifact writes
//!
//! The binary goes to the uploader's PDS as a blob; the record pins it to a
//! tag and the index row makes it listable.

use crate::error::{AppError, AppResult};
use crate::index::artifacts::{self, ArtifactRow};
use crate::metrics;
use crate::models::{ArtifactRecord, AtUri, Record, ARTIFACT_NSID};
use crate::services::PdsClient;
use crate::tid;
use crate::write::{Compensator, WriteCoordinator};
use chrono::Utc;

const MAX_ARTIFACT_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UploadArtifactInput {
    pub repo_name: String,
    /// Git object hash of the tag the artifact attaches to.
    pub tag: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeleteArtifactInput {
    pub repo_name: String,
    pub rkey: String,
}

impl WriteCoordinator {
    pub async fn upload_artifact(
        &self,
        pds: &PdsClient,
        input: UploadArtifactInput,
    ) -> AppResult<ArtifactRow> {
        let row = self.require_repo(pds.did(), &input.repo_name).await?;
        self.ensure_can_write(pds, &row).await?;

        if input.file_name.is_empty() || input.file_name.contains('/') {
            return Err(AppError::Validation(format!(
                "invalid artifact name: {}",
                input.file_name
            )));
        }
        if input.tag.is_empty() || !input.tag.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AppError::Validation("invalid tag object hash".into()));
        }
        if input.bytes.is_empty() || input.bytes.len() > MAX_ARTIFACT_BYTES {
            return Err(AppError::Validation(
                "artifacts must be between 1 byte and 256 MiB".into(),
            ));
        }

        // The blob upload happens before the transaction: an orphaned blob
        // on the PDS is garbage-collected once nothing references it.
        let blob = pds.upload_blob(&input.bytes, &input.content_type).await?;

        let rkey = tid::next_tid();
        let now = Utc::now();
        let artifact = ArtifactRow {
            did: pds.did().to_string(),
            rkey: rkey.clone(),
            repo_at: row.at_uri().to_string(),
            tag: input.tag.clone(),
            blob_cid: blob.blob_ref.link.clone(),
            name: input.file_name.clone(),
            size: blob.size as i64,
            mime_type: blob.mime_type.clone(),
            created_at: now,
        };
        let record = Record::Artifact(ArtifactRecord {
            repo: row.at_uri().to_string(),
            tag: input.tag.clone(),
            blob,
            name: input.file_name.clone(),
            created_at: now,
        });

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        if let Err(e) = artifacts::add(&mut *txn, &artifact).await {
            comp.run(txn).await;
            return Err(e);
        }

        let put = match pds.put_record(ARTIFACT_NSID, &rkey, &record, None).await {
            Ok(put) => put,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        comp.created(
            put.uri
                .parse()
                .unwrap_or_else(|_| AtUri::new(pds.did(), ARTIFACT_NSID, &rkey)),
        );

        crate::write::commit_and_save_policy(txn, comp, &self.policy, false).await?;
        metrics::record_write("upload_artifact");
        Ok(artifact)
    }

    pub async fn delete_artifact(
        &self,
        pds: &PdsClient,
        input: DeleteArtifactInput,
    ) -> AppResult<()> {
        crate::validate::validate_rkey(&input.rkey)?;
        let row = self.require_repo(pds.did(), &input.repo_name).await?;
        self.ensure_can_write(pds, &row).await?;

        let artifact = artifacts::get(self.index.pool(), pds.did(), &input.rkey)
            .await?
            .ok_or_else(|| AppError::NotFound("artifact".into()))?;
        if artifact.repo_at != row.at_uri().to_string() {
            return Err(AppError::Validation(
                "artifact does not belong to this repository".into(),
            ));
        }

        let mut txn = self.index.begin().await?;
        let comp = Compensator::new(pds, &self.policy);

        if let Err(e) = artifacts::remove(&mut *txn, &artifact.did, &artifact.rkey).await {
            comp.run(txn).await;
            return Err(e);
        }

        if let Err(e) = pds.delete_record(ARTIFACT_NSID, &artifact.rkey).await {
            comp.run(txn).await;
            return Err(e);
        }

        crate::write::commit_and_save_policy(txn, comp, &self.policy, false).await?;
        metrics::record_write("delete_artifact");
        Ok(())
    }
}
