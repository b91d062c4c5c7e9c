//! Repo writes: create, fork, edit, delete, and branch administration

use crate::error::{AppError, AppResult};
use crate::index::repos::{self, RepoRow};
use crate::index::{collaborators, languages, pipelines};
use crate::metrics;
use crate::models::{AtUri, Record, RepoRecord, REPO_NSID};
use crate::rbac::repo_resource;
use crate::services::{validate_remote_host, PdsClient};
use crate::tid;
use crate::validate;
use crate::write::{Compensator, Restore, WriteCoordinator};
use chrono::Utc;

#[derive(Debug, Clone)]
pub struct CreateRepoInput {
    pub name: String,
    pub knot: String,
    pub description: String,
    pub website: Vec<String>,
    pub topics: Vec<String>,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ForkRepoInput {
    /// AT-URI of the upstream repo.
    pub source: String,
    /// Knot the fork will live on; may differ from the source knot.
    pub knot: String,
}

#[derive(Debug, Clone, Default)]
pub struct EditRepoInput {
    pub description: Option<String>,
    pub website: Option<Vec<String>>,
    pub topics: Option<Vec<String>>,
    /// `Some(None)` clears the spindle binding.
    pub spindle: Option<Option<String>>,
}

impl WriteCoordinator {
    pub(crate) async fn require_repo(&self, did: &str, name: &str) -> AppResult<RepoRow> {
        repos::get_by_owner_name(self.index.pool(), did, name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("repository {name}")))
    }

    pub(crate) async fn ensure_owner(&self, pds: &PdsClient, row: &RepoRow) -> AppResult<()> {
        if row.did != pds.did() {
            return Err(AppError::Forbidden(
                "only the repository owner may do that".into(),
            ));
        }
        Ok(())
    }

    pub(crate) async fn ensure_can_write(&self, pds: &PdsClient, row: &RepoRow) -> AppResult<()> {
        if row.did == pds.did() {
            return Ok(());
        }
        let resource = repo_resource(&row.did, &row.name);
        if self.policy.can_write(pds.did(), &resource).await? {
            return Ok(());
        }
        Err(AppError::Forbidden(
            "you do not have write access to this repository".into(),
        ))
    }

    fn validate_repo_input(&self, input: &CreateRepoInput) -> AppResult<()> {
        validate::validate_repo_name(&input.name)?;
        validate_remote_host(&input.knot, self.allow_insecure)?;
        for topic in &input.topics {
            validate::validate_topic(topic)?;
        }
        for website in &input.website {
            validate::validate_website(website)?;
        }
        Ok(())
    }

    /// Create a repo: index row, `sh.tangled.repo` record, policy grant, and
    /// the backing git repository on the knot.
    pub async fn create_repo(&self, pds: &PdsClient, input: CreateRepoInput) -> AppResult<RepoRow> {
        self.validate_repo_input(&input)?;
        if repos::get_by_owner_name(self.index.pool(), pds.did(), &input.name)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyExists(format!(
                "repository {} already exists",
                input.name
            )));
        }

        let rkey = tid::next_tid();
        let now = Utc::now();
        let row = RepoRow {
            did: pds.did().to_string(),
            name: input.name.clone(),
            rkey: rkey.clone(),
            knot: input.knot.clone(),
            description: input.description.clone(),
            website: input.website.clone(),
            topics: input.topics.clone(),
            spindle: None,
            source_at_uri: None,
            labels: vec![],
            created_at: now,
        };
        let record = Record::Repo(RepoRecord {
            name: input.name.clone(),
            knot: input.knot.clone(),
            created_at: now,
            description: input.description.clone(),
            website: input.website.clone(),
            topics: input.topics.clone(),
            spindle: None,
            source: None,
            labels: vec![],
        });

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        if let Err(e) = repos::add_repo(&mut *txn, &row).await {
            comp.run(txn).await;
            return Err(e);
        }

        let put = match pds.put_record(REPO_NSID, &rkey, &record, None).await {
            Ok(put) => put,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        let uri: AtUri = put.uri.parse().unwrap_or_else(|_| row.at_uri());
        comp.created(uri);

        let resource = repo_resource(pds.did(), &input.name);
        comp.policy_touched();
        if let Err(e) = self.policy.add_repo(pds.did(), &input.knot, &resource).await {
            comp.run(txn).await;
            return Err(e);
        }

        let token = match self
            .minter
            .mint(pds, &input.knot, "sh.tangled.repo.create", None)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .knots
            .create_repo(
                &input.knot,
                &token,
                pds.did(),
                &input.name,
                input.default_branch.as_deref(),
            )
            .await
        {
            comp.run(txn).await;
            return Err(e);
        }

        crate::write::commit_and_save_policy(txn, comp, &self.policy, true).await?;
        metrics::record_write("create_repo");
        tracing::info!(did = pds.did(), name = %input.name, knot = %input.knot, "repo created");
        Ok(row)
    }

    /// Fork a repo. The fork keeps the upstream name; a name collision under
    /// the forking account fails with "exists" rather than renaming.
    pub async fn fork_repo(&self, pds: &PdsClient, input: ForkRepoInput) -> AppResult<RepoRow> {
        let source_uri: AtUri = input.source.parse()?;
        validate_remote_host(&input.knot, self.allow_insecure)?;
        let source = repos::get_by_at_uri(self.index.pool(), &source_uri)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source repository {source_uri}")))?;

        if repos::get_by_owner_name(self.index.pool(), pds.did(), &source.name)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyExists(format!(
                "repository {} already exists",
                source.name
            )));
        }

        let rkey = tid::next_tid();
        let now = Utc::now();
        let row = RepoRow {
            did: pds.did().to_string(),
            name: source.name.clone(),
            rkey: rkey.clone(),
            knot: input.knot.clone(),
            description: source.description.clone(),
            website: vec![],
            topics: source.topics.clone(),
            spindle: None,
            source_at_uri: Some(source_uri.to_string()),
            labels: vec![],
            created_at: now,
        };
        let record = Record::Repo(RepoRecord {
            name: source.name.clone(),
            knot: input.knot.clone(),
            created_at: now,
            description: source.description.clone(),
            website: vec![],
            topics: source.topics.clone(),
            spindle: None,
            source: Some(source_uri.to_string()),
            labels: vec![],
        });

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        if let Err(e) = repos::add_repo(&mut *txn, &row).await {
            comp.run(txn).await;
            return Err(e);
        }

        let put = match pds.put_record(REPO_NSID, &rkey, &record, None).await {
            Ok(put) => put,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        comp.created(put.uri.parse().unwrap_or_else(|_| row.at_uri()));

        let resource = repo_resource(pds.did(), &source.name);
        comp.policy_touched();
        if let Err(e) = self.policy.add_repo(pds.did(), &input.knot, &resource).await {
            comp.run(txn).await;
            return Err(e);
        }

        let token = match self
            .minter
            .mint(pds, &input.knot, "sh.tangled.repo.create", None)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .knots
            .create_repo(&input.knot, &token, pds.did(), &source.name, None)
            .await
        {
            comp.run(txn).await;
            return Err(e);
        }

        // Track the upstream under a hidden ref so fork-sync has something
        // to fast-forward against.
        let upstream = format!("{}/{}/{}", source.knot, source.did, source.name);
        let sync_token = match self
            .minter
            .mint(pds, &input.knot, "sh.tangled.repo.hiddenRef", None)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .knots
            .hidden_ref(&input.knot, &sync_token, pds.did(), &source.name, &upstream)
            .await
        {
            comp.run(txn).await;
            return Err(e);
        }

        crate::write::commit_and_save_policy(txn, comp, &self.policy, true).await?;
        metrics::record_write("fork_repo");
        tracing::info!(did = pds.did(), source = %source_uri, "repo forked");
        Ok(row)
    }

    /// Edit repo metadata. The record update is guarded with `swapRecord` so
    /// a concurrent edit surfaces as a distinct conflict.
    pub async fn edit_repo(
        &self,
        pds: &PdsClient,
        name: &str,
        input: EditRepoInput,
    ) -> AppResult<RepoRow> {
        let mut row = self.require_repo(pds.did(), name).await?;
        self.ensure_owner(pds, &row).await?;

        if let Some(website) = &input.website {
            for url in website {
                validate::validate_website(url)?;
            }
        }
        if let Some(topics) = &input.topics {
            for topic in topics {
                validate::validate_topic(topic)?;
            }
        }
        if let Some(Some(spindle)) = &input.spindle {
            validate_remote_host(spindle, self.allow_insecure)?;
        }

        let current = pds.get_record(REPO_NSID, &row.rkey).await?;
        let previous = Record::from_value(current.value)?;
        let mut record = match &previous {
            Record::Repo(r) => r.clone(),
            _ => {
                return Err(AppError::Internal(format!(
                    "record at {} is not a repo",
                    current.uri
                )))
            }
        };

        if let Some(description) = &input.description {
            record.description = description.clone();
            row.description = description.clone();
        }
        if let Some(website) = &input.website {
            record.website = website.clone();
            row.website = website.clone();
        }
        if let Some(topics) = &input.topics {
            record.topics = topics.clone();
            row.topics = topics.clone();
        }
        if let Some(spindle) = &input.spindle {
            record.spindle = spindle.clone();
            row.spindle = spindle.clone();
        }

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        if let Err(e) = repos::update_repo(&mut *txn, &row).await {
            comp.run(txn).await;
            return Err(e);
        }

        let put = match pds
            .put_record(
                REPO_NSID,
                &row.rkey,
                &Record::Repo(record),
                current.cid.as_deref(),
            )
            .await
        {
            Ok(put) => put,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        comp.restore(Restore {
            collection: REPO_NSID.to_string(),
            rkey: row.rkey.clone(),
            record: previous,
            swap_cid: Some(put.cid),
        });

        crate::write::commit_and_save_policy(txn, comp, &self.policy, false).await?;
        metrics::record_write("edit_repo");
        Ok(row)
    }

    /// Delete a repo everywhere: index projections, the PDS record, policy,
    /// and the backing repository on the knot.
    pub async fn delete_repo(&self, pds: &PdsClient, name: &str) -> AppResult<()> {
        let row = self.require_repo(pds.did(), name).await?;
        self.ensure_owner(pds, &row).await?;
        let repo_at = row.at_uri().to_string();

        // Capture the record up front so a failed knot call can restore it.
        let previous = match pds.get_record(REPO_NSID, &row.rkey).await {
            Ok(current) => Some(Record::from_value(current.value)?),
            Err(AppError::Validation(_)) | Err(AppError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        let local: AppResult<()> = async {
            repos::delete_repo(&mut *txn, &row.did, &row.rkey).await?;
            collaborators::delete_for_repo(&mut *txn, &repo_at).await?;
            pipelines::delete_for_repo(&mut *txn, &repo_at).await?;
            languages::invalidate_repo(&mut *txn, &repo_at).await?;
            Ok(())
        }
        .await;
        if let Err(e) = local {
            comp.run(txn).await;
            return Err(e);
        }

        if let Err(e) = pds.delete_record(REPO_NSID, &row.rkey).await {
            comp.run(txn).await;
            return Err(e);
        }
        if let Some(record) = previous {
            comp.restore(Restore {
                collection: REPO_NSID.to_string(),
                rkey: row.rkey.clone(),
                record,
                swap_cid: None,
            });
        }

        let resource = repo_resource(&row.did, &row.name);
        comp.policy_touched();
        if let Err(e) = self.policy.remove_repo(&row.did, &row.knot, &resource).await {
            comp.run(txn).await;
            return Err(e);
        }

        let token = match self
            .minter
            .mint(pds, &row.knot, "sh.tangled.repo.delete", None)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .knots
            .delete_repo(&row.knot, &token, &row.did, &row.name)
            .await
        {
            comp.run(txn).await;
            return Err(e);
        }

        crate::write::commit_and_save_policy(txn, comp, &self.policy, true).await?;
        metrics::record_write("delete_repo");
        tracing::info!(did = %row.did, name = %row.name, "repo deleted");
        Ok(())
    }

    /// Change the default branch on the knot. Remote-only: no record, no
    /// index state.
    pub async fn set_default_branch(
        &self,
        pds: &PdsClient,
        name: &str,
        branch: &str,
    ) -> AppResult<()> {
        let row = self.require_repo(pds.did(), name).await?;
        self.ensure_can_write(pds, &row).await?;
        if branch.is_empty() {
            return Err(AppError::Validation("branch name required".into()));
        }
        let token = self
            .minter
            .mint(pds, &row.knot, "sh.tangled.repo.setDefaultBranch", None)
            .await?;
        self.knots
            .set_default_branch(&row.knot, &token, &row.did, &row.name, branch)
            .await?;
        metrics::record_write("set_default_branch");
        Ok(())
    }

    pub async fn delete_branch(&self, pds: &PdsClient, name: &str, branch: &str) -> AppResult<()> {
        let row = self.require_repo(pds.did(), name).await?;
        self.ensure_can_write(pds, &row).await?;
        if branch.is_empty() {
            return Err(AppError::Validation("branch name required".into()));
        }
        let token = self
            .minter
            .mint(pds, &row.knot, "sh.tangled.repo.deleteBranch", None)
            .await?;
        self.knots
            .delete_branch(&row.knot, &token, &row.did, &row.name, branch)
            .await?;
        metrics::record_write("delete_branch");
        Ok(())
    }

    /// Fast-forward a fork against its upstream.
    pub async fn fork_sync(&self, pds: &PdsClient, name: &str) -> AppResult<()> {
        let row = self.require_repo(pds.did(), name).await?;
        self.ensure_can_write(pds, &row).await?;
        if row.source_at_uri.is_none() {
            return Err(AppError::Validation(format!("{name} is not a fork")));
        }
        let token = self
            .minter
            .mint(pds, &row.knot, "sh.tangled.repo.forkSync", None)
            .await?;
        self.knots
            .fork_sync(&row.knot, &token, &row.did, &row.name)
            .await?;
        metrics::record_write("fork_sync");
        Ok(())
    }
}
