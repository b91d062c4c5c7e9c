//! Write coordination
//!
//! Every state-changing user action is a three-party write: the local index,
//! a record on the user's PDS, and (often) an RPC against the knot or spindle
//! hosting the repo. None of those stores share a transaction, so the
//! coordinator simulates one: optimistic local update inside a SQL
//! transaction, then the PDS write, then the remote RPC, then commit. The
//! first failure after `BEGIN` hands control to the compensator and is the
//! error the user sees.

mod artifacts;
mod collaborators;
pub mod labels;
mod repos;
mod secrets;

pub use artifacts::{DeleteArtifactInput, UploadArtifactInput};
pub use collaborators::AddCollaboratorInput;
pub use labels::{AddLabelDefInput, LabelOpOutcome, PerformLabelOpInput};
pub use repos::{CreateRepoInput, EditRepoInput, ForkRepoInput};
pub use secrets::AddSecretInput;

use crate::error::{AppError, AppResult};
use crate::index::Index;
use crate::models::{AtUri, Record};
use crate::rbac::PolicyEngine;
use crate::services::{IdentityResolver, KnotClient, PdsClient, ServiceAuthMinter};
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;

pub struct WriteCoordinator {
    pub(crate) index: Index,
    pub(crate) knots: Arc<KnotClient>,
    pub(crate) policy: Arc<dyn PolicyEngine>,
    pub(crate) minter: ServiceAuthMinter,
    pub(crate) identity: Arc<dyn IdentityResolver>,
    pub(crate) allow_insecure: bool,
}

impl WriteCoordinator {
    pub fn new(
        index: Index,
        knots: Arc<KnotClient>,
        policy: Arc<dyn PolicyEngine>,
        minter: ServiceAuthMinter,
        identity: Arc<dyn IdentityResolver>,
        allow_insecure: bool,
    ) -> Self {
        Self {
            index,
            knots,
            policy,
            minter,
            identity,
            allow_insecure,
        }
    }
}

/// A record the compensator should restore if the write fails: the
/// pre-write value and the cid to swap against.
pub(crate) struct Restore {
    pub collection: String,
    pub rkey: String,
    pub record: Record,
    pub swap_cid: Option<String>,
}

/// Tracks what has to be undone when a step of the write protocol fails.
///
/// All compensations are attempted; their errors are joined into one log
/// line and never re-raised - the caller surfaces the original failure.
pub(crate) struct Compensator<'a> {
    pds: &'a PdsClient,
    policy: &'a Arc<dyn PolicyEngine>,
    created: Vec<AtUri>,
    restores: Vec<Restore>,
    policy_touched: bool,
}

impl<'a> Compensator<'a> {
    pub fn new(pds: &'a PdsClient, policy: &'a Arc<dyn PolicyEngine>) -> Self {
        Self {
            pds,
            policy,
            created: Vec::new(),
            restores: Vec::new(),
            policy_touched: false,
        }
    }

    /// A PDS record was created under this URI.
    pub fn created(&mut self, uri: AtUri) {
        self.created.push(uri);
    }

    /// A PDS record was updated or deleted; put this back on failure.
    pub fn restore(&mut self, restore: Restore) {
        self.restores.push(restore);
    }

    /// Policy state was mutated but not yet saved.
    pub fn policy_touched(&mut self) {
        self.policy_touched = true;
    }

    /// Run every compensation. `txn` is rolled back first so the index never
    /// exposes the aborted write.
    pub async fn run(self, txn: Transaction<'static, Sqlite>) {
        let mut failures: Vec<String> = Vec::new();

        if let Err(e) = txn.rollback().await {
            failures.push(format!("rollback: {e}"));
        }

        for uri in &self.created {
            if let Err(e) = self.pds.delete_record_at(uri).await {
                failures.push(format!("delete {uri}: {e}"));
            }
        }

        for restore in &self.restores {
            if let Err(e) = self
                .pds
                .put_record(
                    &restore.collection,
                    &restore.rkey,
                    &restore.record,
                    restore.swap_cid.as_deref(),
                )
                .await
            {
                failures.push(format!(
                    "restore {}/{}: {e}",
                    restore.collection, restore.rkey
                ));
            }
        }

        if self.policy_touched {
            if let Err(e) = self.policy.load_policy().await {
                failures.push(format!("policy reload: {e}"));
            }
        }

        crate::metrics::record_compensation();
        if failures.is_empty() {
            tracing::info!("write compensated cleanly");
        } else {
            tracing::error!(failures = failures.join("; "), "write compensation incomplete");
        }
    }
}

/// Commit the transaction, then persist policy if it was mutated. A commit
/// failure still compensates; a policy-save failure after commit is logged
/// only, since the write itself is durable.
pub(crate) async fn commit_and_save_policy(
    txn: Transaction<'static, Sqlite>,
    comp: Compensator<'_>,
    policy: &Arc<dyn PolicyEngine>,
    policy_mutated: bool,
) -> AppResult<()> {
    // `commit` consumes the transaction, so a failed commit compensates
    // everything but the (already failed) local write.
    match txn.commit().await {
        Ok(()) => {}
        Err(e) => {
            let failed: AppError = e.into();
            // Rebuild a no-op transaction path: the txn is gone, compensate
            // remote state only.
            comp.run_without_txn().await;
            return Err(failed);
        }
    }
    if policy_mutated {
        if let Err(e) = policy.save_policy().await {
            tracing::error!(error = %e, "policy save failed after commit");
        }
    }
    Ok(())
}

impl<'a> Compensator<'a> {
    /// Compensation after the local transaction is already consumed.
    pub(crate) async fn run_without_txn(self) {
        let mut failures: Vec<String> = Vec::new();
        for uri in &self.created {
            if let Err(e) = self.pds.delete_record_at(uri).await {
                failures.push(format!("delete {uri}: {e}"));
            }
        }
        for restore in &self.restores {
            if let Err(e) = self
                .pds
                .put_record(
                    &restore.collection,
                    &restore.rkey,
                    &restore.record,
                    restore.swap_cid.as_deref(),
                )
                .await
            {
                failures.push(format!(
                    "restore {}/{}: {e}",
                    restore.collection, restore.rkey
                ));
            }
        }
        if self.policy_touched {
            if let Err(e) = self.policy.load_policy().await {
                failures.push(format!("policy reload: {e}"));
            }
        }
        crate::metrics::record_compensation();
        if !failures.is_empty() {
            tracing::error!(failures = failures.join("; "), "write compensation incomplete");
        }
    }
}
