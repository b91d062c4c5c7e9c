//! Spindle secret management
//!
//! Remote-only writes: secrets never touch the PDS or the index. Each call
//! is scoped by its own freshly minted, method-bound service token.

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::SecretMeta;
use crate::services::PdsClient;
use crate::validate;
use crate::write::WriteCoordinator;

#[derive(Debug, Clone)]
pub struct AddSecretInput {
    pub repo_name: String,
    pub key: String,
    pub value: String,
}

impl WriteCoordinator {
    fn spindle_of(&self, row: &crate::index::repos::RepoRow) -> AppResult<String> {
        row.spindle.clone().ok_or_else(|| {
            AppError::Validation(format!(
                "repository {} has no spindle configured",
                row.name
            ))
        })
    }

    pub async fn add_secret(&self, pds: &PdsClient, input: AddSecretInput) -> AppResult<()> {
        let row = self.require_repo(pds.did(), &input.repo_name).await?;
        self.ensure_owner(pds, &row).await?;
        validate::validate_secret_key(&input.key)?;
        if input.value.is_empty() {
            return Err(AppError::Validation("secret value required".into()));
        }
        let spindle = self.spindle_of(&row)?;

        let token = self
            .minter
            .mint(pds, &spindle, "sh.tangled.repo.addSecret", None)
            .await?;
        self.knots
            .add_secret(
                &spindle,
                &token,
                &row.at_uri().to_string(),
                &input.key,
                &input.value,
            )
            .await?;
        metrics::record_write("add_secret");
        tracing::info!(repo = %row.name, key = %input.key, "secret added");
        Ok(())
    }

    pub async fn remove_secret(&self, pds: &PdsClient, repo_name: &str, key: &str) -> AppResult<()> {
        let row = self.require_repo(pds.did(), repo_name).await?;
        self.ensure_owner(pds, &row).await?;
        let spindle = self.spindle_of(&row)?;

        let token = self
            .minter
            .mint(pds, &spindle, "sh.tangled.repo.removeSecret", None)
            .await?;
        self.knots
            .remove_secret(&spindle, &token, &row.at_uri().to_string(), key)
            .await?;
        metrics::record_write("remove_secret");
        Ok(())
    }

    pub async fn list_secrets(
        &self,
        pds: &PdsClient,
        repo_name: &str,
    ) -> AppResult<Vec<SecretMeta>> {
        let row = self.require_repo(pds.did(), repo_name).await?;
        self.ensure_owner(pds, &row).await?;
        let spindle = self.spindle_of(&row)?;

        let token = self
            .minter
            .mint(pds, &spindle, "sh.tangled.repo.listSecrets", None)
            .await?;
        let listing = self
            .knots
            .list_secrets(&spindle, &token, &row.at_uri().to_string())
            .await?;
        Ok(listing.secrets)
    }
}
