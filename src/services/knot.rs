//! Knot and spindle RPC client
//!
//! Knots host git repos, spindles run CI; both expose the same XRPC shape at
//! `http[s]://<host>/xrpc/<nsid>`. Read projections are public queries;
//! every mutation carries a single-use service token as a bearer credential.
//!
//! A knot that predates a method answers with `MethodNotImplemented`; that is
//! surfaced as a distinct upgrade signal, not a generic failure.

use crate::error::{AppError, AppResult};
use crate::models::{
    BlobResponse, BranchesResponse, LanguagesResponse, LogResponse, SecretListing, TagsResponse,
    TreeResponse,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

pub struct KnotClient {
    /// Client for primary calls in a user-request path.
    primary: reqwest::Client,
    /// Client for secondary enrichment calls, on a much shorter leash.
    secondary: reqwest::Client,
    allow_insecure: bool,
}

fn remote_error(host: &str, status: reqwest::StatusCode, body: &Value) -> AppError {
    let code = body.get("error").and_then(|e| e.as_str()).unwrap_or("");
    if status == reqwest::StatusCode::NOT_IMPLEMENTED
        || code == "MethodNotImplemented"
        || code == "MethodNotSupported"
    {
        return AppError::RemoteUnsupported {
            host: host.to_string(),
        };
    }
    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("request failed");
    if status == reqwest::StatusCode::CONFLICT || code == "AlreadyExists" {
        return AppError::AlreadyExists(message.to_string());
    }
    AppError::RemoteTransport(format!("{host} returned {status}: {message}"))
}

impl KnotClient {
    pub fn new(
        primary_timeout: Duration,
        secondary_timeout: Duration,
        allow_insecure: bool,
    ) -> AppResult<Self> {
        let user_agent = concat!("tangled-appview/", env!("CARGO_PKG_VERSION"));
        let primary = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(primary_timeout)
            .build()?;
        let secondary = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(secondary_timeout)
            .build()?;
        Ok(Self {
            primary,
            secondary,
            allow_insecure,
        })
    }

    fn xrpc_url(&self, host: &str, nsid: &str) -> String {
        let scheme = if self.allow_insecure { "http" } else { "https" };
        format!("{scheme}://{host}/xrpc/{nsid}")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        host: &str,
        nsid: &str,
        query: &[(&str, String)],
    ) -> AppResult<T> {
        let url = self.xrpc_url(host, nsid);
        let response = client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::RemoteTransport(format!("{host}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            tracing::warn!(host, nsid, %status, "knot query failed");
            return Err(remote_error(host, status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::RemoteTransport(format!("{host}: malformed {nsid} response: {e}")))
    }

    async fn post_authorized(
        &self,
        host: &str,
        nsid: &str,
        token: &str,
        body: &Value,
    ) -> AppResult<Value> {
        let url = self.xrpc_url(host, nsid);
        let response = self
            .primary
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::RemoteTransport(format!("{host}: {e}")))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            tracing::warn!(host, nsid, %status, "knot procedure failed");
            return Err(remote_error(host, status, &body));
        }
        Ok(body)
    }

    // ----- read projections -----

    pub async fn branches(&self, host: &str, did: &str, name: &str) -> AppResult<BranchesResponse> {
        self.get_json(
            &self.primary,
            host,
            "sh.tangled.repo.branches",
            &[("did", did.to_string()), ("name", name.to_string())],
        )
        .await
    }

    pub async fn tags(&self, host: &str, did: &str, name: &str) -> AppResult<TagsResponse> {
        self.get_json(
            &self.primary,
            host,
            "sh.tangled.repo.tags",
            &[("did", did.to_string()), ("name", name.to_string())],
        )
        .await
    }

    /// Paged commit log. The knot's cursor is an offset: page `p` with limit
    /// `l` starts at `(p-1)*l`.
    pub async fn log(
        &self,
        host: &str,
        did: &str,
        name: &str,
        ref_name: &str,
        page: u32,
        limit: u32,
    ) -> AppResult<LogResponse> {
        let offset = (page.max(1) - 1) * limit;
        self.get_json(
            &self.primary,
            host,
            "sh.tangled.repo.log",
            &[
                ("did", did.to_string()),
                ("name", name.to_string()),
                ("ref", ref_name.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    pub async fn tree(
        &self,
        host: &str,
        did: &str,
        name: &str,
        ref_name: &str,
        path: Option<&str>,
    ) -> AppResult<TreeResponse> {
        let mut query = vec![
            ("did", did.to_string()),
            ("name", name.to_string()),
            ("ref", ref_name.to_string()),
        ];
        if let Some(path) = path {
            query.push(("path", path.to_string()));
        }
        self.get_json(&self.primary, host, "sh.tangled.repo.tree", &query)
            .await
    }

    pub async fn blob(
        &self,
        host: &str,
        did: &str,
        name: &str,
        ref_name: &str,
        path: &str,
    ) -> AppResult<BlobResponse> {
        self.get_json(
            &self.secondary,
            host,
            "sh.tangled.repo.blob",
            &[
                ("did", did.to_string()),
                ("name", name.to_string()),
                ("ref", ref_name.to_string()),
                ("path", path.to_string()),
            ],
        )
        .await
    }

    pub async fn diff(
        &self,
        host: &str,
        did: &str,
        name: &str,
        ref_name: &str,
    ) -> AppResult<Value> {
        self.get_json(
            &self.primary,
            host,
            "sh.tangled.repo.diff",
            &[
                ("did", did.to_string()),
                ("name", name.to_string()),
                ("ref", ref_name.to_string()),
            ],
        )
        .await
    }

    pub async fn compare(
        &self,
        host: &str,
        did: &str,
        name: &str,
        rev1: &str,
        rev2: &str,
    ) -> AppResult<Value> {
        self.get_json(
            &self.primary,
            host,
            "sh.tangled.repo.compare",
            &[
                ("did", did.to_string()),
                ("name", name.to_string()),
                ("rev1", rev1.to_string()),
                ("rev2", rev2.to_string()),
            ],
        )
        .await
    }

    /// Tarball download location for a ref; the knot answers with a redirect
    /// descriptor rather than the archive bytes.
    pub async fn archive(
        &self,
        host: &str,
        did: &str,
        name: &str,
        ref_name: &str,
    ) -> AppResult<Value> {
        self.get_json(
            &self.primary,
            host,
            "sh.tangled.repo.archive",
            &[
                ("did", did.to_string()),
                ("name", name.to_string()),
                ("ref", ref_name.to_string()),
            ],
        )
        .await
    }

    pub async fn languages(
        &self,
        host: &str,
        did: &str,
        name: &str,
        ref_name: &str,
    ) -> AppResult<LanguagesResponse> {
        self.get_json(
            &self.secondary,
            host,
            "sh.tangled.repo.languages",
            &[
                ("did", did.to_string()),
                ("name", name.to_string()),
                ("ref", ref_name.to_string()),
            ],
        )
        .await
    }

    // ----- mutations (service token required) -----

    pub async fn create_repo(
        &self,
        host: &str,
        token: &str,
        did: &str,
        name: &str,
        default_branch: Option<&str>,
    ) -> AppResult<()> {
        let mut body = json!({ "did": did, "name": name });
        if let Some(branch) = default_branch {
            body["defaultBranch"] = Value::String(branch.to_string());
        }
        self.post_authorized(host, "sh.tangled.repo.create", token, &body)
            .await?;
        Ok(())
    }

    pub async fn delete_repo(&self, host: &str, token: &str, did: &str, name: &str) -> AppResult<()> {
        self.post_authorized(
            host,
            "sh.tangled.repo.delete",
            token,
            &json!({ "did": did, "name": name }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_branch(
        &self,
        host: &str,
        token: &str,
        did: &str,
        name: &str,
        branch: &str,
    ) -> AppResult<()> {
        self.post_authorized(
            host,
            "sh.tangled.repo.deleteBranch",
            token,
            &json!({ "did": did, "name": name, "branch": branch }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_default_branch(
        &self,
        host: &str,
        token: &str,
        did: &str,
        name: &str,
        branch: &str,
    ) -> AppResult<()> {
        self.post_authorized(
            host,
            "sh.tangled.repo.setDefaultBranch",
            token,
            &json!({ "did": did, "name": name, "branch": branch }),
        )
        .await?;
        Ok(())
    }

    /// Register the hidden tracking ref a fork uses to follow its upstream.
    pub async fn hidden_ref(
        &self,
        host: &str,
        token: &str,
        did: &str,
        name: &str,
        source: &str,
    ) -> AppResult<()> {
        self.post_authorized(
            host,
            "sh.tangled.repo.hiddenRef",
            token,
            &json!({ "did": did, "name": name, "source": source }),
        )
        .await?;
        Ok(())
    }

    /// Fast-forward a fork's hidden tracking ref against its upstream.
    pub async fn fork_sync(&self, host: &str, token: &str, did: &str, name: &str) -> AppResult<()> {
        self.post_authorized(
            host,
            "sh.tangled.repo.forkSync",
            token,
            &json!({ "did": did, "name": name }),
        )
        .await?;
        Ok(())
    }

    // ----- spindle secrets -----

    pub async fn add_secret(
        &self,
        host: &str,
        token: &str,
        repo_at: &str,
        key: &str,
        value: &str,
    ) -> AppResult<()> {
        self.post_authorized(
            host,
            "sh.tangled.repo.addSecret",
            token,
            &json!({ "repo": repo_at, "key": key, "value": value }),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_secret(
        &self,
        host: &str,
        token: &str,
        repo_at: &str,
        key: &str,
    ) -> AppResult<()> {
        self.post_authorized(
            host,
            "sh.tangled.repo.removeSecret",
            token,
            &json!({ "repo": repo_at, "key": key }),
        )
        .await?;
        Ok(())
    }

    pub async fn list_secrets(
        &self,
        host: &str,
        token: &str,
        repo_at: &str,
    ) -> AppResult<SecretListing> {
        let value = self
            .post_authorized(
                host,
                "sh.tangled.repo.listSecrets",
                token,
                &json!({ "repo": repo_at }),
            )
            .await?;
        Ok(serde_json::from_value(value)
            .map_err(|e| AppError::RemoteTransport(format!("{host}: malformed secret listing: {e}")))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_methods_are_distinguished() {
        let body = json!({ "error": "MethodNotImplemented", "message": "unknown lexicon" });
        let err = remote_error("knot.example.com", reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, AppError::RemoteUnsupported { .. }));

        let err = remote_error(
            "knot.example.com",
            reqwest::StatusCode::NOT_IMPLEMENTED,
            &Value::Null,
        );
        assert!(matches!(err, AppError::RemoteUnsupported { .. }));
    }

    #[test]
    fn conflicts_and_failures_map_cleanly() {
        let body = json!({ "error": "AlreadyExists", "message": "repo exists" });
        let err = remote_error("knot.example.com", reqwest::StatusCode::CONFLICT, &body);
        assert!(matches!(err, AppError::AlreadyExists(_)));

        let err = remote_error(
            "knot.example.com",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            &Value::Null,
        );
        assert!(matches!(err, AppError::RemoteTransport(_)));
    }
}
