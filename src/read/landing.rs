//! Repo landing view assembly
//!
//! One read path: resolve the repo row, ask the knot for branches, fan out
//! tags/tree/log in parallel, then enrich in-appview. Primary failures
//! collapse the view; enrichment failures are logged and omitted.

use crate::error::{AppError, AppResult};
use crate::index::repos::RepoRow;
use crate::index::{emails, labels, languages, pipelines, repos, Index};
use crate::metrics;
use crate::models::{AtUri, Branch, Commit, TagRef, TreeEntry};
use crate::read::verify::verify_commit_signature;
use crate::services::{Cache, IdentityResolver, KnotClient};
use crate::write::labels::state_from_log;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

const LOG_PAGE_SIZE: u32 = 50;
const LANGUAGE_CACHE_TTL_SECONDS: u64 = 3600;

pub struct ReadAggregator {
    index: Index,
    knots: Arc<KnotClient>,
    identity: Arc<dyn IdentityResolver>,
    cache: Cache,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefAnnotation {
    pub name: String,
    pub kind: RefKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LandingCommit {
    #[serde(flatten)]
    pub commit: Commit,
    pub annotations: Vec<RefAnnotation>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailIdentity {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ForkSyncStatus {
    UpToDate,
    Behind,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Readme {
    pub file_name: String,
    pub contents: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoLandingView {
    pub did: String,
    pub name: String,
    pub knot: String,
    pub description: String,
    pub website: Vec<String>,
    pub topics: Vec<String>,
    pub labels: Vec<(String, String)>,
    pub ref_name: String,
    pub is_empty: bool,
    pub needs_knot_upgrade: bool,
    pub branches: Vec<Branch>,
    pub total_branches: usize,
    pub tags: Vec<TagRef>,
    pub total_tags: usize,
    pub files: Vec<TreeEntry>,
    pub commits: Vec<LandingCommit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme: Option<Readme>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_sync_status: Option<ForkSyncStatus>,
    pub email_to_did: HashMap<String, EmailIdentity>,
}

impl RepoLandingView {
    fn shell(repo: &RepoRow) -> Self {
        Self {
            did: repo.did.clone(),
            name: repo.name.clone(),
            knot: repo.knot.clone(),
            description: repo.description.clone(),
            website: repo.website.clone(),
            topics: repo.topics.clone(),
            labels: vec![],
            ref_name: String::new(),
            is_empty: false,
            needs_knot_upgrade: false,
            branches: vec![],
            total_branches: 0,
            tags: vec![],
            total_tags: 0,
            files: vec![],
            commits: vec![],
            readme: None,
            languages: None,
            fork_of: repo.source_at_uri.clone(),
            fork_sync_status: None,
            email_to_did: HashMap::new(),
        }
    }
}

/// On-page item budget. Given `f` tree entries, show at most one tag, one to
/// three branches, and `max(f/2 - tags - branches, 3)` commits; never more
/// than actually exist, and zero of a category that is empty.
pub fn balance_index_items(
    commits: usize,
    branches: usize,
    tags: usize,
    files: usize,
) -> (usize, usize, usize) {
    let tags_shown = tags.min(1);
    let branches_shown = branches.min(3);
    let commits_shown = if commits == 0 {
        0
    } else {
        (files / 2)
            .saturating_sub(tags_shown + branches_shown)
            .max(3)
            .min(commits)
    };
    (commits_shown, branches_shown, tags_shown)
}

/// Branch ordering for the landing page: the currently viewed ref first,
/// then the default branch, then most recent committer time, then name.
pub fn sort_branches(branches: &mut [Branch], current_ref: &str) {
    branches.sort_by(|a, b| {
        let a_current = a.name == current_ref;
        let b_current = b.name == current_ref;
        b_current
            .cmp(&a_current)
            .then(b.is_default.cmp(&a.is_default))
            .then_with(|| {
                let a_time = a.commit.as_ref().and_then(|c| c.committer_time);
                let b_time = b.commit.as_ref().and_then(|c| c.committer_time);
                b_time.cmp(&a_time)
            })
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Tag/branch decorations per commit hash.
pub fn annotate(branches: &[Branch], tags: &[TagRef]) -> HashMap<String, Vec<RefAnnotation>> {
    let mut map: HashMap<String, Vec<RefAnnotation>> = HashMap::new();
    for branch in branches {
        if let Some(commit) = &branch.commit {
            map.entry(commit.sha.clone()).or_default().push(RefAnnotation {
                name: branch.name.clone(),
                kind: RefKind::Branch,
            });
        }
    }
    for tag in tags {
        map.entry(tag.sha.clone()).or_default().push(RefAnnotation {
            name: tag.name.clone(),
            kind: RefKind::Tag,
        });
    }
    map
}

impl ReadAggregator {
    pub fn new(
        index: Index,
        knots: Arc<KnotClient>,
        identity: Arc<dyn IdentityResolver>,
        cache: Cache,
    ) -> Self {
        Self {
            index,
            knots,
            identity,
            cache,
        }
    }

    /// Assemble the landing view for `(owner-did, repo-name, optional ref)`.
    pub async fn repo_landing(
        &self,
        owner_did: &str,
        repo_name: &str,
        ref_name: Option<&str>,
    ) -> AppResult<RepoLandingView> {
        let repo = repos::get_by_owner_name(self.index.pool(), owner_did, repo_name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("repository {repo_name}")))?;
        let repo_at = repo.at_uri().to_string();
        let mut view = RepoLandingView::shell(&repo);

        let mut branches = match self.knots.branches(&repo.knot, &repo.did, &repo.name).await {
            Ok(response) => response.branches,
            Err(AppError::RemoteUnsupported { .. }) => {
                view.needs_knot_upgrade = true;
                return Ok(view);
            }
            Err(e) => return Err(e),
        };

        if branches.is_empty() {
            view.is_empty = true;
            return Ok(view);
        }

        let resolved_ref = match ref_name {
            Some(name) => branches
                .iter()
                .find(|b| b.name == name)
                .map(|b| b.name.clone())
                .ok_or_else(|| AppError::NotFound(format!("ref {name}")))?,
            None => branches
                .iter()
                .find(|b| b.is_default)
                .or_else(|| branches.first())
                .map(|b| b.name.clone())
                .expect("branches checked non-empty"),
        };

        // Parallel fan-out: each task owns its slot, errors go to a shared
        // sink, and the joiner reads both once every task is done.
        let tags_slot = Arc::new(Mutex::new(None));
        let tree_slot = Arc::new(Mutex::new(None));
        let log_slot = Arc::new(Mutex::new(None));
        let errors: Arc<Mutex<Vec<AppError>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = JoinSet::new();
        {
            let knots = self.knots.clone();
            let (host, did, name) = (repo.knot.clone(), repo.did.clone(), repo.name.clone());
            let slot = tags_slot.clone();
            let errors = errors.clone();
            tasks.spawn(async move {
                match knots.tags(&host, &did, &name).await {
                    Ok(response) => *slot.lock().unwrap() = Some(response.tags),
                    Err(e) => errors.lock().unwrap().push(e),
                }
            });
        }
        {
            let knots = self.knots.clone();
            let (host, did, name) = (repo.knot.clone(), repo.did.clone(), repo.name.clone());
            let ref_name = resolved_ref.clone();
            let slot = tree_slot.clone();
            let errors = errors.clone();
            tasks.spawn(async move {
                match knots.tree(&host, &did, &name, &ref_name, None).await {
                    Ok(response) => *slot.lock().unwrap() = Some(response.entries),
                    Err(e) => errors.lock().unwrap().push(e),
                }
            });
        }
        {
            let knots = self.knots.clone();
            let (host, did, name) = (repo.knot.clone(), repo.did.clone(), repo.name.clone());
            let ref_name = resolved_ref.clone();
            let slot = log_slot.clone();
            let errors = errors.clone();
            tasks.spawn(async move {
                match knots.log(&host, &did, &name, &ref_name, 1, LOG_PAGE_SIZE).await {
                    Ok(response) => *slot.lock().unwrap() = Some(response.commits),
                    Err(e) => errors.lock().unwrap().push(e),
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        {
            let mut sink = errors.lock().unwrap();
            if sink
                .iter()
                .any(|e| matches!(e, AppError::RemoteUnsupported { .. }))
            {
                view.needs_knot_upgrade = true;
                return Ok(view);
            }
            if let Some(fatal) = sink.drain(..).next() {
                return Err(fatal);
            };
        }

        let tags: Vec<TagRef> = tags_slot.lock().unwrap().take().unwrap_or_default();
        let files: Vec<TreeEntry> = tree_slot.lock().unwrap().take().unwrap_or_default();
        let commits: Vec<Commit> = log_slot.lock().unwrap().take().unwrap_or_default();

        let annotations = annotate(&branches, &tags);
        sort_branches(&mut branches, &resolved_ref);
        let (commits_shown, branches_shown, tags_shown) =
            balance_index_items(commits.len(), branches.len(), tags.len(), files.len());

        // Email -> DID -> handle, batched across the whole page.
        let mut commit_emails: BTreeSet<String> = BTreeSet::new();
        for commit in commits.iter().take(commits_shown) {
            commit_emails.insert(commit.author.email.clone());
            commit_emails.insert(commit.committer.email.clone());
        }
        let email_list: Vec<String> = commit_emails.into_iter().collect();
        let email_dids = emails::map_emails(self.index.pool(), &email_list).await?;
        let dids: Vec<String> = email_dids.values().cloned().collect();
        let handles = self.identity.resolve_handles(&dids).await;
        let email_to_did: HashMap<String, EmailIdentity> = email_dids
            .iter()
            .map(|(email, did)| {
                (
                    email.clone(),
                    EmailIdentity {
                        did: did.clone(),
                        handle: handles.get(did).cloned(),
                    },
                )
            })
            .collect();

        // Per-DID key cache across the batch.
        let mut key_cache: HashMap<String, Vec<String>> = HashMap::new();
        let shown_shas: Vec<String> = commits
            .iter()
            .take(commits_shown)
            .map(|c| c.sha.clone())
            .collect();
        let pipeline_map = match pipelines::for_shas(self.index.pool(), &repo_at, &shown_shas).await
        {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "pipeline enrichment failed");
                HashMap::new()
            }
        };

        let mut landing_commits = Vec::with_capacity(commits_shown);
        for commit in commits.iter().take(commits_shown) {
            let verified = match (&commit.signature, email_dids.get(&commit.committer.email)) {
                (Some(signature), Some(did)) => {
                    let keys = match key_cache.get(did) {
                        Some(keys) => keys.clone(),
                        None => {
                            let keys = emails::keys_for_did(self.index.pool(), did)
                                .await
                                .unwrap_or_else(|e| {
                                    tracing::warn!(error = %e, "key lookup failed");
                                    Vec::new()
                                });
                            key_cache.insert(did.clone(), keys.clone());
                            keys
                        }
                    };
                    verify_commit_signature(&signature.payload, &signature.signature, &keys)
                }
                _ => false,
            };
            landing_commits.push(LandingCommit {
                commit: commit.clone(),
                annotations: annotations.get(&commit.sha).cloned().unwrap_or_default(),
                verified,
                pipeline_status: pipeline_map.get(&commit.sha).map(|s| s.status.clone()),
            });
        }

        view.ref_name = resolved_ref.clone();
        view.total_branches = branches.len();
        view.total_tags = tags.len();
        view.branches = branches.into_iter().take(branches_shown).collect();
        view.tags = tags.into_iter().take(tags_shown).collect();
        view.commits = landing_commits;
        view.readme = self.fetch_readme(&repo, &resolved_ref, &files).await;
        view.files = files;
        view.languages = self.languages_for(&repo, &repo_at, &resolved_ref).await;
        view.labels = self.labels_for(&repo, &repo_at).await;
        view.fork_sync_status = self.fork_status(&repo, &view.branches).await;
        view.email_to_did = email_to_did;

        metrics::record_landing_read();
        Ok(view)
    }

    /// Language breakdown with `(repo_at, ref)` write-through caching: the
    /// index row is authoritative, the Redis layer shields it, and a knot
    /// fetch fills both.
    async fn languages_for(
        &self,
        repo: &RepoRow,
        repo_at: &str,
        ref_name: &str,
    ) -> Option<BTreeMap<String, u64>> {
        if let Some(cached) = self.cache.get("languages", &[repo_at, ref_name]).await {
            return Some(cached);
        }
        match languages::get(self.index.pool(), repo_at, ref_name).await {
            Ok(Some(stored)) => {
                self.cache
                    .put("languages", &[repo_at, ref_name], &stored, LANGUAGE_CACHE_TTL_SECONDS)
                    .await;
                return Some(stored);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "language cache read failed");
            }
        }
        match self
            .knots
            .languages(&repo.knot, &repo.did, &repo.name, ref_name)
            .await
        {
            Ok(response) => {
                if let Err(e) =
                    languages::put(self.index.pool(), repo_at, ref_name, &response.languages).await
                {
                    tracing::warn!(error = %e, "language cache write failed");
                }
                self.cache
                    .put(
                        "languages",
                        &[repo_at, ref_name],
                        &response.languages,
                        LANGUAGE_CACHE_TTL_SECONDS,
                    )
                    .await;
                Some(response.languages)
            }
            Err(e) => {
                tracing::debug!(error = %e, "language enrichment failed");
                None
            }
        }
    }

    /// Current label state of the repo itself, for the header chips.
    async fn labels_for(&self, repo: &RepoRow, repo_at: &str) -> Vec<(String, String)> {
        let subscribed: BTreeSet<String> = repo.labels.iter().cloned().collect();
        if subscribed.is_empty() {
            return vec![];
        }
        match labels::ops_for_subject(self.index.pool(), repo_at).await {
            Ok(log) => state_from_log(&log, &subscribed).into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "label enrichment failed");
                vec![]
            }
        }
    }

    async fn fetch_readme(
        &self,
        repo: &RepoRow,
        ref_name: &str,
        files: &[TreeEntry],
    ) -> Option<Readme> {
        let entry = files
            .iter()
            .find(|f| !f.is_dir && f.name.to_lowercase().starts_with("readme"))?;
        match self
            .knots
            .blob(&repo.knot, &repo.did, &repo.name, ref_name, &entry.name)
            .await
        {
            Ok(blob) if !blob.binary => Some(Readme {
                file_name: entry.name.clone(),
                contents: blob.contents,
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "readme enrichment failed");
                None
            }
        }
    }

    /// For forks: compare our current head against the upstream default
    /// branch head.
    async fn fork_status(&self, repo: &RepoRow, branches: &[Branch]) -> Option<ForkSyncStatus> {
        let source_uri = repo.source_at_uri.as_ref()?;
        let parsed: AtUri = source_uri.parse().ok()?;
        let source = match repos::get_by_at_uri(self.index.pool(), &parsed).await {
            Ok(Some(source)) => source,
            _ => return Some(ForkSyncStatus::Unknown),
        };
        let upstream = match self
            .knots
            .branches(&source.knot, &source.did, &source.name)
            .await
        {
            Ok(response) => response.branches,
            Err(e) => {
                tracing::debug!(error = %e, "fork status enrichment failed");
                return Some(ForkSyncStatus::Unknown);
            }
        };
        let upstream_head = upstream
            .iter()
            .find(|b| b.is_default)
            .or_else(|| upstream.first())
            .and_then(|b| b.commit.as_ref())
            .map(|c| c.sha.clone())?;
        let our_head = branches
            .iter()
            .find(|b| b.is_default)
            .or_else(|| branches.first())
            .and_then(|b| b.commit.as_ref())
            .map(|c| c.sha.clone())?;
        if upstream_head == our_head {
            Some(ForkSyncStatus::UpToDate)
        } else {
            Some(ForkSyncStatus::Behind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommitMeta;
    use chrono::{Duration, Utc};

    #[test]
    fn balance_respects_real_counts() {
        // Plenty of files: budget driven by f/2.
        assert_eq!(balance_index_items(50, 5, 4, 20), (6, 3, 1));
        // Floor of three commits.
        assert_eq!(balance_index_items(50, 5, 4, 2), (3, 3, 1));
        // Never exceed what exists.
        assert_eq!(balance_index_items(2, 1, 0, 40), (2, 1, 0));
    }

    #[test]
    fn balance_zero_inputs_stay_zero() {
        assert_eq!(balance_index_items(0, 0, 0, 0), (0, 0, 0));
        assert_eq!(balance_index_items(0, 2, 1, 10), (0, 2, 1));
        assert_eq!(balance_index_items(5, 0, 0, 0), (3, 0, 0));
    }

    fn branch(name: &str, is_default: bool, age_hours: i64) -> Branch {
        Branch {
            name: name.to_string(),
            is_default,
            commit: Some(CommitMeta {
                sha: format!("sha-{name}"),
                committer_time: Some(Utc::now() - Duration::hours(age_hours)),
            }),
        }
    }

    #[test]
    fn branch_sort_order() {
        let mut branches = vec![
            branch("zeta", false, 1),
            branch("main", true, 10),
            branch("alpha", false, 1000),
            branch("feature", false, 5),
        ];
        sort_branches(&mut branches, "feature");
        let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
        // Current ref first, then default, then recency, then name.
        assert_eq!(names, vec!["feature", "main", "zeta", "alpha"]);
    }

    #[test]
    fn branch_sort_is_deterministic() {
        let make = || {
            vec![
                branch("b", false, 2),
                branch("a", false, 2),
                branch("main", true, 50),
            ]
        };
        let mut first = make();
        let mut second = make();
        // Equal committer times fall back to name order.
        first[0].commit.as_mut().unwrap().committer_time =
            first[1].commit.as_ref().unwrap().committer_time;
        second[0].commit.as_mut().unwrap().committer_time =
            second[1].commit.as_ref().unwrap().committer_time;
        sort_branches(&mut first, "main");
        sort_branches(&mut second, "main");
        let names = |b: &[Branch]| b.iter().map(|x| x.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&first), vec!["main", "a", "b"]);
    }

    #[test]
    fn annotations_cover_branches_and_tags() {
        let branches = vec![branch("main", true, 1)];
        let tags = vec![TagRef {
            name: "v1.0".into(),
            sha: "sha-main".into(),
            when: None,
        }];
        let map = annotate(&branches, &tags);
        let anns = &map["sha-main"];
        assert_eq!(anns.len(), 2);
        assert!(anns.iter().any(|a| a.kind == RefKind::Branch && a.name == "main"));
        assert!(anns.iter().any(|a| a.kind == RefKind::Tag && a.name == "v1.0"));
    }
}
