//! Applying events to the index
//!
//! Handlers are idempotent and order-independent across sources: replays and
//! races with the appview's own optimistic writes must not fail. Within one
//! source the caller guarantees sequential application.

use crate::error::AppResult;
use crate::index::repos::RepoRow;
use crate::index::{collaborators, cursors, labels, languages, pipelines, repos, Index};
use crate::ingest::events::Event;
use crate::ingest::EventSource;
use crate::models::AtUri;
use chrono::Utc;

pub async fn apply_event(index: &Index, source: &EventSource, event: &Event) -> AppResult<()> {
    match event {
        Event::RepoCreate(payload) => {
            let uri = AtUri::new(&payload.did, crate::models::REPO_NSID, &payload.rkey);
            if repos::get_by_at_uri(index.pool(), &uri).await?.is_some() {
                return Ok(());
            }
            repos::add_repo(
                index.pool(),
                &RepoRow {
                    did: payload.did.clone(),
                    name: payload.name.clone(),
                    rkey: payload.rkey.clone(),
                    knot: payload.knot.clone(),
                    description: payload.description.clone(),
                    website: vec![],
                    topics: vec![],
                    spindle: None,
                    source_at_uri: payload.source.clone(),
                    labels: vec![],
                    created_at: payload.created_at,
                },
            )
            .await
        }
        Event::RepoDelete(payload) => {
            let uri = AtUri::new(&payload.did, crate::models::REPO_NSID, &payload.rkey);
            if let Some(row) = repos::get_by_at_uri(index.pool(), &uri).await? {
                let repo_at = row.at_uri().to_string();
                repos::delete_repo(index.pool(), &row.did, &row.rkey).await?;
                collaborators::delete_for_repo(index.pool(), &repo_at).await?;
                pipelines::delete_for_repo(index.pool(), &repo_at).await?;
                languages::invalidate_repo(index.pool(), &repo_at).await?;
            }
            Ok(())
        }
        Event::CollaboratorAdd(payload) => {
            if collaborators::get(index.pool(), &payload.repo, &payload.subject)
                .await?
                .is_some()
            {
                return Ok(());
            }
            collaborators::add(
                index.pool(),
                &collaborators::CollaboratorRow {
                    did: payload.did.clone(),
                    rkey: payload.rkey.clone(),
                    subject_did: payload.subject.clone(),
                    repo_at: payload.repo.clone(),
                    created_at: payload.created_at,
                },
            )
            .await
        }
        Event::CollaboratorRemove(payload) => {
            collaborators::remove(index.pool(), &payload.repo, &payload.subject).await
        }
        Event::LabelDef(payload) => {
            let uri = AtUri::new(
                &payload.did,
                crate::models::LABEL_DEFINITION_NSID,
                &payload.rkey,
            );
            if labels::get_def(index.pool(), &uri).await?.is_some() {
                return Ok(());
            }
            labels::add_def(
                index.pool(),
                &labels::LabelDefRow {
                    did: payload.did.clone(),
                    rkey: payload.rkey.clone(),
                    name: payload.name.clone(),
                    value_type: payload.value_type.clone(),
                    scope: payload.scope.clone(),
                    color: payload.color.clone(),
                    multiple: payload.multiple,
                    created_at: payload.created_at,
                },
            )
            .await
        }
        Event::LabelOp(payload) => {
            let mut conn = index.pool().acquire().await?;
            labels::insert_ops(
                &mut conn,
                &payload.did,
                &payload.rkey,
                &payload.subject,
                &payload.ops,
                payload.performed_at,
            )
            .await
        }
        Event::PipelineUpdate(payload) => {
            pipelines::upsert(
                index.pool(),
                &pipelines::PipelineStatusRow {
                    spindle: source.host.clone(),
                    repo_at: payload.repo.clone(),
                    sha: payload.sha.clone(),
                    workflow: payload.workflow.clone(),
                    status: payload.status.clone(),
                    updated_at: Utc::now(),
                },
            )
            .await
        }
        Event::DefaultBranch(payload) => {
            // A head change invalidates cached per-ref derivations.
            languages::invalidate_repo(index.pool(), &payload.repo).await
        }
        Event::Unknown { kind } => {
            tracing::debug!(host = %source.host, kind, "skipping unknown event kind");
            Ok(())
        }
    }
}

/// Persist progress for a source. Exposed for the consumer loop.
pub async fn advance_cursor(index: &Index, host: &str, seq: i64) -> AppResult<()> {
    cursors::advance(index.pool(), host, seq).await
}
