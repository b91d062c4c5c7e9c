//! Read aggregator integration tests
//!
//! Wiremock stands in for the knot; the index is in-memory. Covers the empty
//! repo short-circuit, the knot-upgrade signal, fatal collapse, enrichment
//! degradation, and determinism of the assembled view.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tangled_appview::error::AppError;
use tangled_appview::index::repos::RepoRow;
use tangled_appview::index::{emails, pipelines, repos, Index};
use tangled_appview::read::ReadAggregator;
use tangled_appview::services::KnotClient;

fn aggregator(index: Index) -> ReadAggregator {
    ReadAggregator::new(index, knot_client(), identities(), disabled_cache())
}

async fn seed_repo(index: &Index, knot_host: &str) -> RepoRow {
    let repo = RepoRow {
        did: ALICE.to_string(),
        name: "demo".into(),
        rkey: "3krepo100".into(),
        knot: knot_host.to_string(),
        description: "a demo repo".into(),
        website: vec![],
        topics: vec!["rust".into()],
        spindle: None,
        source_at_uri: None,
        labels: vec![],
        created_at: chrono::Utc::now(),
    };
    repos::add_repo(index.pool(), &repo).await.unwrap();
    repo
}

fn branches_body() -> serde_json::Value {
    json!({
        "branches": [
            { "name": "dev", "isDefault": false,
              "commit": { "sha": "sha-dev", "committerTime": "2026-03-01T00:00:00Z" } },
            { "name": "main", "isDefault": true,
              "commit": { "sha": "sha-1", "committerTime": "2026-02-01T00:00:00Z" } },
        ]
    })
}

fn log_body() -> serde_json::Value {
    let ident = |email: &str| {
        json!({ "name": "Alice", "email": email, "when": "2026-02-01T00:00:00Z" })
    };
    json!({
        "commits": [
            { "sha": "sha-1", "message": "third commit\n\nbody",
              "author": ident("alice@example.com"), "committer": ident("alice@example.com"),
              "signature": { "signature": "not-an-ssh-signature", "payload": "tree ..." } },
            { "sha": "sha-2", "message": "second commit",
              "author": ident("alice@example.com"), "committer": ident("alice@example.com") },
            { "sha": "sha-3", "message": "first commit",
              "author": ident("unknown@example.com"), "committer": ident("unknown@example.com") },
        ]
    })
}

async fn mount_full_knot(knot: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.branches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(branches_body()))
        .mount(knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tags": [
                { "name": "v1.0", "sha": "sha-2", "when": "2026-01-15T00:00:00Z" },
                { "name": "v0.9", "sha": "sha-3" },
            ]
        })))
        .mount(knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.tree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { "name": "src", "isDir": true },
                { "name": "Cargo.toml", "isDir": false, "size": 840 },
                { "name": "README.md", "isDir": false, "size": 1024 },
                { "name": ".gitignore", "isDir": false, "size": 64 },
            ]
        })))
        .mount(knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.log"))
        .respond_with(ResponseTemplate::new(200).set_body_json(log_body()))
        .mount(knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.blob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contents": "# demo\n", "binary": false
        })))
        .mount(knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.languages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "languages": { "Rust": 9000, "Shell": 120 }
        })))
        .mount(knot)
        .await;
}

#[tokio::test]
async fn empty_repo_short_circuits() {
    let knot = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.branches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "branches": [] })))
        .mount(&knot)
        .await;
    // No further projection calls for an empty repo.
    for nsid in ["tags", "tree", "log"] {
        Mock::given(method("GET"))
            .and(path(format!("/xrpc/sh.tangled.repo.{nsid}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&knot)
            .await;
    }

    let index = Index::in_memory().await.unwrap();
    seed_repo(&index, &host_of(&knot.uri())).await;

    let view = aggregator(index)
        .repo_landing(ALICE, "demo", None)
        .await
        .unwrap();
    assert!(view.is_empty);
    assert!(!view.needs_knot_upgrade);
    assert!(view.commits.is_empty());
}

#[tokio::test]
async fn unsupported_branches_signal_knot_upgrade() {
    let knot = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.branches"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "MethodNotImplemented",
            "message": "unknown lexicon",
        })))
        .mount(&knot)
        .await;
    for nsid in ["tags", "tree", "log"] {
        Mock::given(method("GET"))
            .and(path(format!("/xrpc/sh.tangled.repo.{nsid}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&knot)
            .await;
    }

    let index = Index::in_memory().await.unwrap();
    seed_repo(&index, &host_of(&knot.uri())).await;

    let view = aggregator(index)
        .repo_landing(ALICE, "demo", None)
        .await
        .unwrap();
    assert!(view.needs_knot_upgrade);
    assert!(!view.is_empty);
}

#[tokio::test]
async fn fatal_fanout_error_collapses_the_view() {
    let knot = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.branches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(branches_body()))
        .mount(&knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "tags": [] })))
        .mount(&knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.tree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": [] })))
        .mount(&knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.log"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&knot)
        .await;

    let index = Index::in_memory().await.unwrap();
    seed_repo(&index, &host_of(&knot.uri())).await;

    let err = aggregator(index)
        .repo_landing(ALICE, "demo", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RemoteTransport(_)), "{err:?}");
}

#[tokio::test]
async fn landing_view_is_balanced_sorted_and_deterministic() {
    let knot = MockServer::start().await;
    mount_full_knot(&knot).await;

    let index = Index::in_memory().await.unwrap();
    let repo = seed_repo(&index, &host_of(&knot.uri())).await;
    let repo_at = repo.at_uri().to_string();

    emails::set_email_did(index.pool(), "alice@example.com", ALICE)
        .await
        .unwrap();
    emails::add_public_key(index.pool(), ALICE, "laptop", "ssh-ed25519 AAAA... a@e")
        .await
        .unwrap();
    pipelines::upsert(
        index.pool(),
        &pipelines::PipelineStatusRow {
            spindle: "spindle.example.com".into(),
            repo_at: repo_at.clone(),
            sha: "sha-1".into(),
            workflow: "ci".into(),
            status: "passed".into(),
            updated_at: chrono::Utc::now(),
        },
    )
    .await
    .unwrap();

    let aggregator = aggregator(index);
    let view = aggregator.repo_landing(ALICE, "demo", None).await.unwrap();

    // Default branch resolves as the viewed ref.
    assert_eq!(view.ref_name, "main");
    assert!(!view.is_empty);
    assert!(!view.needs_knot_upgrade);

    // Balanced: 4 files, 2 branches, 2 tags, 3 commits ->
    // tags 1, branches 2, commits max(4/2 - 1 - 2, 3) = 3.
    assert_eq!(view.tags.len(), 1);
    assert_eq!(view.total_tags, 2);
    assert_eq!(view.branches.len(), 2);
    assert_eq!(view.commits.len(), 3);

    // Sorting: current (= default) first, then the newer dev branch.
    assert_eq!(view.branches[0].name, "main");
    assert_eq!(view.branches[1].name, "dev");

    // Annotations land on the right commits.
    let head = &view.commits[0];
    assert_eq!(head.commit.sha, "sha-1");
    assert!(head.annotations.iter().any(|a| a.name == "main"));
    let second = &view.commits[1];
    assert!(second.annotations.iter().any(|a| a.name == "v1.0"));

    // A garbage signature never verifies, even with a registered key.
    assert!(!head.verified);

    // Pipeline and email enrichment.
    assert_eq!(head.pipeline_status.as_deref(), Some("passed"));
    let alice = view.email_to_did.get("alice@example.com").unwrap();
    assert_eq!(alice.did, ALICE);
    assert_eq!(alice.handle.as_deref(), Some("alice.example.com"));
    assert!(!view.email_to_did.contains_key("unknown@example.com"));

    // Readme and languages.
    assert_eq!(view.readme.as_ref().unwrap().file_name, "README.md");
    assert_eq!(view.languages.as_ref().unwrap()["Rust"], 9000);

    // Determinism: identical remote responses, identical view.
    let again = aggregator.repo_landing(ALICE, "demo", None).await.unwrap();
    assert_eq!(
        serde_json::to_value(&view).unwrap(),
        serde_json::to_value(&again).unwrap()
    );
}

#[tokio::test]
async fn enrichment_failures_degrade_without_failing_the_page() {
    let knot = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.branches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(branches_body()))
        .mount(&knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "tags": [] })))
        .mount(&knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.tree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [{ "name": "README.md", "isDir": false, "size": 12 }]
        })))
        .mount(&knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.log"))
        .respond_with(ResponseTemplate::new(200).set_body_json(log_body()))
        .mount(&knot)
        .await;
    // Languages and readme fetches blow up: the page still renders.
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.languages"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&knot)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.blob"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&knot)
        .await;

    let index = Index::in_memory().await.unwrap();
    seed_repo(&index, &host_of(&knot.uri())).await;

    let view = aggregator(index)
        .repo_landing(ALICE, "demo", None)
        .await
        .unwrap();
    assert!(view.languages.is_none());
    assert!(view.readme.is_none());
    assert!(!view.commits.is_empty());
}

#[tokio::test]
async fn explicit_ref_is_respected_and_unknown_refs_404() {
    let knot = MockServer::start().await;
    mount_full_knot(&knot).await;

    let index = Index::in_memory().await.unwrap();
    seed_repo(&index, &host_of(&knot.uri())).await;
    let aggregator = aggregator(index);

    let view = aggregator
        .repo_landing(ALICE, "demo", Some("dev"))
        .await
        .unwrap();
    assert_eq!(view.ref_name, "dev");
    // The viewed ref sorts first even though main is the default.
    assert_eq!(view.branches[0].name, "dev");

    let err = aggregator
        .repo_landing(ALICE, "demo", Some("no-such-branch"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn log_pagination_uses_offset_cursor() {
    let knot = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/xrpc/sh.tangled.repo.log"))
        .and(query_param("offset", "20"))
        .and(query_param("limit", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "commits": [] })))
        .expect(1)
        .mount(&knot)
        .await;

    let client = KnotClient::new(
        Duration::from_secs(5),
        Duration::from_secs(2),
        true,
    )
    .unwrap();
    let response = client
        .log(&host_of(&knot.uri()), ALICE, "demo", "main", 3, 10)
        .await
        .unwrap();
    assert!(response.commits.is_empty());
}
