//! Write coordinator integration tests
//!
//! Exercise the three-party write protocol against wiremock doubles for the
//! PDS and the knot, with the in-memory index and policy engine.

mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use async_trait::async_trait;
use tangled_appview::error::{AppError, AppResult};
use tangled_appview::index::repos::RepoRow;
use tangled_appview::index::{collaborators, labels, repos, Index};
use tangled_appview::models::{ConcreteType, LabelValueType, ValueFormat};
use tangled_appview::rbac::{InMemoryPolicy, PolicyEngine};
use tangled_appview::write::{
    AddCollaboratorInput, AddLabelDefInput, CreateRepoInput, EditRepoInput, ForkRepoInput,
    LabelOpOutcome, PerformLabelOpInput,
};

fn put_record_ok(uri: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "uri": uri, "cid": "bafyput001" }))
}

async fn mount_service_auth(pds: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.server.getServiceAuth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "svc-token" })))
        .mount(pds)
        .await;
}

#[tokio::test]
async fn create_repo_writes_all_three_parties() {
    let pds = MockServer::start().await;
    let knot = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(put_record_ok(
            "at://did:plc:alice/sh.tangled.repo/3kcreated001",
        ))
        .expect(1)
        .mount(&pds)
        .await;
    mount_service_auth(&pds).await;
    Mock::given(method("POST"))
        .and(path("/xrpc/sh.tangled.repo.create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&knot)
        .await;

    let index = Index::in_memory().await.unwrap();
    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy.clone());
    let client = pds_client(ALICE, &pds.uri());

    let row = coordinator
        .create_repo(
            &client,
            CreateRepoInput {
                name: "demo".into(),
                knot: host_of(&knot.uri()),
                description: "a demo".into(),
                website: vec![],
                topics: vec!["rust".into()],
                default_branch: None,
            },
        )
        .await
        .unwrap();

    let stored = repos::get_by_owner_name(index.pool(), ALICE, "demo")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.rkey, row.rkey);
    assert!(policy
        .can_write(ALICE, "did:plc:alice/demo")
        .await
        .unwrap());
}

#[tokio::test]
async fn pds_failure_rolls_back_the_index() {
    let pds = MockServer::start().await;
    let knot = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&pds)
        .await;
    // The remote is never reached.
    Mock::given(method("POST"))
        .and(path("/xrpc/sh.tangled.repo.create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&knot)
        .await;

    let index = Index::in_memory().await.unwrap();
    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy.clone());
    let client = pds_client(ALICE, &pds.uri());

    let err = coordinator
        .create_repo(
            &client,
            CreateRepoInput {
                name: "demo".into(),
                knot: host_of(&knot.uri()),
                description: String::new(),
                website: vec![],
                topics: vec![],
                default_branch: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PdsTransport(_)), "{err:?}");

    assert!(repos::get_by_owner_name(index.pool(), ALICE, "demo")
        .await
        .unwrap()
        .is_none());
    assert!(!policy
        .can_write(ALICE, "did:plc:alice/demo")
        .await
        .unwrap());
}

#[tokio::test]
async fn create_then_delete_leaves_nothing_behind() {
    let pds = MockServer::start().await;
    let knot = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(put_record_ok(
            "at://did:plc:alice/sh.tangled.repo/3kcreated002",
        ))
        .mount(&pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uri": "at://did:plc:alice/sh.tangled.repo/3kcreated002",
            "cid": "bafyget001",
            "value": {
                "$type": "sh.tangled.repo",
                "name": "demo",
                "knot": "knot.example.com",
                "createdAt": "2026-01-01T00:00:00Z",
            }
        })))
        .mount(&pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.deleteRecord"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&pds)
        .await;
    mount_service_auth(&pds).await;
    Mock::given(method("POST"))
        .and(path("/xrpc/sh.tangled.repo.create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&knot)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/sh.tangled.repo.delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&knot)
        .await;

    let index = Index::in_memory().await.unwrap();
    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy.clone());
    let client = pds_client(ALICE, &pds.uri());

    coordinator
        .create_repo(
            &client,
            CreateRepoInput {
                name: "demo".into(),
                knot: host_of(&knot.uri()),
                description: String::new(),
                website: vec![],
                topics: vec![],
                default_branch: None,
            },
        )
        .await
        .unwrap();

    coordinator.delete_repo(&client, "demo").await.unwrap();

    assert!(repos::get_by_owner_name(index.pool(), ALICE, "demo")
        .await
        .unwrap()
        .is_none());
    assert!(!policy
        .can_write(ALICE, "did:plc:alice/demo")
        .await
        .unwrap());
}

#[tokio::test]
async fn fork_conflict_compensates_everything() {
    let pds = MockServer::start().await;
    let source_knot = MockServer::start().await;
    let target_knot = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(put_record_ok("at://did:plc:bob/sh.tangled.repo/3kfork001"))
        .expect(1)
        .mount(&pds)
        .await;
    // Compensation must delete the fork record.
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.deleteRecord"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&pds)
        .await;
    mount_service_auth(&pds).await;
    Mock::given(method("POST"))
        .and(path("/xrpc/sh.tangled.repo.create"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": "AlreadyExists",
            "message": "repo exists on this knot",
        })))
        .expect(1)
        .mount(&target_knot)
        .await;

    let index = Index::in_memory().await.unwrap();
    let source = RepoRow {
        did: ALICE.to_string(),
        name: "demo".into(),
        rkey: "3ksource001".into(),
        knot: host_of(&source_knot.uri()),
        description: "upstream".into(),
        website: vec![],
        topics: vec![],
        spindle: None,
        source_at_uri: None,
        labels: vec![],
        created_at: chrono::Utc::now(),
    };
    repos::add_repo(index.pool(), &source).await.unwrap();

    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy.clone());
    let client = pds_client(BOB, &pds.uri());

    let err = coordinator
        .fork_repo(
            &client,
            ForkRepoInput {
                source: source.at_uri().to_string(),
                knot: host_of(&target_knot.uri()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)), "{err:?}");

    // Index row rolled back, policy grant reverted.
    assert!(repos::get_by_owner_name(index.pool(), BOB, "demo")
        .await
        .unwrap()
        .is_none());
    assert!(!policy.can_write(BOB, "did:plc:bob/demo").await.unwrap());
}

#[tokio::test]
async fn fork_produces_exactly_one_repo_with_source() {
    let pds = MockServer::start().await;
    let knot = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(put_record_ok("at://did:plc:bob/sh.tangled.repo/3kfork002"))
        .mount(&pds)
        .await;
    mount_service_auth(&pds).await;
    Mock::given(method("POST"))
        .and(path("/xrpc/sh.tangled.repo.create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&knot)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/sh.tangled.repo.hiddenRef"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&knot)
        .await;

    let index = Index::in_memory().await.unwrap();
    let source = RepoRow {
        did: ALICE.to_string(),
        name: "demo".into(),
        rkey: "3ksource002".into(),
        knot: "upstream-knot.example.com".into(),
        description: String::new(),
        website: vec![],
        topics: vec![],
        spindle: None,
        source_at_uri: None,
        labels: vec![],
        created_at: chrono::Utc::now(),
    };
    repos::add_repo(index.pool(), &source).await.unwrap();

    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy.clone());
    let client = pds_client(BOB, &pds.uri());

    let fork = coordinator
        .fork_repo(
            &client,
            ForkRepoInput {
                source: source.at_uri().to_string(),
                knot: host_of(&knot.uri()),
            },
        )
        .await
        .unwrap();
    assert_eq!(fork.source_at_uri, Some(source.at_uri().to_string()));
    assert_eq!(fork.name, "demo");

    // Forking again under the same account fails with "exists".
    let err = coordinator
        .fork_repo(
            &client,
            ForkRepoInput {
                source: source.at_uri().to_string(),
                knot: host_of(&knot.uri()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)), "{err:?}");
}

/// Policy engine that rejects collaborator grants, recording compensation.
struct RejectingPolicy {
    inner: InMemoryPolicy,
    loads: AtomicUsize,
    fail_collaborators: AtomicBool,
}

impl RejectingPolicy {
    fn new() -> Self {
        Self {
            inner: InMemoryPolicy::new(),
            loads: AtomicUsize::new(0),
            fail_collaborators: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl PolicyEngine for RejectingPolicy {
    async fn load_policy(&self) -> AppResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_policy().await
    }

    async fn save_policy(&self) -> AppResult<()> {
        self.inner.save_policy().await
    }

    async fn add_repo(&self, owner: &str, knot: &str, resource: &str) -> AppResult<()> {
        self.inner.add_repo(owner, knot, resource).await
    }

    async fn remove_repo(&self, owner: &str, knot: &str, resource: &str) -> AppResult<()> {
        self.inner.remove_repo(owner, knot, resource).await
    }

    async fn add_collaborator(&self, resource: &str, subject: &str) -> AppResult<()> {
        if self.fail_collaborators.load(Ordering::SeqCst) {
            return Err(AppError::Internal("policy backend unavailable".into()));
        }
        self.inner.add_collaborator(resource, subject).await
    }

    async fn remove_collaborator(&self, resource: &str, subject: &str) -> AppResult<()> {
        self.inner.remove_collaborator(resource, subject).await
    }

    async fn can_write(&self, did: &str, resource: &str) -> AppResult<bool> {
        self.inner.can_write(did, resource).await
    }
}

#[tokio::test]
async fn collaborator_policy_failure_compensates() {
    let pds = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(put_record_ok(
            "at://did:plc:alice/sh.tangled.repo.collaborator/3kcollab001",
        ))
        .expect(1)
        .mount(&pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.deleteRecord"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&pds)
        .await;

    let index = Index::in_memory().await.unwrap();
    let repo = RepoRow {
        did: ALICE.to_string(),
        name: "demo".into(),
        rkey: "3krepo001".into(),
        knot: "knot.example.com".into(),
        description: String::new(),
        website: vec![],
        topics: vec![],
        spindle: None,
        source_at_uri: None,
        labels: vec![],
        created_at: chrono::Utc::now(),
    };
    repos::add_repo(index.pool(), &repo).await.unwrap();

    let policy = Arc::new(RejectingPolicy::new());
    let coordinator = coordinator(index.clone(), policy.clone());
    let client = pds_client(ALICE, &pds.uri());

    let err = coordinator
        .add_collaborator(
            &client,
            AddCollaboratorInput {
                repo_name: "demo".into(),
                subject: "bob.example.com".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Internal(_)), "{err:?}");

    // Compensation reloaded policy and the index has no collaborator row.
    assert!(policy.loads.load(Ordering::SeqCst) >= 1);
    assert!(collaborators::get(index.pool(), &repo.at_uri().to_string(), BOB)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn edit_surfaces_swap_conflicts() {
    let pds = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uri": "at://did:plc:alice/sh.tangled.repo/3krepo002",
            "cid": "bafyold001",
            "value": {
                "$type": "sh.tangled.repo",
                "name": "demo",
                "knot": "knot.example.com",
                "createdAt": "2026-01-01T00:00:00Z",
                "description": "old description",
            }
        })))
        .mount(&pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "InvalidSwap",
            "message": "record was updated since read",
        })))
        .mount(&pds)
        .await;

    let index = Index::in_memory().await.unwrap();
    let repo = RepoRow {
        did: ALICE.to_string(),
        name: "demo".into(),
        rkey: "3krepo002".into(),
        knot: "knot.example.com".into(),
        description: "old description".into(),
        website: vec![],
        topics: vec![],
        spindle: None,
        source_at_uri: None,
        labels: vec![],
        created_at: chrono::Utc::now(),
    };
    repos::add_repo(index.pool(), &repo).await.unwrap();

    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy);
    let client = pds_client(ALICE, &pds.uri());

    let err = coordinator
        .edit_repo(
            &client,
            "demo",
            EditRepoInput {
                description: Some("new description".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PdsConflict), "{err:?}");

    // The optimistic index update rolled back.
    let stored = repos::get_by_owner_name(index.pool(), ALICE, "demo")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.description, "old description");
}

async fn seed_labeled_repo(index: &Index) -> (RepoRow, String) {
    let def = labels::LabelDefRow {
        did: ALICE.to_string(),
        rkey: "3kdef001".into(),
        name: "status".into(),
        value_type: LabelValueType {
            concrete_type: ConcreteType::String,
            format: ValueFormat::Any,
            enum_values: vec!["open".into(), "closed".into()],
        },
        scope: vec!["sh.tangled.repo".into()],
        color: None,
        multiple: false,
        created_at: chrono::Utc::now(),
    };
    labels::add_def(index.pool(), &def).await.unwrap();
    let def_uri = def.at_uri().to_string();

    let repo = RepoRow {
        did: ALICE.to_string(),
        name: "demo".into(),
        rkey: "3krepo003".into(),
        knot: "knot.example.com".into(),
        description: String::new(),
        website: vec![],
        topics: vec![],
        spindle: None,
        source_at_uri: None,
        labels: vec![def_uri.clone()],
        created_at: chrono::Utc::now(),
    };
    repos::add_repo(index.pool(), &repo).await.unwrap();
    (repo, def_uri)
}

#[tokio::test]
async fn label_noop_writes_nothing() {
    let pds = MockServer::start().await;
    // No PDS traffic at all for a no-op.
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(put_record_ok("at://did:plc:alice/sh.tangled.label.op/x"))
        .expect(0)
        .mount(&pds)
        .await;

    let index = Index::in_memory().await.unwrap();
    let (repo, def_uri) = seed_labeled_repo(&index).await;
    let subject = repo.at_uri().to_string();

    // Current state: status=open.
    {
        let mut conn = index.pool().acquire().await.unwrap();
        labels::insert_ops(
            &mut conn,
            ALICE,
            "3kop001",
            &subject,
            &[tangled_appview::models::LabelOpEntry {
                operation: tangled_appview::models::LabelOperation::Add,
                key: def_uri.clone(),
                value: "open".into(),
            }],
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    }

    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy);
    let client = pds_client(ALICE, &pds.uri());

    let outcome = coordinator
        .perform_label_op(
            &client,
            PerformLabelOpInput {
                subject: subject.clone(),
                desired: vec![(def_uri.clone(), "open".into())],
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, LabelOpOutcome::NoOp);
}

#[tokio::test]
async fn label_change_emits_del_then_add() {
    let pds = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.putRecord"))
        .respond_with(put_record_ok(
            "at://did:plc:alice/sh.tangled.label.op/3kop999",
        ))
        .expect(1)
        .mount(&pds)
        .await;

    let index = Index::in_memory().await.unwrap();
    let (repo, def_uri) = seed_labeled_repo(&index).await;
    let subject = repo.at_uri().to_string();

    {
        let mut conn = index.pool().acquire().await.unwrap();
        labels::insert_ops(
            &mut conn,
            ALICE,
            "3kop002",
            &subject,
            &[tangled_appview::models::LabelOpEntry {
                operation: tangled_appview::models::LabelOperation::Add,
                key: def_uri.clone(),
                value: "open".into(),
            }],
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    }

    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy);
    let client = pds_client(ALICE, &pds.uri());

    let outcome = coordinator
        .perform_label_op(
            &client,
            PerformLabelOpInput {
                subject: subject.clone(),
                desired: vec![(def_uri.clone(), "closed".into())],
            },
        )
        .await
        .unwrap();
    match outcome {
        LabelOpOutcome::Applied { ops, .. } => assert_eq!(ops, 2),
        other => panic!("expected applied outcome, got {other:?}"),
    }

    // The index now reduces to status=closed.
    let log = labels::ops_for_subject(index.pool(), &subject).await.unwrap();
    let subscribed = [def_uri.clone()].into_iter().collect();
    let state = tangled_appview::write::labels::state_from_log(&log, &subscribed);
    assert_eq!(state.len(), 1);
    assert!(state.contains(&(def_uri, "closed".to_string())));
}

#[tokio::test]
async fn label_rejects_values_outside_the_enum() {
    let pds = MockServer::start().await;
    let index = Index::in_memory().await.unwrap();
    let (repo, def_uri) = seed_labeled_repo(&index).await;

    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy);
    let client = pds_client(ALICE, &pds.uri());

    let err = coordinator
        .perform_label_op(
            &client,
            PerformLabelOpInput {
                subject: repo.at_uri().to_string(),
                desired: vec![(def_uri, "wontfix".into())],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err:?}");
}

#[tokio::test]
async fn label_def_add_subscribes_the_repo() {
    let pds = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uri": "at://did:plc:alice/sh.tangled.repo/3krepo004",
            "cid": "bafyrepo004",
            "value": {
                "$type": "sh.tangled.repo",
                "name": "demo",
                "knot": "knot.example.com",
                "createdAt": "2026-01-01T00:00:00Z",
            }
        })))
        .up_to_n_times(1)
        .mount(&pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.applyWrites"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&pds)
        .await;

    let index = Index::in_memory().await.unwrap();
    let repo = RepoRow {
        did: ALICE.to_string(),
        name: "demo".into(),
        rkey: "3krepo004".into(),
        knot: "knot.example.com".into(),
        description: String::new(),
        website: vec![],
        topics: vec![],
        spindle: None,
        source_at_uri: None,
        labels: vec![],
        created_at: chrono::Utc::now(),
    };
    repos::add_repo(index.pool(), &repo).await.unwrap();

    let policy = in_memory_policy();
    let coordinator = coordinator(index.clone(), policy);
    let client = pds_client(ALICE, &pds.uri());

    let def = coordinator
        .add_label_def(
            &client,
            AddLabelDefInput {
                repo_name: "demo".into(),
                name: "priority".into(),
                value_type: LabelValueType {
                    concrete_type: ConcreteType::Integer,
                    format: ValueFormat::Any,
                    enum_values: vec![],
                },
                scope: vec!["sh.tangled.repo".into()],
                color: Some("#00ff00".into()),
                multiple: false,
            },
        )
        .await
        .unwrap();

    let stored = repos::get_by_owner_name(index.pool(), ALICE, "demo")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.labels, vec![def.at_uri().to_string()]);

    // Unsubscribing restores the original list.
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.repo.getRecord"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uri": "at://did:plc:alice/sh.tangled.repo/3krepo004",
            "cid": "bafyrepo005",
            "value": {
                "$type": "sh.tangled.repo",
                "name": "demo",
                "knot": "knot.example.com",
                "createdAt": "2026-01-01T00:00:00Z",
                "labels": [def.at_uri().to_string()],
            }
        })))
        .mount(&pds)
        .await;

    coordinator
        .delete_label_def(&client, "demo", &def.at_uri().to_string())
        .await
        .unwrap();
    let stored = repos::get_by_owner_name(index.pool(), ALICE, "demo")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.labels.is_empty());
}
