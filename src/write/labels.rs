//! Label writes
//!
//! Two kinds: definition writes (create/remove a label definition and adjust
//! the repo's subscription list in one atomic PDS batch), and op writes (the
//! UI submits the desired final state; the coordinator diffs it against the
//! reduction of the existing op-log, validates every change against its
//! definition, and appends one op record).

use crate::error::{AppError, AppResult};
use crate::index::labels::{self, LabelDefRow, LabelOpRow};
use crate::index::repos;
use crate::metrics;
use crate::models::{
    AtUri, LabelDefinitionRecord, LabelOpEntry, LabelOpRecord, LabelOperation, LabelValueType,
    Record, RepoRecord, LABEL_DEFINITION_NSID, LABEL_OP_NSID, REPO_NSID,
};
use crate::services::PdsClient;
use crate::tid;
use crate::validate;
use crate::write::{Compensator, Restore, WriteCoordinator};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};

/// Label state for one subject: the set of `(definition-uri, value)` pairs
/// currently attached.
pub type LabelState = BTreeSet<(String, String)>;

/// Apply an op sequence to a starting state.
pub fn apply_ops(state: &LabelState, ops: &[LabelOpEntry]) -> LabelState {
    let mut next = state.clone();
    for op in ops {
        let pair = (op.key.clone(), op.value.clone());
        match op.operation {
            LabelOperation::Add => {
                next.insert(pair);
            }
            LabelOperation::Del => {
                next.remove(&pair);
            }
        }
    }
    next
}

/// The minimal op sequence turning `current` into `desired`: deletions
/// first, then additions.
pub fn diff_states(current: &LabelState, desired: &LabelState) -> Vec<LabelOpEntry> {
    let mut ops = Vec::new();
    for (key, value) in current.difference(desired) {
        ops.push(LabelOpEntry {
            operation: LabelOperation::Del,
            key: key.clone(),
            value: value.clone(),
        });
    }
    for (key, value) in desired.difference(current) {
        ops.push(LabelOpEntry {
            operation: LabelOperation::Add,
            key: key.clone(),
            value: value.clone(),
        });
    }
    ops
}

/// Reduce an op sequence relative to a known starting state: contradictory
/// pairs cancel and no-ops vanish, leaving exactly the ops whose effect
/// survives.
pub fn reduce_ops(start: &LabelState, ops: &[LabelOpEntry]) -> Vec<LabelOpEntry> {
    diff_states(start, &apply_ops(start, ops))
}

/// Reduce a stored op-log into the current state, considering only
/// subscribed definitions.
pub fn state_from_log(log: &[LabelOpRow], subscribed: &BTreeSet<String>) -> LabelState {
    let mut state = LabelState::new();
    for row in log {
        if !subscribed.contains(&row.operand_key) {
            continue;
        }
        let pair = (row.operand_key.clone(), row.operand_value.clone());
        match row.operation {
            LabelOperation::Add => {
                state.insert(pair);
            }
            LabelOperation::Del => {
                state.remove(&pair);
            }
        }
    }
    state
}

#[derive(Debug, Clone)]
pub struct AddLabelDefInput {
    pub repo_name: String,
    pub name: String,
    pub value_type: LabelValueType,
    pub scope: Vec<String>,
    pub color: Option<String>,
    pub multiple: bool,
}

#[derive(Debug, Clone)]
pub struct PerformLabelOpInput {
    /// AT-URI of the labeled record.
    pub subject: String,
    /// Desired final state: `(definition-uri, value)` pairs.
    pub desired: Vec<(String, String)>,
}

/// What a perform-op produced.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelOpOutcome {
    /// The desired state matched the current state; nothing was written.
    NoOp,
    /// One op record was appended carrying this many entries.
    Applied { ops: usize, rkey: String },
}

impl WriteCoordinator {
    /// Create a label definition and subscribe the repo to it, atomically on
    /// the PDS via `applyWrites`.
    pub async fn add_label_def(
        &self,
        pds: &PdsClient,
        input: AddLabelDefInput,
    ) -> AppResult<LabelDefRow> {
        let row = self.require_repo(pds.did(), &input.repo_name).await?;
        self.ensure_owner(pds, &row).await?;

        let now = Utc::now();
        let def_record = LabelDefinitionRecord {
            name: input.name.clone(),
            value_type: input.value_type.clone(),
            scope: input.scope.clone(),
            color: input.color.clone(),
            multiple: input.multiple,
            created_at: now,
        };
        validate::validate_label_definition(&def_record)?;

        let rkey = tid::next_tid();
        let def = LabelDefRow {
            did: pds.did().to_string(),
            rkey: rkey.clone(),
            name: input.name.clone(),
            value_type: input.value_type.clone(),
            scope: input.scope.clone(),
            color: input.color.clone(),
            multiple: input.multiple,
            created_at: now,
        };
        let def_uri = def.at_uri();

        // The repo record picks up the subscription in the same batch.
        let repo_current = pds.get_record(REPO_NSID, &row.rkey).await?;
        let previous_repo = Record::from_value(repo_current.value)?;
        let mut repo_record = match &previous_repo {
            Record::Repo(r) => r.clone(),
            _ => return Err(AppError::Internal("repo record has unexpected type".into())),
        };
        if repo_record.labels.iter().any(|l| l == &def_uri.to_string()) {
            return Err(AppError::AlreadyExists("label already subscribed".into()));
        }
        repo_record.labels.push(def_uri.to_string());

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        let local: AppResult<()> = async {
            labels::add_def(&mut *txn, &def).await?;
            repos::set_labels(&mut *txn, &row.did, &row.rkey, &repo_record.labels).await?;
            Ok(())
        }
        .await;
        if let Err(e) = local {
            comp.run(txn).await;
            return Err(e);
        }

        let writes = vec![
            json!({
                "$type": "com.atproto.repo.applyWrites#create",
                "collection": LABEL_DEFINITION_NSID,
                "rkey": rkey,
                "value": Record::LabelDefinition(def_record.clone()).to_value()?,
            }),
            json!({
                "$type": "com.atproto.repo.applyWrites#update",
                "collection": REPO_NSID,
                "rkey": row.rkey,
                "value": Record::Repo(repo_record.clone()).to_value()?,
            }),
        ];
        if let Err(e) = pds.apply_writes(writes).await {
            comp.run(txn).await;
            return Err(e);
        }
        comp.created(def_uri.clone());
        comp.restore(Restore {
            collection: REPO_NSID.to_string(),
            rkey: row.rkey.clone(),
            record: previous_repo,
            swap_cid: None,
        });

        crate::write::commit_and_save_policy(txn, comp, &self.policy, false).await?;
        metrics::record_write("add_label_def");
        Ok(def)
    }

    /// Remove a label definition and the repo's subscription to it.
    pub async fn delete_label_def(
        &self,
        pds: &PdsClient,
        repo_name: &str,
        def_uri: &str,
    ) -> AppResult<()> {
        let row = self.require_repo(pds.did(), repo_name).await?;
        self.ensure_owner(pds, &row).await?;
        let def_uri: AtUri = def_uri.parse()?;
        if def_uri.did != pds.did() {
            return Err(AppError::Forbidden(
                "only the definition owner may remove it".into(),
            ));
        }
        let def = labels::get_def(self.index.pool(), &def_uri)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("label definition {def_uri}")))?;

        let repo_current = pds.get_record(REPO_NSID, &row.rkey).await?;
        let previous_repo = Record::from_value(repo_current.value)?;
        let mut repo_record = match &previous_repo {
            Record::Repo(r) => r.clone(),
            _ => return Err(AppError::Internal("repo record has unexpected type".into())),
        };
        repo_record.labels.retain(|l| l != &def_uri.to_string());

        let previous_def = match pds.get_record(LABEL_DEFINITION_NSID, &def.rkey).await {
            Ok(current) => Some(Record::from_value(current.value)?),
            Err(AppError::Validation(_)) | Err(AppError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        let local: AppResult<()> = async {
            labels::delete_def(&mut *txn, &def.did, &def.rkey).await?;
            repos::set_labels(&mut *txn, &row.did, &row.rkey, &repo_record.labels).await?;
            Ok(())
        }
        .await;
        if let Err(e) = local {
            comp.run(txn).await;
            return Err(e);
        }

        let writes = vec![
            json!({
                "$type": "com.atproto.repo.applyWrites#delete",
                "collection": LABEL_DEFINITION_NSID,
                "rkey": def.rkey,
            }),
            json!({
                "$type": "com.atproto.repo.applyWrites#update",
                "collection": REPO_NSID,
                "rkey": row.rkey,
                "value": Record::Repo(repo_record.clone()).to_value()?,
            }),
        ];
        if let Err(e) = pds.apply_writes(writes).await {
            comp.run(txn).await;
            return Err(e);
        }
        if let Some(record) = previous_def {
            comp.restore(Restore {
                collection: LABEL_DEFINITION_NSID.to_string(),
                rkey: def.rkey.clone(),
                record,
                swap_cid: None,
            });
        }
        comp.restore(Restore {
            collection: REPO_NSID.to_string(),
            rkey: row.rkey.clone(),
            record: previous_repo,
            swap_cid: None,
        });

        crate::write::commit_and_save_policy(txn, comp, &self.policy, false).await?;
        metrics::record_write("delete_label_def");
        Ok(())
    }

    /// Apply the desired final label state to a subject. No-op submissions
    /// produce no record at all.
    pub async fn perform_label_op(
        &self,
        pds: &PdsClient,
        input: PerformLabelOpInput,
    ) -> AppResult<LabelOpOutcome> {
        let subject_uri: AtUri = input.subject.parse()?;
        let host_repo = repos::get_by_at_uri(self.index.pool(), &subject_uri)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("subject {subject_uri}")))?;
        self.ensure_can_write(pds, &host_repo).await?;

        let subscribed: BTreeSet<String> = host_repo.labels.iter().cloned().collect();

        // Resolve every referenced definition once.
        let mut defs: HashMap<String, LabelDefRow> = HashMap::new();
        for uri in &subscribed {
            let parsed: AtUri = uri.parse()?;
            if let Some(def) = labels::get_def(self.index.pool(), &parsed).await? {
                defs.insert(uri.clone(), def);
            }
        }

        let mut desired = LabelState::new();
        for (key, value) in &input.desired {
            let def = defs.get(key).ok_or_else(|| {
                AppError::Validation(format!("label {key} is not subscribed by this repository"))
            })?;
            if !def.scope.iter().any(|c| c == &subject_uri.collection) {
                return Err(AppError::Validation(format!(
                    "label {} does not apply to {}",
                    def.name, subject_uri.collection
                )));
            }
            let def_record = LabelDefinitionRecord {
                name: def.name.clone(),
                value_type: def.value_type.clone(),
                scope: def.scope.clone(),
                color: def.color.clone(),
                multiple: def.multiple,
                created_at: def.created_at,
            };
            validate::validate_label_value(&def_record, value)?;
            if !def.multiple && desired.iter().any(|(k, _)| k == key) {
                return Err(AppError::Validation(format!(
                    "label {} takes a single value",
                    def.name
                )));
            }
            desired.insert((key.clone(), value.clone()));
        }

        let log = labels::ops_for_subject(self.index.pool(), &input.subject).await?;
        let current = state_from_log(&log, &subscribed);

        let ops = diff_states(&current, &desired);
        if ops.is_empty() {
            metrics::record_write("label_op_noop");
            return Ok(LabelOpOutcome::NoOp);
        }

        let rkey = tid::next_tid();
        let now = Utc::now();
        let record = Record::LabelOp(LabelOpRecord {
            subject: input.subject.clone(),
            ops: ops.clone(),
            performed_at: now,
        });

        let mut txn = self.index.begin().await?;
        let mut comp = Compensator::new(pds, &self.policy);

        if let Err(e) =
            labels::insert_ops(&mut *txn, pds.did(), &rkey, &input.subject, &ops, now).await
        {
            comp.run(txn).await;
            return Err(e);
        }

        let put = match pds.put_record(LABEL_OP_NSID, &rkey, &record, None).await {
            Ok(put) => put,
            Err(e) => {
                comp.run(txn).await;
                return Err(e);
            }
        };
        comp.created(
            put.uri
                .parse()
                .unwrap_or_else(|_| AtUri::new(pds.did(), LABEL_OP_NSID, &rkey)),
        );

        crate::write::commit_and_save_policy(txn, comp, &self.policy, false).await?;
        metrics::record_write("label_op");
        Ok(LabelOpOutcome::Applied {
            ops: ops.len(),
            rkey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(key: &str, value: &str) -> LabelOpEntry {
        LabelOpEntry {
            operation: LabelOperation::Add,
            key: key.into(),
            value: value.into(),
        }
    }

    fn del(key: &str, value: &str) -> LabelOpEntry {
        LabelOpEntry {
            operation: LabelOperation::Del,
            key: key.into(),
            value: value.into(),
        }
    }

    fn state(pairs: &[(&str, &str)]) -> LabelState {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn diff_emits_dels_before_adds() {
        let current = state(&[("status", "open")]);
        let desired = state(&[("status", "closed")]);
        let ops = diff_states(&current, &desired);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].operation, LabelOperation::Del);
        assert_eq!(ops[0].value, "open");
        assert_eq!(ops[1].operation, LabelOperation::Add);
        assert_eq!(ops[1].value, "closed");
    }

    #[test]
    fn identical_states_diff_to_nothing() {
        let current = state(&[("status", "open")]);
        assert!(diff_states(&current, &current).is_empty());
    }

    #[test]
    fn add_then_del_reduces_to_empty() {
        let start = LabelState::new();
        let ops = vec![add("k", "v"), del("k", "v")];
        assert!(reduce_ops(&start, &ops).is_empty());
    }

    #[test]
    fn reduction_preserves_final_state() {
        // The reduced sequence must land on the same final state as the
        // original, from the same start.
        let start = state(&[("a", "1"), ("b", "2")]);
        let ops = vec![
            del("a", "1"),
            add("a", "1"),
            add("c", "3"),
            del("b", "2"),
            add("b", "9"),
            del("c", "3"),
            add("c", "4"),
        ];
        let reduced = reduce_ops(&start, &ops);
        assert_eq!(apply_ops(&start, &reduced), apply_ops(&start, &ops));
        assert!(reduced.len() <= ops.len());
        // No contradictions survive: each (key, value) appears at most once.
        let mut seen = std::collections::HashSet::new();
        for op in &reduced {
            assert!(seen.insert((op.key.clone(), op.value.clone())));
        }
    }

    #[test]
    fn log_reduction_ignores_unsubscribed_defs() {
        use chrono::Utc;
        let now = Utc::now();
        let row = |op: LabelOperation, key: &str, value: &str| LabelOpRow {
            did: "did:plc:x".into(),
            rkey: "r".into(),
            subject: "at://did:plc:x/sh.tangled.repo/1".into(),
            operation: op,
            operand_key: key.into(),
            operand_value: value.into(),
            performed_at: now,
            indexed_at: now,
        };
        let log = vec![
            row(LabelOperation::Add, "at://a/def/1", "open"),
            row(LabelOperation::Add, "at://a/def/2", "nope"),
            row(LabelOperation::Del, "at://a/def/1", "open"),
            row(LabelOperation::Add, "at://a/def/1", "closed"),
        ];
        let subscribed: BTreeSet<String> = ["at://a/def/1".to_string()].into_iter().collect();
        let state = state_from_log(&log, &subscribed);
        assert_eq!(state.len(), 1);
        assert!(state.contains(&("at://a/def/1".to_string(), "closed".to_string())));
    }
}
