//! Conflict reconciliation (spec §4.6): per-`opType` strategies invoked when
//! the server returns `409 Conflict`. `UPDATE` performs a field-level
//! three-way merge; `CREATE`/`DELETE` resolve via a fetch-and-compare against
//! the resource the client thinks it was mutating.
//!
//! This crate owns no transport; it is handed a `RemoteLookup` so it stays
//! unit-testable without a socket, the same separation the teacher draws
//! between its order router and the broker adapters it delegates to.

use async_trait::async_trait;
use opsync_types::{ConflictPolicy, ErrorKind, LastError, OpType, Payload, PendingOp};
use std::collections::HashMap;

/// Fetches the server's current view of the resource an op addresses.
/// `Ok(None)` means the server returned 404.
#[async_trait]
pub trait RemoteLookup: Send + Sync {
    async fn fetch(&self, op: &PendingOp) -> Result<Option<Payload>, LastError>;
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// The op's effect is already in place server-side; treat as succeeded.
    TreatAsSucceeded,
    /// `UPDATE` merged cleanly; re-queue with this payload and `attempts` reset.
    Requeue { payload: Payload },
    /// No merge was possible under the configured policy (`abort`), or the
    /// op's effect genuinely could not be confirmed; archive to `failed`.
    Unresolved { reason: String },
}

/// Per-`entityType` fingerprint fields used to decide whether a server
/// resource "matches" a retried `CREATE` (spec §4.6). Entity types with no
/// configured fingerprint fall back to comparing every key the local payload
/// set.
#[derive(Debug, Clone, Default)]
pub struct FingerprintConfig {
    fields_by_entity_type: HashMap<String, Vec<String>>,
}

impl FingerprintConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, entity_type: impl Into<String>, fields: Vec<String>) {
        self.fields_by_entity_type.insert(entity_type.into(), fields);
    }

    fn fields_for<'a>(&'a self, entity_type: &str, local: &'a Payload) -> Vec<&'a str> {
        match self.fields_by_entity_type.get(entity_type) {
            Some(fields) => fields.iter().map(String::as_str).collect(),
            None => local.keys().map(String::as_str).collect(),
        }
    }
}

pub struct Reconciler {
    fingerprints: FingerprintConfig,
}

impl Reconciler {
    pub fn new(fingerprints: FingerprintConfig) -> Self {
        Self { fingerprints }
    }

    pub async fn reconcile(
        &self,
        op: &PendingOp,
        lookup: &dyn RemoteLookup,
    ) -> Result<ReconcileOutcome, LastError> {
        match op.op_type {
            OpType::Create => self.reconcile_create(op, lookup).await,
            OpType::Update => self.reconcile_update(op, lookup).await,
            OpType::Delete => self.reconcile_delete(op, lookup).await,
        }
    }

    async fn reconcile_create(
        &self,
        op: &PendingOp,
        lookup: &dyn RemoteLookup,
    ) -> Result<ReconcileOutcome, LastError> {
        let remote = lookup.fetch(op).await?;
        let Some(remote) = remote else {
            return Ok(ReconcileOutcome::Unresolved {
                reason: "create conflict but no matching resource found remotely".to_string(),
            });
        };

        let fields = self.fingerprints.fields_for(&op.entity_type, &op.payload);
        let matches = fields
            .iter()
            .all(|f| op.payload.get(*f) == remote.get(*f));

        if matches {
            Ok(ReconcileOutcome::TreatAsSucceeded)
        } else {
            Ok(ReconcileOutcome::Unresolved {
                reason: "remote resource exists but does not match fingerprint fields".to_string(),
            })
        }
    }

    async fn reconcile_delete(
        &self,
        op: &PendingOp,
        lookup: &dyn RemoteLookup,
    ) -> Result<ReconcileOutcome, LastError> {
        match lookup.fetch(op).await {
            Ok(None) => Ok(ReconcileOutcome::TreatAsSucceeded),
            Ok(Some(_)) => Ok(ReconcileOutcome::Unresolved {
                reason: "delete conflict but resource still exists remotely".to_string(),
            }),
            Err(e) if e.http_status == Some(404) => Ok(ReconcileOutcome::TreatAsSucceeded),
            Err(e) => Err(e),
        }
    }

    async fn reconcile_update(
        &self,
        op: &PendingOp,
        lookup: &dyn RemoteLookup,
    ) -> Result<ReconcileOutcome, LastError> {
        let remote = lookup.fetch(op).await?.ok_or_else(|| LastError {
            kind: ErrorKind::ConflictUnresolved,
            message: "update conflict but resource no longer exists remotely".to_string(),
            http_status: Some(404),
            retry_after: None,
        })?;
        let base = op.merge_base.clone().unwrap_or_default();

        match three_way_merge(&base, &op.payload, &remote, op.conflict_policy) {
            Ok(merged) => Ok(ReconcileOutcome::Requeue { payload: merged }),
            Err(field) => Ok(ReconcileOutcome::Unresolved {
                reason: format!("conflict policy `abort` triggered on field `{field}`"),
            }),
        }
    }
}

/// `base` = server-last-known snapshot captured when the op first went
/// in-flight; `local` = the op's own payload; `remote` = freshly fetched
/// current state. A field in `local` only counts as a genuine conflict if
/// `remote` also moved it away from `base` — otherwise it's a clean local
/// write over an unchanged field. Fields local never touched pass through
/// from `remote` untouched (spec §4.6, scenario S4).
///
/// Returns `Err(field_name)` the first time `abort` is triggered.
fn three_way_merge(
    base: &Payload,
    local: &Payload,
    remote: &Payload,
    policy: ConflictPolicy,
) -> Result<Payload, String> {
    let mut merged = remote.clone();

    for (key, local_value) in local {
        match remote.get(key) {
            None => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(remote_value) if base.get(key) == Some(remote_value) => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(remote_value) => match policy {
                ConflictPolicy::LastWriteWins => {
                    merged.insert(key.clone(), local_value.clone());
                }
                ConflictPolicy::ServerWins => {
                    merged.insert(key.clone(), remote_value.clone());
                }
                ConflictPolicy::Abort => return Err(key.clone()),
            },
        }
    }

    Ok(merged)
}
