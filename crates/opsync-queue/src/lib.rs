//! The durable queue (spec §4.1): enqueue with batch coalescing and
//! dedup, FIFO-with-skip scheduling, and the `pending`/`failed` lifecycle.
//!
//! `enqueue` is the only externally concurrent entry point (spec §5); every
//! mutating method here is serialized by an in-process mutex guarding the
//! index so that coalescing decisions and their persistence happen
//! atomically with respect to each other.

use chrono::{DateTime, Utc};
use opsync_kvstore::{PersistentMap, Space, StorageError, TypedMap};
use opsync_types::{LastError, OpStatus, OpType, Payload, PendingOp};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum QueueError {
    /// `id` already present in `pending` or `failed` (spec §3.1 invariant 3).
    DuplicateId(String),
    NotFound(String),
    /// Attempted an operation from a status that does not permit it, e.g.
    /// cancelling an op that is already `inFlight`.
    InvalidState { id: String, status: OpStatus },
    Storage(StorageError),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::DuplicateId(id) => write!(f, "duplicate op id: {id}"),
            QueueError::NotFound(id) => write!(f, "op not found: {id}"),
            QueueError::InvalidState { id, status } => {
                write!(f, "op {id} is in status {status:?}, operation not permitted")
            }
            QueueError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        QueueError::Storage(e)
    }
}

/// Result of `Queue::enqueue` (spec §4.1, §6.1). `enqueue` always returns
/// the id the caller should treat as canonical going forward — which is not
/// always the id of the `PendingOp` passed in.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// Persisted as a new, independent op.
    Inserted { id: String },
    /// `UPDATE` merged into an existing queued `UPDATE` for the same entity;
    /// nothing new was persisted.
    MergedIntoExisting { existing_id: String },
    /// `CREATE` rejected because a queued `CREATE` for the same entity
    /// already exists (spec §4.1).
    RejectedDuplicateCreate { existing_id: String },
    /// `DELETE` cancelled a queued `CREATE` for the same entity; both ops
    /// vanish without ever reaching the network. The caller (the engine) is
    /// responsible for resolving both ops' optimistic transaction tokens.
    Annihilated {
        removed_create_id: String,
        removed_create_txn_token: Option<String>,
        incoming_delete_txn_token: Option<String>,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct FailedRecord {
    #[serde(flatten)]
    op: PendingOp,
    archived_at: DateTime<Utc>,
    archived_reason: String,
}

struct Inner {
    /// `entityId`s currently held by an `inFlight` or `reconciling` op.
    /// Rebuilt from `pending` at construction time; never persisted (spec §9
    /// design notes: the engine resets leftover `inFlight` ops to `queued` on
    /// startup, at which point this set is naturally empty again).
    busy_entities: HashSet<String>,
}

pub struct Queue<M: PersistentMap> {
    map: Arc<M>,
    inner: Mutex<Inner>,
}

impl<M: PersistentMap> Queue<M> {
    /// Rebuild in-memory bookkeeping (`busy_entities`) from whatever is
    /// durably `pending` right now.
    pub async fn load(map: Arc<M>) -> Result<Self, QueueError> {
        let rows: Vec<(String, PendingOp)> = map.scan_json(Space::Pending).await?;
        let busy_entities = rows
            .into_iter()
            .filter(|(_, op)| matches!(op.status, OpStatus::InFlight | OpStatus::Reconciling))
            .filter_map(|(_, op)| op.entity_id)
            .collect();
        Ok(Self {
            map,
            inner: Mutex::new(Inner { busy_entities }),
        })
    }

    async fn index_get(&self, entity_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .map
            .get_json(Space::Index, entity_id)
            .await?
            .unwrap_or_default())
    }

    async fn index_put(&self, entity_id: &str, ids: &[String]) -> Result<(), StorageError> {
        if ids.is_empty() {
            self.map.delete(Space::Index, entity_id).await
        } else {
            self.map.put_json(Space::Index, entity_id, &ids).await
        }
    }

    async fn load_pending(&self, id: &str) -> Result<Option<PendingOp>, QueueError> {
        Ok(self.map.get_json(Space::Pending, id).await?)
    }

    /// Persist a new op to `pending`, retrying the write once on storage
    /// failure before propagating (spec §7: an accepted op must never be
    /// lost silently to a transient persistence hiccup).
    async fn put_pending_with_retry(&self, op: &PendingOp) -> Result<(), QueueError> {
        match self.map.put_json(Space::Pending, &op.id, op).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(op_id = %op.id, error = %first, "pending write failed, retrying once");
                self.map
                    .put_json(Space::Pending, &op.id, op)
                    .await
                    .map_err(QueueError::from)
            }
        }
    }

    /// Insert `op`, applying dedup and batch-coalescing rules (spec §4.1).
    pub async fn enqueue(&self, op: PendingOp) -> Result<EnqueueOutcome, QueueError> {
        let _guard = self.inner.lock().await;

        if self.load_pending(&op.id).await?.is_some() {
            return Err(QueueError::DuplicateId(op.id));
        }
        if self
            .map
            .get(Space::Failed, &op.id)
            .await
            .map_err(QueueError::from)?
            .is_some()
        {
            return Err(QueueError::DuplicateId(op.id));
        }

        let Some(entity_id) = op.entity_id.clone() else {
            // No entity to coalesce against; insert unconditionally.
            self.put_pending_with_retry(&op).await?;
            return Ok(EnqueueOutcome::Inserted { id: op.id });
        };

        let mut sibling_ids = self.index_get(&entity_id).await?;
        let mut siblings = Vec::with_capacity(sibling_ids.len());
        for id in &sibling_ids {
            if let Some(sib) = self.load_pending(id).await? {
                siblings.push(sib);
            }
        }
        // Frozen ops (inFlight/reconciling) are never coalescing candidates.
        let coalescable: Vec<&PendingOp> = siblings
            .iter()
            .filter(|s| matches!(s.status, OpStatus::Queued))
            .collect();

        match op.op_type {
            OpType::Create => {
                if let Some(existing) = coalescable.iter().find(|s| s.op_type == OpType::Create) {
                    return Ok(EnqueueOutcome::RejectedDuplicateCreate {
                        existing_id: existing.id.clone(),
                    });
                }
                self.put_pending_with_retry(&op).await?;
                sibling_ids.push(op.id.clone());
                self.index_put(&entity_id, &sibling_ids).await?;
                Ok(EnqueueOutcome::Inserted { id: op.id })
            }
            OpType::Update => {
                if let Some(existing) = coalescable.iter().find(|s| s.op_type == OpType::Update) {
                    let existing_id = existing.id.clone();
                    let mut merged = (*existing).clone();
                    for (k, v) in op.payload {
                        merged.payload.insert(k, v);
                    }
                    merged.updated_at = op.updated_at;
                    self.put_pending_with_retry(&merged).await?;
                    Ok(EnqueueOutcome::MergedIntoExisting { existing_id })
                } else {
                    self.put_pending_with_retry(&op).await?;
                    sibling_ids.push(op.id.clone());
                    self.index_put(&entity_id, &sibling_ids).await?;
                    Ok(EnqueueOutcome::Inserted { id: op.id })
                }
            }
            OpType::Delete => {
                let create = coalescable
                    .iter()
                    .find(|s| s.op_type == OpType::Create)
                    .map(|s| (*s).clone());
                let queued_updates: Vec<String> = coalescable
                    .iter()
                    .filter(|s| s.op_type == OpType::Update)
                    .map(|s| s.id.clone())
                    .collect();

                for update_id in &queued_updates {
                    self.map.delete(Space::Pending, update_id).await?;
                    sibling_ids.retain(|id| id != update_id);
                }

                if let Some(create_op) = create {
                    self.map.delete(Space::Pending, &create_op.id).await?;
                    sibling_ids.retain(|id| id != &create_op.id);
                    self.index_put(&entity_id, &sibling_ids).await?;
                    return Ok(EnqueueOutcome::Annihilated {
                        removed_create_id: create_op.id,
                        removed_create_txn_token: create_op.txn_token,
                        incoming_delete_txn_token: op.txn_token,
                    });
                }

                self.put_pending_with_retry(&op).await?;
                sibling_ids.push(op.id.clone());
                self.index_put(&entity_id, &sibling_ids).await?;
                Ok(EnqueueOutcome::Inserted { id: op.id })
            }
        }
    }

    /// FIFO-by-`(created_at, id)`, skipping ops whose entity is busy or
    /// whose `next_attempt_not_before` has not yet elapsed (spec §4.1, §4.9).
    pub async fn peek_next_runnable(&self, now: DateTime<Utc>) -> Result<Option<PendingOp>, QueueError> {
        let guard = self.inner.lock().await;
        let mut rows: Vec<(String, PendingOp)> = self.map.scan_json(Space::Pending).await?;
        rows.sort_by(|a, b| (a.1.created_at, &a.0).cmp(&(b.1.created_at, &b.0)));

        for (_, op) in rows {
            if op.status != OpStatus::Queued {
                continue;
            }
            if let Some(not_before) = op.next_attempt_not_before {
                if not_before > now {
                    continue;
                }
            }
            if let Some(entity_id) = &op.entity_id {
                if guard.busy_entities.contains(entity_id) {
                    continue;
                }
            }
            return Ok(Some(op));
        }
        Ok(None)
    }

    /// Rewrite an op's payload after a successful reconcile merge (spec
    /// §4.6): `attempts` resets to 0 and the op re-enters `queued` at the
    /// front of its own FIFO position (its `created_at` is unchanged).
    pub async fn requeue_with_merged_payload(
        &self,
        id: &str,
        payload: opsync_types::Payload,
        now: DateTime<Utc>,
    ) -> Result<PendingOp, QueueError> {
        let mut guard = self.inner.lock().await;
        let mut op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        op.payload = payload;
        op.attempts = 0;
        op.status = OpStatus::Queued;
        op.next_attempt_not_before = None;
        op.updated_at = now;
        self.map.put_json(Space::Pending, id, &op).await?;
        if let Some(entity_id) = &op.entity_id {
            guard.busy_entities.remove(entity_id);
        }
        Ok(op)
    }

    /// Reset any op left `inFlight` by a prior crash back to `queued` (spec
    /// §4.9 start step 3). The unchanged `idempotencyKey` makes the next
    /// attempt safe.
    pub async fn recover_stale_in_flight(&self, now: DateTime<Utc>) -> Result<Vec<PendingOp>, QueueError> {
        let mut guard = self.inner.lock().await;
        let rows: Vec<(String, PendingOp)> = self.map.scan_json(Space::Pending).await?;
        let mut recovered = Vec::new();
        for (id, mut op) in rows {
            if op.status != OpStatus::InFlight {
                continue;
            }
            op.status = OpStatus::Queued;
            op.updated_at = now;
            self.map.put_json(Space::Pending, &id, &op).await?;
            if let Some(entity_id) = &op.entity_id {
                guard.busy_entities.remove(entity_id);
            }
            recovered.push(op);
        }
        Ok(recovered)
    }

    pub async fn mark_in_flight(&self, id: &str, now: DateTime<Utc>) -> Result<PendingOp, QueueError> {
        let mut guard = self.inner.lock().await;
        let mut op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        op.status = OpStatus::InFlight;
        op.attempts += 1;
        op.updated_at = now;
        self.map.put_json(Space::Pending, id, &op).await?;
        if let Some(entity_id) = &op.entity_id {
            guard.busy_entities.insert(entity_id.clone());
        }
        Ok(op)
    }

    /// Capture the server-last-known snapshot the first time an `UPDATE` op
    /// goes in-flight (spec §4.6: "base = server-last-known, stored with op
    /// when first in-flight"). A later conflict's three-way merge diffs
    /// against this instead of an empty map, so only fields the server
    /// actually moved count as genuine conflicts.
    pub async fn set_merge_base(&self, id: &str, base: Payload, now: DateTime<Utc>) -> Result<PendingOp, QueueError> {
        let _guard = self.inner.lock().await;
        let mut op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        op.merge_base = Some(base);
        op.updated_at = now;
        self.map.put_json(Space::Pending, id, &op).await?;
        Ok(op)
    }

    pub async fn mark_reconciling(&self, id: &str, now: DateTime<Utc>) -> Result<PendingOp, QueueError> {
        let _guard = self.inner.lock().await;
        let mut op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        op.status = OpStatus::Reconciling;
        op.updated_at = now;
        self.map.put_json(Space::Pending, id, &op).await?;
        Ok(op)
    }

    /// Purge a succeeded op from `pending`. Returns the removed op so the
    /// caller can finalize its optimistic transaction.
    pub async fn mark_succeeded(&self, id: &str) -> Result<PendingOp, QueueError> {
        let mut guard = self.inner.lock().await;
        let op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        self.remove_from_pending(&mut guard, &op).await?;
        Ok(op)
    }

    pub async fn schedule_retry(
        &self,
        id: &str,
        not_before: DateTime<Utc>,
        error: LastError,
        now: DateTime<Utc>,
    ) -> Result<PendingOp, QueueError> {
        let mut guard = self.inner.lock().await;
        let mut op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        op.status = OpStatus::Queued;
        op.next_attempt_not_before = Some(not_before);
        op.last_error = Some(error);
        op.updated_at = now;
        self.map.put_json(Space::Pending, id, &op).await?;
        if let Some(entity_id) = &op.entity_id {
            guard.busy_entities.remove(entity_id);
        }
        Ok(op)
    }

    /// Move an op out of `pending` into `failed` with terminal-error
    /// metadata (spec §6.3). Returns the archived op so the caller can fire
    /// the rollback hook.
    pub async fn archive_to_failed(
        &self,
        id: &str,
        reason: impl Into<String>,
        error: LastError,
        now: DateTime<Utc>,
    ) -> Result<PendingOp, QueueError> {
        let mut guard = self.inner.lock().await;
        let mut op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        op.status = OpStatus::Failed;
        op.last_error = Some(error);
        op.updated_at = now;

        let record = FailedRecord {
            op: op.clone(),
            archived_at: now,
            archived_reason: reason.into(),
        };
        self.map.put_json(Space::Failed, id, &record).await?;
        self.remove_from_pending(&mut guard, &op).await?;
        Ok(op)
    }

    async fn remove_from_pending(&self, guard: &mut Inner, op: &PendingOp) -> Result<(), QueueError> {
        self.map.delete(Space::Pending, &op.id).await?;
        if let Some(entity_id) = &op.entity_id {
            guard.busy_entities.remove(entity_id);
            let mut ids = self.index_get(entity_id).await?;
            ids.retain(|i| i != &op.id);
            self.index_put(entity_id, &ids).await?;
        }
        Ok(())
    }

    /// Move an op back from `failed` to `pending`, resetting its retry
    /// state (spec §6.4 `retryFromFailed`). Returns `false` if `id` is not
    /// currently archived.
    pub async fn retry_from_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let _guard = self.inner.lock().await;
        let record: Option<FailedRecord> = self.map.get_json(Space::Failed, id).await?;
        let Some(record) = record else {
            return Ok(false);
        };
        let mut op = record.op;
        op.status = OpStatus::Queued;
        op.attempts = 0;
        op.next_attempt_not_before = None;
        op.last_error = None;
        op.updated_at = now;

        self.map.put_json(Space::Pending, id, &op).await?;
        self.map.delete(Space::Failed, id).await?;
        if let Some(entity_id) = &op.entity_id {
            let mut ids = self.index_get(entity_id).await?;
            if !ids.contains(&op.id) {
                ids.push(op.id.clone());
            }
            self.index_put(entity_id, &ids).await?;
        }
        Ok(true)
    }

    /// Cancel a still-`queued` op (spec §6.1 `cancel`). Returns the removed
    /// op for rollback, or `Err(InvalidState)` if it is no longer queued.
    pub async fn cancel(&self, id: &str) -> Result<PendingOp, QueueError> {
        let mut guard = self.inner.lock().await;
        let op = self
            .load_pending(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if op.status != OpStatus::Queued {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: op.status,
            });
        }
        self.remove_from_pending(&mut guard, &op).await?;
        Ok(op)
    }

    pub async fn lookup_by_entity(&self, entity_id: &str) -> Result<Vec<String>, QueueError> {
        Ok(self.index_get(entity_id).await?)
    }

    pub async fn size(&self) -> Result<usize, QueueError> {
        Ok(self.map.scan(Space::Pending).await?.len())
    }

    pub async fn failed_size(&self) -> Result<usize, QueueError> {
        Ok(self.map.scan(Space::Failed).await?.len())
    }

    /// All pending ops, oldest first (spec §6.4 `inspect`: "oldest op age").
    pub async fn pending_ops(&self) -> Result<Vec<PendingOp>, QueueError> {
        let mut rows: Vec<(String, PendingOp)> = self.map.scan_json(Space::Pending).await?;
        rows.sort_by(|a, b| (a.1.created_at, &a.0).cmp(&(b.1.created_at, &b.0)));
        Ok(rows.into_iter().map(|(_, op)| op).collect())
    }

    /// All archived ops, for `retry-failed --all` and `inspect` listings.
    pub async fn failed_ops(&self) -> Result<Vec<PendingOp>, QueueError> {
        let rows: Vec<(String, FailedRecord)> = self.map.scan_json(Space::Failed).await?;
        Ok(rows.into_iter().map(|(_, r)| r.op).collect())
    }

    /// Reconstruct `index/*` from `pending/*` (spec §6.4 `rebuild-index`).
    /// Existing index entries are wiped first so stale entries from a prior
    /// bug can't survive the rebuild. Returns the number of entities indexed.
    pub async fn rebuild_index(&self) -> Result<usize, QueueError> {
        let _guard = self.inner.lock().await;
        let existing: Vec<(String, Vec<u8>)> = self.map.scan(Space::Index).await?;
        for (entity_id, _) in &existing {
            self.map.delete(Space::Index, entity_id).await?;
        }

        let rows: Vec<(String, PendingOp)> = self.map.scan_json(Space::Pending).await?;
        let mut by_entity: std::collections::BTreeMap<String, Vec<String>> = std::collections::BTreeMap::new();
        for (_, op) in rows {
            if let Some(entity_id) = op.entity_id {
                by_entity.entry(entity_id).or_default().push(op.id);
            }
        }
        let count = by_entity.len();
        for (entity_id, mut ids) in by_entity {
            ids.sort();
            self.index_put(&entity_id, &ids).await?;
        }
        Ok(count)
    }

    /// Permanently delete every archived op (spec §6.4 `purge-failed`).
    /// Returns the number removed.
    pub async fn purge_failed(&self) -> Result<usize, QueueError> {
        let _guard = self.inner.lock().await;
        let rows: Vec<(String, Vec<u8>)> = self.map.scan(Space::Failed).await?;
        for (id, _) in &rows {
            self.map.delete(Space::Failed, id).await?;
        }
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_kvstore::InMemoryPersistentMap;
    use opsync_types::{EnqueueOptions, ErrorKind};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    fn op(id: &str, op_type: OpType, entity: &str, now: DateTime<Utc>) -> PendingOp {
        PendingOp::new(
            id.into(),
            op_type,
            "widget".into(),
            Some(entity.into()),
            opsync_types::Payload::new(),
            &EnqueueOptions::default(),
            now,
        )
    }

    async fn fresh_queue() -> Queue<InMemoryPersistentMap> {
        Queue::load(Arc::new(InMemoryPersistentMap::new())).await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        let err = q.enqueue(op("op-1", OpType::Update, "e1", t(1))).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn duplicate_queued_create_is_rejected_with_existing_id() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        let outcome = q.enqueue(op("op-2", OpType::Create, "e1", t(1))).await.unwrap();
        match outcome {
            EnqueueOutcome::RejectedDuplicateCreate { existing_id } => {
                assert_eq!(existing_id, "op-1");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(q.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_merges_into_existing_queued_update() {
        let q = fresh_queue().await;
        let mut first = op("op-1", OpType::Update, "e1", t(0));
        first.payload.insert("a".into(), serde_json::json!(1));
        q.enqueue(first).await.unwrap();

        let mut second = op("op-2", OpType::Update, "e1", t(1));
        second.payload.insert("b".into(), serde_json::json!(2));
        let outcome = q.enqueue(second).await.unwrap();

        match outcome {
            EnqueueOutcome::MergedIntoExisting { existing_id } => assert_eq!(existing_id, "op-1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(q.size().await.unwrap(), 1);
        let merged = q.load_pending("op-1").await.unwrap().unwrap();
        assert_eq!(merged.payload.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(merged.payload.get("b"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn delete_cancels_queued_create_and_both_vanish() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        let outcome = q.enqueue(op("op-2", OpType::Delete, "e1", t(1))).await.unwrap();
        match outcome {
            EnqueueOutcome::Annihilated { removed_create_id, .. } => {
                assert_eq!(removed_create_id, "op-1");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(q.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_queued_update_but_still_enqueues() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Update, "e1", t(0))).await.unwrap();
        let outcome = q.enqueue(op("op-2", OpType::Delete, "e1", t(1))).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Inserted { .. }));
        assert_eq!(q.size().await.unwrap(), 1);
        let remaining = q.load_pending("op-2").await.unwrap().unwrap();
        assert_eq!(remaining.op_type, OpType::Delete);
    }

    #[tokio::test]
    async fn coalescing_is_skipped_against_in_flight_ops() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        q.mark_in_flight("op-1", t(1)).await.unwrap();

        // A second CREATE for the same entity is not coalesced against the
        // frozen in-flight one; it is accepted as an independent op.
        let outcome = q.enqueue(op("op-2", OpType::Create, "e1", t(2))).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Inserted { .. }));
    }

    #[tokio::test]
    async fn peek_skips_busy_entities_and_future_retries() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        q.mark_in_flight("op-1", t(1)).await.unwrap();
        q.enqueue(op("op-2", OpType::Create, "e2", t(2))).await.unwrap();

        let runnable = q.peek_next_runnable(t(3)).await.unwrap().unwrap();
        assert_eq!(runnable.id, "op-2");
    }

    #[tokio::test]
    async fn peek_respects_fifo_by_created_at() {
        let q = fresh_queue().await;
        q.enqueue(op("op-b", OpType::Create, "e2", t(5))).await.unwrap();
        q.enqueue(op("op-a", OpType::Create, "e1", t(1))).await.unwrap();

        let runnable = q.peek_next_runnable(t(10)).await.unwrap().unwrap();
        assert_eq!(runnable.id, "op-a");
    }

    #[tokio::test]
    async fn archive_then_retry_round_trips_with_reset_attempts() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        q.mark_in_flight("op-1", t(1)).await.unwrap();
        let err = LastError {
            kind: ErrorKind::ExhaustedRetries,
            message: "too many attempts".into(),
            http_status: None,
            retry_after: None,
        };
        q.archive_to_failed("op-1", "exhausted retries", err, t(2)).await.unwrap();
        assert_eq!(q.size().await.unwrap(), 0);
        assert_eq!(q.failed_size().await.unwrap(), 1);

        let moved = q.retry_from_failed("op-1", t(3)).await.unwrap();
        assert!(moved);
        assert_eq!(q.size().await.unwrap(), 1);
        assert_eq!(q.failed_size().await.unwrap(), 0);
        let restored = q.load_pending("op-1").await.unwrap().unwrap();
        assert_eq!(restored.attempts, 0);
        assert_eq!(restored.status, OpStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_rejects_non_queued_ops() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        q.mark_in_flight("op-1", t(1)).await.unwrap();
        let err = q.cancel("op-1").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn recover_stale_in_flight_resets_only_in_flight_ops() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        q.mark_in_flight("op-1", t(1)).await.unwrap();
        q.enqueue(op("op-2", OpType::Create, "e2", t(2))).await.unwrap();

        let recovered = q.recover_stale_in_flight(t(3)).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, "op-1");

        let restored = q.load_pending("op-1").await.unwrap().unwrap();
        assert_eq!(restored.status, OpStatus::Queued);
        let runnable = q.peek_next_runnable(t(3)).await.unwrap();
        assert!(runnable.is_some());
    }

    #[tokio::test]
    async fn set_merge_base_persists_and_is_idempotent_to_call_again() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Update, "e1", t(0))).await.unwrap();
        q.mark_in_flight("op-1", t(1)).await.unwrap();

        let mut base = opsync_types::Payload::new();
        base.insert("brightness".into(), serde_json::json!(50));
        let updated = q.set_merge_base("op-1", base.clone(), t(2)).await.unwrap();
        assert_eq!(updated.merge_base, Some(base));

        let reloaded = q.load_pending("op-1").await.unwrap().unwrap();
        assert_eq!(reloaded.merge_base.unwrap().get("brightness"), Some(&serde_json::json!(50)));
    }

    #[tokio::test]
    async fn rebuild_index_reconstructs_from_pending_after_corruption() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        q.enqueue(op("op-2", OpType::Update, "e2", t(1))).await.unwrap();

        // Simulate a corrupted/stale index entry that doesn't match pending.
        q.map.put_json(Space::Index, "e1", &vec!["bogus".to_string()]).await.unwrap();
        q.map.put_json(Space::Index, "ghost", &vec!["nothing-pending".to_string()]).await.unwrap();

        let reindexed = q.rebuild_index().await.unwrap();
        assert_eq!(reindexed, 2);
        assert_eq!(q.lookup_by_entity("e1").await.unwrap(), vec!["op-1".to_string()]);
        assert_eq!(q.lookup_by_entity("e2").await.unwrap(), vec!["op-2".to_string()]);
        assert!(q.lookup_by_entity("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_failed_removes_all_archived_ops() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Create, "e1", t(0))).await.unwrap();
        q.mark_in_flight("op-1", t(1)).await.unwrap();
        let err = LastError {
            kind: ErrorKind::ExhaustedRetries,
            message: "too many attempts".into(),
            http_status: None,
            retry_after: None,
        };
        q.archive_to_failed("op-1", "exhausted retries", err, t(2)).await.unwrap();
        assert_eq!(q.failed_ops().await.unwrap().len(), 1);

        let purged = q.purge_failed().await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(q.failed_size().await.unwrap(), 0);
        assert!(q.failed_ops().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_by_entity_reflects_index() {
        let q = fresh_queue().await;
        q.enqueue(op("op-1", OpType::Update, "e1", t(0))).await.unwrap();
        let ids = q.lookup_by_entity("e1").await.unwrap();
        assert_eq!(ids, vec!["op-1".to_string()]);
    }
}
