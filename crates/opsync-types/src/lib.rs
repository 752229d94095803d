//! Core data types shared by every component of the operation sync engine:
//! the durable queue element (`PendingOp`), its status state machine, and
//! the error-kind taxonomy used in place of exceptions across component
//! boundaries (see spec §7, §9).
//!
//! This crate performs no I/O and owns no clock; every timestamp is supplied
//! by the caller so that tests can drive the state machine deterministically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// JSON-shaped operation payload. `BTreeMap` keeps key order stable for
/// canonical logging and for the coalescer's "latest wins per key" merge.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Kind of mutation an op represents. Extensible per spec §3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

/// Status transitions form the DAG in spec §3.1 invariant 2:
/// `queued -> inFlight -> (succeeded | reconciling | queued | failed)`,
/// `reconciling -> (queued | failed)`. `succeeded` is purged immediately on
/// reaching it, so it is never observed at rest in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Queued,
    InFlight,
    Succeeded,
    Failed,
    Reconciling,
}

impl OpStatus {
    /// Whether `self -> next` is a legal edge in the status DAG.
    pub fn can_transition_to(self, next: OpStatus) -> bool {
        use OpStatus::*;
        matches!(
            (self, next),
            (Queued, InFlight)
                | (InFlight, Succeeded)
                | (InFlight, Reconciling)
                | (InFlight, Queued)
                | (InFlight, Failed)
                | (Reconciling, Queued)
                | (Reconciling, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OpStatus::Succeeded | OpStatus::Failed)
    }
}

/// Conflict resolution policy for `UPDATE` three-way merges (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    LastWriteWins,
    ServerWins,
    Abort,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::LastWriteWins
    }
}

/// Error taxonomy (kinds, not language exception types) per spec §7 / §9.
/// The `ApiClient` and `Reconciler` return these instead of throwing; the
/// `Engine` switches on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Retryable,
    Server,
    Conflict,
    Auth,
    Validation,
    PermissionDenied,
    NotFound,
    Routing,
    ConflictUnresolved,
    ExhaustedRetries,
    Storage,
}

impl ErrorKind {
    /// Transient (spec §7): engine retries with backoff, never surfaces to the app.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Retryable | ErrorKind::Server)
    }

    /// Terminal (spec §7): archived to `failed`, rollback hook fires.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::PermissionDenied
                | ErrorKind::NotFound
                | ErrorKind::Routing
                | ErrorKind::ConflictUnresolved
                | ErrorKind::ExhaustedRetries
        )
    }

    /// Fatal (spec §7): engine halts, operator intervention required.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Storage)
    }

    /// Only network errors, 5xx, and timeouts count toward the circuit breaker
    /// (spec §4.4). 4xx other than 408/429 are user/logic errors.
    pub fn counts_toward_breaker(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Server)
    }
}

/// Structured error summary retained on a `PendingOp` (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub retry_after: Option<DateTime<Utc>>,
}

/// The durable queue element (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOp {
    pub id: String,
    pub op_type: OpType,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: Payload,
    /// Stable across retries; defaults to `id`; immutable once assigned
    /// (spec §3.1 invariant 5).
    pub idempotency_key: String,
    pub txn_token: Option<String>,
    pub status: OpStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_not_before: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    pub conflict_policy: ConflictPolicy,
    pub max_attempts: u32,
    pub route_override: Option<String>,
    /// Server-last-known snapshot, captured the first time the op goes
    /// in-flight. Used as the merge base for the Reconciler's three-way
    /// `UPDATE` merge (spec §4.6). `None` until the first attempt.
    pub merge_base: Option<Payload>,
}

impl PendingOp {
    /// Construct a fresh `queued` op. `now` must come from the caller's
    /// injected clock (spec §9: clock injection is mandatory).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        op_type: OpType,
        entity_type: String,
        entity_id: Option<String>,
        payload: Payload,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let idempotency_key = options
            .idempotency_key
            .clone()
            .unwrap_or_else(|| id.clone());

        Self {
            id,
            op_type,
            entity_type,
            entity_id,
            payload,
            idempotency_key,
            txn_token: options.txn_token.clone(),
            status: OpStatus::Queued,
            attempts: 0,
            created_at: now,
            updated_at: now,
            next_attempt_not_before: None,
            last_error: None,
            conflict_policy: options.conflict_policy,
            max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            route_override: options.route_override.clone(),
            merge_base: None,
        }
    }
}

/// Default `maxAttempts` before an op is routed to `failed` with
/// `ExhaustedRetries` (spec §4.3).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Options accepted by `Engine::enqueue` (spec §6.1).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    pub txn_token: Option<String>,
    pub conflict_policy: ConflictPolicy,
    pub max_attempts: Option<u32>,
    pub route_override: Option<String>,
}
