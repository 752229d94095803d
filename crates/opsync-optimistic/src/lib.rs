//! The optimistic UI rollback/commit registry (spec §3.3, §4.7). Entries
//! live only in memory — on restart, any op still `inFlight` loses its hooks
//! and is simply reprocessed without a UI notification (spec §3.3).

use std::collections::HashMap;
use std::sync::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

struct Entry {
    commit: Hook,
    rollback: Hook,
}

/// In-memory map guarded by a mutex (spec §9). `commit`/`rollback` each run
/// their hook exactly once then remove the entry; an unknown `txnToken` is a
/// no-op, so a caller racing `cancel` against `Engine`'s own terminal
/// notification can never double-fire a hook.
pub struct OptimisticStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for OptimisticStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, txn_token: impl Into<String>, rollback: Hook, commit: Hook) {
        self.entries
            .lock()
            .unwrap()
            .insert(txn_token.into(), Entry { commit, rollback });
    }

    pub fn commit(&self, txn_token: &str) {
        if let Some(entry) = self.entries.lock().unwrap().remove(txn_token) {
            (entry.commit)();
        } else {
            tracing::debug!(txn_token, "commit on unknown transaction token, ignoring");
        }
    }

    pub fn rollback(&self, txn_token: &str) {
        if let Some(entry) = self.entries.lock().unwrap().remove(txn_token) {
            (entry.rollback)();
        } else {
            tracing::debug!(txn_token, "rollback on unknown transaction token, ignoring");
        }
    }

    pub fn is_registered(&self, txn_token: &str) -> bool {
        self.entries.lock().unwrap().contains_key(txn_token)
    }
}
