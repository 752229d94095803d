//! Cross-invocation single-writer lease (spec §3.4, §4.2). The engine must
//! not process ops unless it holds this lock — it is the mechanism that
//! makes the single-threaded cooperative scheduling model (spec §5) safe
//! across multiple process invocations of the same client.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opsync_kvstore::{PersistentMap, Space, StorageError};
use serde::{Deserialize, Serialize};

/// Well-known key in `meta` (spec §6.3: `meta/processing_lock`).
pub const LOCK_KEY: &str = "processing_lock";

pub const DEFAULT_TTL: ChronoDuration = ChronoDuration::seconds(120);
pub const DEFAULT_HEARTBEAT_INTERVAL: ChronoDuration = ChronoDuration::seconds(40);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLockRecord {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub ttl_secs: i64,
}

pub struct ProcessingLock<M: PersistentMap> {
    map: std::sync::Arc<M>,
}

impl<M: PersistentMap> ProcessingLock<M> {
    pub fn new(map: std::sync::Arc<M>) -> Self {
        Self { map }
    }

    pub async fn current(&self) -> Result<Option<ProcessingLockRecord>, StorageError> {
        let bytes = self.map.get(Space::Meta, LOCK_KEY).await?;
        match bytes {
            None => Ok(None),
            Some(b) => serde_json::from_slice(&b)
                .map(Some)
                .map_err(|e| StorageError::new(format!("decode lock record: {e}"))),
        }
    }

    /// Acquire the lease if absent, or take it over if the current holder's
    /// heartbeat is stale (`now - last_heartbeat_at > ttl`). The write is a
    /// compare-and-set against the record's prior encoded value so that two
    /// concurrent invocations racing to acquire never both succeed.
    pub async fn try_acquire(
        &self,
        holder_id: &str,
        ttl: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let current_bytes = self.map.get(Space::Meta, LOCK_KEY).await?;

        if let Some(bytes) = &current_bytes {
            let current: ProcessingLockRecord = serde_json::from_slice(bytes)
                .map_err(|e| StorageError::new(format!("decode lock record: {e}")))?;
            let stale = now - current.last_heartbeat_at > ttl;
            if !stale {
                return Ok(false);
            }
            tracing::warn!(
                prior_holder = %current.holder_id,
                "processing lock stale, taking over"
            );
        }

        let new_record = ProcessingLockRecord {
            holder_id: holder_id.to_string(),
            acquired_at: now,
            last_heartbeat_at: now,
            ttl_secs: ttl.num_seconds(),
        };
        let new_bytes = serde_json::to_vec(&new_record)
            .map_err(|e| StorageError::new(format!("encode lock record: {e}")))?;

        self.map
            .put_cas(Space::Meta, LOCK_KEY, current_bytes, new_bytes)
            .await
    }

    /// Refresh `last_heartbeat_at` for `holder_id`. Returns `false` if the
    /// record no longer names this holder, or another process mutated it
    /// concurrently (CAS mismatch) — either case means the engine must stop
    /// processing immediately (spec §4.2.4).
    pub async fn heartbeat(
        &self,
        holder_id: &str,
        ttl: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let current_bytes = match self.map.get(Space::Meta, LOCK_KEY).await? {
            Some(b) => b,
            None => return Ok(false),
        };
        let current: ProcessingLockRecord = serde_json::from_slice(&current_bytes)
            .map_err(|e| StorageError::new(format!("decode lock record: {e}")))?;
        if current.holder_id != holder_id {
            return Ok(false);
        }

        let updated = ProcessingLockRecord {
            last_heartbeat_at: now,
            ttl_secs: ttl.num_seconds(),
            ..current
        };
        let updated_bytes = serde_json::to_vec(&updated)
            .map_err(|e| StorageError::new(format!("encode lock record: {e}")))?;

        self.map
            .put_cas(Space::Meta, LOCK_KEY, Some(current_bytes), updated_bytes)
            .await
    }

    /// Delete the record iff `holder_id` still matches. A holder that has
    /// already lost the lock (e.g. via stale takeover) must not accidentally
    /// delete the new holder's record.
    pub async fn release(&self, holder_id: &str) -> Result<(), StorageError> {
        let current_bytes = match self.map.get(Space::Meta, LOCK_KEY).await? {
            Some(b) => b,
            None => return Ok(()),
        };
        let current: ProcessingLockRecord = serde_json::from_slice(&current_bytes)
            .map_err(|e| StorageError::new(format!("decode lock record: {e}")))?;
        if current.holder_id != holder_id {
            return Ok(());
        }
        self.map
            .delete_cas(Space::Meta, LOCK_KEY, current_bytes)
            .await?;
        Ok(())
    }
}
