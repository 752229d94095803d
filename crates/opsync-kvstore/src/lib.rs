//! `PersistentMap`: typed, atomic local storage with scan/watch, over the
//! five logical spaces from spec §6.3 (`pending`, `failed`, `index`, `meta`,
//! `optimistic`). The engine's domain-specific mirrors (health readings,
//! chat, onboarding, …) and the local encrypted key-value store's on-disk
//! format are out of scope (spec §1) — this crate treats storage as a
//! generic, atomic byte-level map and layers typed JSON helpers on top.
//!
//! Two implementations are provided: an in-memory map for tests, and a
//! `sled`-backed map for the real, offline-capable, crash-safe client store.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

pub mod sled_store;

pub use sled_store::SledPersistentMap;

/// The five logical spaces a `PersistentMap` partitions its keys into.
///
/// `Optimistic` is reserved: spec §3.3 states optimistic entries are never
/// persisted across a restart, so the engine never writes to this space
/// today. It is kept here because spec §2 names it as one of the five named
/// spaces the store must support, should a future optimistic-entry recovery
/// mode be added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Pending,
    Failed,
    Index,
    Meta,
    Optimistic,
}

impl Space {
    pub fn name(self) -> &'static str {
        match self {
            Space::Pending => "pending",
            Space::Failed => "failed",
            Space::Index => "index",
            Space::Meta => "meta",
            Space::Optimistic => "optimistic",
        }
    }
}

/// Storage failure. Surfaces to callers as `ErrorKind::Storage` (spec §7):
/// fatal, halts the engine, requires operator intervention.
#[derive(Debug, Clone)]
pub struct StorageError {
    pub message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "storage error: {}", self.message)
    }
}

impl std::error::Error for StorageError {}

/// A change observed on a `PersistentMap` space, delivered to `watch` subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub space: Space,
    pub key: String,
}

/// Typed, atomic local storage with scan/watch (spec §2 row 1).
///
/// Implementations must make every method atomic with respect to concurrent
/// callers of the same method; `Queue` relies on `put_cas` to implement
/// batch coalescing atomically with persistence (spec §4.1), and
/// `ProcessingLock` relies on it for lease acquisition/heartbeat (spec §4.2).
#[async_trait]
pub trait PersistentMap: Send + Sync {
    async fn put(&self, space: Space, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Compare-and-set: write `value` iff the current value equals `expected`
    /// (`None` means "key must be absent"). Returns `true` if the write took
    /// effect, `false` on contention.
    async fn put_cas(
        &self,
        space: Space,
        key: &str,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<bool, StorageError>;

    async fn get(&self, space: Space, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn delete(&self, space: Space, key: &str) -> Result<(), StorageError>;

    /// Compare-and-delete: remove the key iff its current value equals
    /// `expected`. Used by `ProcessingLock::release` (spec §4.2.3).
    async fn delete_cas(
        &self,
        space: Space,
        key: &str,
        expected: Vec<u8>,
    ) -> Result<bool, StorageError>;

    /// Snapshot every `(key, value)` pair currently in `space`.
    async fn scan(&self, space: Space) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Subscribe to changes on `space`. Best-effort: a slow subscriber may
    /// miss events (see `broadcast::Receiver::recv`'s `Lagged` variant); the
    /// engine treats this purely as a wakeup hint and always re-scans rather
    /// than trusting the event payload, so lagging is harmless.
    fn watch(&self, space: Space) -> broadcast::Receiver<ChangeEvent>;
}

/// Typed convenience layer over a `PersistentMap`, for callers that store
/// one `serde`-shaped value per key (every consumer in this workspace).
#[async_trait]
pub trait TypedMap: PersistentMap {
    async fn put_json<T: Serialize + Sync>(
        &self,
        space: Space,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::new(format!("encode: {e}")))?;
        self.put(space, key, bytes).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        space: Space,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.get(space, key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::new(format!("decode: {e}"))),
        }
    }

    async fn scan_json<T: DeserializeOwned>(
        &self,
        space: Space,
    ) -> Result<Vec<(String, T)>, StorageError> {
        let rows = self.scan(space).await?;
        rows.into_iter()
            .map(|(k, v)| {
                serde_json::from_slice::<T>(&v)
                    .map(|val| (k, val))
                    .map_err(|e| StorageError::new(format!("decode {k}: {e}")))
            })
            .collect()
    }
}

impl<T: PersistentMap + ?Sized> TypedMap for T {}

/// In-memory reference implementation, used by tests across every crate in
/// this workspace.
pub struct InMemoryPersistentMap {
    data: RwLock<HashMap<(&'static str, String), Vec<u8>>>,
    watchers: RwLock<HashMap<&'static str, broadcast::Sender<ChangeEvent>>>,
}

impl Default for InMemoryPersistentMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPersistentMap {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
        }
    }

    fn notify(&self, space: Space, key: &str) {
        let watchers = self.watchers.read().unwrap();
        if let Some(tx) = watchers.get(space.name()) {
            let _ = tx.send(ChangeEvent {
                space,
                key: key.to_string(),
            });
        }
    }
}

#[async_trait]
impl PersistentMap for InMemoryPersistentMap {
    async fn put(&self, space: Space, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.data
            .write()
            .unwrap()
            .insert((space.name(), key.to_string()), value);
        self.notify(space, key);
        Ok(())
    }

    async fn put_cas(
        &self,
        space: Space,
        key: &str,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let mut data = self.data.write().unwrap();
        let current = data.get(&(space.name(), key.to_string()));
        if current.map(|v| v.as_slice()) != expected.as_deref() {
            return Ok(false);
        }
        data.insert((space.name(), key.to_string()), value);
        drop(data);
        self.notify(space, key);
        Ok(true)
    }

    async fn get(&self, space: Space, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .data
            .read()
            .unwrap()
            .get(&(space.name(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, space: Space, key: &str) -> Result<(), StorageError> {
        self.data
            .write()
            .unwrap()
            .remove(&(space.name(), key.to_string()));
        self.notify(space, key);
        Ok(())
    }

    async fn delete_cas(
        &self,
        space: Space,
        key: &str,
        expected: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let mut data = self.data.write().unwrap();
        let current = data.get(&(space.name(), key.to_string()));
        if current.map(|v| v.as_slice()) != Some(expected.as_slice()) {
            return Ok(false);
        }
        data.remove(&(space.name(), key.to_string()));
        drop(data);
        self.notify(space, key);
        Ok(true)
    }

    async fn scan(&self, space: Space) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .data
            .read()
            .unwrap()
            .iter()
            .filter(|((s, _), _)| *s == space.name())
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, space: Space) -> broadcast::Receiver<ChangeEvent> {
        let mut watchers = self.watchers.write().unwrap();
        watchers
            .entry(space.name())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }
}
