//! `sled`-backed `PersistentMap`. `sled` is a synchronous, crash-safe
//! embedded store, so every call runs on `tokio::task::spawn_blocking` to
//! keep the engine's processing loop non-blocking.

use async_trait::async_trait;
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::{ChangeEvent, PersistentMap, Space, StorageError};

pub struct SledPersistentMap {
    db: sled::Db,
    watchers: RwLock<std::collections::HashMap<&'static str, broadcast::Sender<ChangeEvent>>>,
}

impl SledPersistentMap {
    /// Open (or create) a sled database at `path`. Intended for the real
    /// on-device client store; tests should prefer `InMemoryPersistentMap`.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::new(format!("sled open: {e}")))?;
        Ok(Self {
            db,
            watchers: RwLock::new(std::collections::HashMap::new()),
        })
    }

    fn tree(&self, space: Space) -> Result<sled::Tree, StorageError> {
        self.db
            .open_tree(space.name())
            .map_err(|e| StorageError::new(format!("sled open_tree({}): {e}", space.name())))
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
impl PersistentMap for SledPersistentMap {
    async fn put(&self, space: Space, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let tree = self.tree(space)?;
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || tree.insert(key_owned.as_bytes(), value))
            .await
            .map_err(|e| StorageError::new(format!("join: {e}")))?
            .map_err(|e| StorageError::new(format!("sled insert: {e}")))?;
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
        let tree = self.tree(space)?;
        let key_owned = key.to_string();
        let result = tokio::task::spawn_blocking(move || {
            tree.compare_and_swap(
                key_owned.as_bytes(),
                expected.as_deref(),
                Some(value.as_slice()),
            )
        })
        .await
        .map_err(|e| StorageError::new(format!("join: {e}")))?
        .map_err(|e| StorageError::new(format!("sled cas: {e}")))?;

        let ok = result.is_ok();
        if ok {
            self.notify(space, key);
        }
        Ok(ok)
    }

    async fn get(&self, space: Space, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let tree = self.tree(space)?;
        let key_owned = key.to_string();
        let value = tokio::task::spawn_blocking(move || tree.get(key_owned.as_bytes()))
            .await
            .map_err(|e| StorageError::new(format!("join: {e}")))?
            .map_err(|e| StorageError::new(format!("sled get: {e}")))?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn delete(&self, space: Space, key: &str) -> Result<(), StorageError> {
        let tree = self.tree(space)?;
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || tree.remove(key_owned.as_bytes()))
            .await
            .map_err(|e| StorageError::new(format!("join: {e}")))?
            .map_err(|e| StorageError::new(format!("sled remove: {e}")))?;
        self.notify(space, key);
        Ok(())
    }

    async fn delete_cas(
        &self,
        space: Space,
        key: &str,
        expected: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let tree = self.tree(space)?;
        let key_owned = key.to_string();
        let result = tokio::task::spawn_blocking(move || {
            tree.compare_and_swap(key_owned.as_bytes(), Some(expected.as_slice()), None::<&[u8]>)
        })
        .await
        .map_err(|e| StorageError::new(format!("join: {e}")))?
        .map_err(|e| StorageError::new(format!("sled cas: {e}")))?;

        let ok = result.is_ok();
        if ok {
            self.notify(space, key);
        }
        Ok(ok)
    }

    async fn scan(&self, space: Space) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let tree = self.tree(space)?;
        tokio::task::spawn_blocking(move || {
            tree.iter()
                .map(|entry| {
                    entry
                        .map(|(k, v)| (String::from_utf8_lossy(&k).into_owned(), v.to_vec()))
                        .map_err(|e| StorageError::new(format!("sled iter: {e}")))
                })
                .collect()
        })
        .await
        .map_err(|e| StorageError::new(format!("join: {e}")))?
    }

    fn watch(&self, space: Space) -> broadcast::Receiver<ChangeEvent> {
        let mut watchers = self.watchers.write().unwrap();
        watchers
            .entry(space.name())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }
}
