//! # Registry
//!
//! Module dedicated to the registry of live search folders, indexed
//! by store then by folder. The registry is the only place where
//! search folders are added or removed.
//!
//! The map is guarded by a single async mutex. Waiting for a rebuild
//! worker to exit must always happen after the lock is released,
//! since the event dispatcher holds the same lock while it processes
//! the changes of a store.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::{folder::SearchFolder, stats::Stats, FolderId, StoreId};

/// The live search folders of one store.
pub type StoreFolders = HashMap<FolderId, Arc<SearchFolder>>;

/// The live search folders of all stores.
pub type RegistryMap = HashMap<StoreId, StoreFolders>;

/// The registry of live search folders.
#[derive(Debug, Default)]
pub struct Registry {
    folders: Mutex<RegistryMap>,
    stats: Arc<Stats>,
}

impl Registry {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            folders: Default::default(),
            stats,
        }
    }

    /// Lock the whole registry.
    pub async fn lock(&self) -> MutexGuard<'_, RegistryMap> {
        self.folders.lock().await
    }

    /// Register the given search folder.
    ///
    /// Returns the search folder previously registered under the
    /// same store and folder ids, if any.
    pub async fn insert(&self, folder: Arc<SearchFolder>) -> Option<Arc<SearchFolder>> {
        let mut folders = self.lock().await;
        let (store, id) = (folder.store, folder.folder);

        let prev = folders.entry(store).or_default().insert(id, folder);
        if prev.is_none() {
            self.stats.add_folders(1);
        }

        trace!(store, folder = id, "search folder registered");
        prev
    }

    /// Unregister the given search folder.
    ///
    /// The store entry is dropped with its last search folder.
    pub async fn remove(&self, store: StoreId, folder: FolderId) -> Option<Arc<SearchFolder>> {
        let mut folders = self.lock().await;

        let store_folders = folders.get_mut(&store)?;
        let removed = store_folders.remove(&folder);
        if store_folders.is_empty() {
            folders.remove(&store);
        }

        if removed.is_some() {
            self.stats.add_folders(-1);
            trace!(store, folder, "search folder unregistered");
        }

        removed
    }

    /// Unregister all search folders of the given store.
    ///
    /// Returns `None` if the store has no search folder.
    pub async fn remove_store(&self, store: StoreId) -> Option<Vec<Arc<SearchFolder>>> {
        let removed: Vec<_> = self
            .lock()
            .await
            .remove(&store)?
            .into_values()
            .collect();

        self.stats.add_folders(-(removed.len() as i64));
        Some(removed)
    }

    /// Unregister all search folders.
    pub async fn drain(&self) -> Vec<Arc<SearchFolder>> {
        let removed: Vec<_> = self
            .lock()
            .await
            .drain()
            .flat_map(|(_, folders)| folders.into_values())
            .collect();

        self.stats.add_folders(-(removed.len() as i64));
        removed
    }

    pub async fn get(&self, store: StoreId, folder: FolderId) -> Option<Arc<SearchFolder>> {
        self.lock()
            .await
            .get(&store)
            .and_then(|folders| folders.get(&folder))
            .cloned()
    }

    /// List all registered search folders.
    pub async fn all(&self) -> Vec<Arc<SearchFolder>> {
        self.lock()
            .await
            .values()
            .flat_map(|folders| folders.values().cloned())
            .collect()
    }

    /// Count the stores having at least one search folder and the
    /// registered search folders.
    pub async fn counts(&self) -> (usize, usize) {
        let folders = self.lock().await;
        let count = folders.values().map(HashMap::len).sum();
        (folders.len(), count)
    }
}
