//! # Search folders
//!
//! Module dedicated to the [`SearchFolders`] engine, the entry point
//! of the library. It owns the registry of live search folders, the
//! event dispatcher and the pool of rebuild workers.
//!
//! Lifecycle operations (define, cancel, remove) are serialized, so
//! that two concurrent definitions of the same search folder can
//! never leave two rebuild workers running for it, nor persist
//! criteria other than the live ones.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::{
    context::SearchContext,
    criteria::SearchCriteria,
    event::{self, ChangeEvent, ChangeKind, EventQueue},
    folder::{SearchFolder, SearchState},
    notify::Notification,
    rebuild::{run_worker, search},
    registry::Registry,
    retry::retry_transaction,
    stats::SearchFoldersReport,
    store::{
        results::{reset_results, set_status},
        FolderStatus,
    },
    thread_pool::{ThreadPool, ThreadPoolBuilder},
    Error, FolderId, ObjectId, Result, StoreId,
};

/// The search folders engine.
pub struct SearchFolders {
    ctx: Arc<SearchContext>,
    registry: Arc<Registry>,
    queue: Arc<EventQueue>,

    /// Serializes define, cancel and remove operations.
    lifecycle: Mutex<()>,

    pool: StdMutex<Option<ThreadPool<SearchContext>>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl SearchFolders {
    /// Create a new engine from the given context.
    ///
    /// The event dispatcher and the rebuild workers are spawned on
    /// the current tokio runtime. Nothing is loaded from the database
    /// until [`SearchFolders::load`] is called.
    pub fn new(ctx: SearchContext) -> Self {
        let ctx = Arc::new(ctx);
        let registry = Arc::new(Registry::new(ctx.stats.clone()));
        let queue = Arc::new(EventQueue::default());

        let pool = ThreadPoolBuilder::new(ctx.clone())
            .with_size(ctx.config.threads())
            .build();
        let dispatcher = event::dispatcher::spawn(ctx.clone(), registry.clone(), queue.clone());

        debug!(workers = pool.size(), "search folders engine started");

        Self {
            ctx,
            registry,
            queue,
            lifecycle: Mutex::new(()),
            pool: StdMutex::new(Some(pool)),
            dispatcher: StdMutex::new(Some(dispatcher)),
        }
    }

    pub fn context(&self) -> &SearchContext {
        &self.ctx
    }

    /// Register every persisted search folder that is not stopped.
    ///
    /// Search folders left rebuilding are rebuilt from scratch, the
    /// results of the others are trusted. A search folder that
    /// cannot be loaded is skipped.
    pub async fn load(&self) -> Result<()> {
        info!("loading search folders");

        let persisted = self.ctx.db.list_search_folders().await?;
        let mut loaded = 0;

        for sf in persisted {
            let status = sf.status.unwrap_or_default();
            if status == FolderStatus::Stopped {
                continue;
            }

            let Some(data) = sf.criteria else {
                debug!(folder = sf.folder, "search folder without criteria, skipping it");
                continue;
            };

            let criteria = match SearchCriteria::decode(&data) {
                Ok(criteria) => criteria,
                Err(err) => {
                    warn!(folder = sf.folder, ?err, "invalid search criteria, skipping folder");
                    continue;
                }
            };

            let store = match self.ctx.db.get_store(sf.folder).await {
                Ok(store) => store,
                Err(err) => {
                    warn!(folder = sf.folder, ?err, "cannot find store, skipping folder");
                    continue;
                }
            };

            let restart = status == FolderStatus::Rebuilding;
            if restart {
                info!(store, folder = sf.folder, "search folder was rebuilding, restarting it");
            }

            let _lifecycle = self.lifecycle.lock().await;
            match self.add(store, sf.folder, restart, criteria, None).await {
                Ok(()) => loaded += 1,
                Err(err) => {
                    warn!(store, folder = sf.folder, ?err, "cannot load search folder, skipping it");
                }
            }
        }

        info!(folders = loaded, "search folders loaded");
        Ok(())
    }

    /// Define, replace or cancel the search of a folder.
    ///
    /// `None` criteria cancel the search folder, which always
    /// succeeds. Otherwise the criteria are persisted, then the search
    /// folder is (re)registered, both under the lifecycle lock. When
    /// `restart` is set, results are reset and rebuilt in the
    /// background.
    pub async fn define(
        &self,
        store: StoreId,
        folder: FolderId,
        criteria: Option<SearchCriteria>,
        restart: bool,
    ) -> Result<()> {
        let Some(criteria) = criteria else {
            if let Err(err) = self.cancel(store, folder).await {
                debug!(store, folder, ?err, "nothing to cancel");
            }
            return Ok(());
        };

        let encoded = criteria.encode()?;

        let _lifecycle = self.lifecycle.lock().await;
        self.add(store, folder, restart, criteria, Some(&encoded))
            .await
    }

    /// Register a search folder, replacing any previous one.
    ///
    /// `None` criteria are loaded from the database, which fails if
    /// the folder has no persisted criteria.
    pub async fn add_search_folder(
        &self,
        store: StoreId,
        folder: FolderId,
        restart: bool,
        criteria: Option<SearchCriteria>,
    ) -> Result<()> {
        let criteria = match criteria {
            Some(criteria) => criteria,
            None => {
                let data = self
                    .ctx
                    .db
                    .load_criteria(folder)
                    .await?
                    .ok_or(Error::CriteriaNotFoundError(folder))?;
                SearchCriteria::decode(&data)?
            }
        };

        let _lifecycle = self.lifecycle.lock().await;
        self.add(store, folder, restart, criteria, None).await
    }

    /// Register a search folder, the lifecycle lock being held.
    ///
    /// The given encoded criteria are persisted before the search
    /// folder becomes live.
    async fn add(
        &self,
        store: StoreId,
        folder: FolderId,
        restart: bool,
        criteria: SearchCriteria,
        encoded: Option<&str>,
    ) -> Result<()> {
        if self.queue.is_shut_down() {
            return Err(Error::ShutDownError(folder));
        }

        if let Err(err) = self.cancel_locked(store, folder).await {
            trace!(store, folder, ?err, "no previous search folder");
        }

        if let Some(encoded) = encoded {
            self.save_criteria(folder, encoded).await?;
        }

        if restart {
            set_status(&self.ctx, folder, FolderStatus::Rebuilding).await?;
            reset_results(&self.ctx, folder).await?;
        } else {
            set_status(&self.ctx, folder, FolderStatus::Running).await?;
        }

        let mut notifications = vec![
            Notification::CacheInvalidated(folder),
            Notification::TableChanged(folder),
        ];
        if let Ok(Some(parent)) = self.ctx.db.get_parent(folder).await {
            notifications.push(Notification::HierarchyRowModified(parent, folder));
        }
        self.ctx.notifier.notify_all(notifications);

        debug!(store, folder, %criteria, restart, "registering search folder");
        let search_folder = Arc::new(SearchFolder::new(store, folder, criteria));
        let done = restart.then(|| search_folder.start_rebuild());

        if let Some(prev) = self.registry.insert(search_folder.clone()).await {
            self.destroy(prev).await;
        }

        if let Some(done) = done {
            self.spawn_rebuild(search_folder, done)?;
        }

        Ok(())
    }

    async fn save_criteria(&self, folder: FolderId, encoded: &str) -> Result<()> {
        let ctx = self.ctx.as_ref();
        retry_transaction(ctx.retry_policy(), &ctx.stats, || async move {
            let mut tx = ctx.db.begin().await?;
            tx.lock_folder(folder).await?;
            tx.save_criteria(folder, encoded).await?;
            tx.commit().await
        })
        .await?;

        debug!(folder, "search criteria saved");
        Ok(())
    }

    fn spawn_rebuild(
        &self,
        folder: Arc<SearchFolder>,
        done: tokio::sync::oneshot::Sender<()>,
    ) -> Result<()> {
        let pool = self.pool.lock().unwrap_or_else(|err| err.into_inner());
        let id = folder.folder;

        match pool.as_ref() {
            Some(pool) => {
                pool.send(move |ctx| run_worker(ctx, folder, done))?;
                Ok(())
            }
            // dropping `done` releases anyone waiting for the worker
            None => Err(Error::ShutDownError(id)),
        }
    }

    /// Stop a search folder.
    ///
    /// Waits for its rebuild worker to exit, then marks it stopped.
    /// Its results are kept.
    pub async fn cancel(&self, store: StoreId, folder: FolderId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.cancel_locked(store, folder).await
    }

    async fn cancel_locked(&self, store: StoreId, folder: FolderId) -> Result<()> {
        let search_folder = self
            .registry
            .remove(store, folder)
            .await
            .ok_or(Error::SearchFolderNotFoundError(store, folder))?;

        self.destroy(search_folder).await;
        Ok(())
    }

    /// Stop the rebuild worker of a search folder that already left
    /// the registry, then mark it stopped.
    async fn destroy(&self, folder: Arc<SearchFolder>) {
        folder.stop_rebuild().await;

        if let Err(err) = set_status(&self.ctx, folder.folder, FolderStatus::Stopped).await
        {
            warn!(folder = folder.folder, ?err, "cannot mark search folder as stopped");
        }

        debug!(store = folder.store, folder = folder.folder, "search folder stopped");
    }

    /// Stop a search folder and remove all its results.
    pub async fn remove(&self, store: StoreId, folder: FolderId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Err(err) = self.cancel_locked(store, folder).await {
            debug!(store, folder, ?err, "search folder was not running");
        }

        if let Err(err) = reset_results(&self.ctx, folder).await {
            warn!(folder, ?err, "cannot reset search results");
        }

        Ok(())
    }

    /// Stop all search folders of a store and remove their results.
    pub async fn remove_store(&self, store: StoreId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let folders = self
            .registry
            .remove_store(store)
            .await
            .ok_or(Error::StoreNotFoundError(store))?;

        info!(store, folders = folders.len(), "removing search folders of store");

        for folder in folders {
            let id = folder.folder;
            self.destroy(folder).await;

            if let Err(err) = reset_results(&self.ctx, id).await {
                warn!(folder = id, ?err, "cannot reset search results");
            }
        }

        Ok(())
    }

    /// Get the state of a search folder.
    pub async fn get_state(&self, store: StoreId, folder: FolderId) -> SearchState {
        match self.registry.get(store, folder).await {
            Some(folder) => folder.state(),
            None => SearchState::ABSENT,
        }
    }

    /// Get a copy of the live criteria of a search folder, with its
    /// state.
    ///
    /// The state includes [`SearchState::RECURSIVE`] when the search
    /// is recursive.
    pub async fn get_criteria(
        &self,
        store: StoreId,
        folder: FolderId,
    ) -> Result<(SearchCriteria, SearchState)> {
        let search_folder = self
            .registry
            .get(store, folder)
            .await
            .ok_or(Error::SearchFolderNotFoundError(store, folder))?;

        let mut state = search_folder.state();
        if search_folder.criteria.is_recursive() {
            state = state.with(SearchState::RECURSIVE);
        }

        Ok((search_folder.criteria.as_ref().clone(), state))
    }

    /// Queue the change of one object.
    pub fn notify_change(&self, store: StoreId, folder: FolderId, object: ObjectId, kind: ChangeKind) {
        self.queue
            .push(ChangeEvent::new(store, folder, object, kind))
    }

    /// Queue the changes of several objects of the same folder.
    pub fn notify_changes(
        &self,
        store: StoreId,
        folder: FolderId,
        objects: impl IntoIterator<Item = ObjectId>,
        kind: ChangeKind,
    ) {
        self.queue.extend(
            objects
                .into_iter()
                .map(|object| ChangeEvent::new(store, folder, object, kind)),
        )
    }

    /// Queue arbitrary change events.
    pub fn push_events(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        self.queue.extend(events)
    }

    /// Wait until every change queued so far has been processed.
    pub async fn flush(&self) {
        self.queue.flush().await
    }

    /// List the current results of a search folder.
    pub async fn search_results(&self, folder: FolderId) -> Result<Vec<ObjectId>> {
        Ok(self.ctx.db.list_search_results(folder).await?)
    }

    /// Take a snapshot of the engine.
    pub async fn stats(&self) -> SearchFoldersReport {
        let (stores, folders) = self.registry.counts().await;

        SearchFoldersReport {
            stores,
            folders,
            events: self.queue.len(),
            workers: self.ctx.stats.workers(),
            update_retries: self.ctx.stats.update_retries(),
            update_failures: self.ctx.stats.update_failures(),
        }
    }

    /// Rebuild every registered search folder, one after the other,
    /// without notifications.
    ///
    /// Meant to be called at startup, right after
    /// [`SearchFolders::load`], before clients connect.
    pub async fn restart_searches(&self) -> Result<()> {
        let mut folders = self.registry.all().await;
        folders.sort_by_key(|folder| (folder.store, folder.folder));

        info!(folders = folders.len(), "rebuilding all search folders");

        for folder in folders {
            let res = search(
                &self.ctx,
                folder.store,
                folder.folder,
                &folder.criteria,
                None,
                false,
            )
            .await;

            if let Err(err) = res {
                warn!(store = folder.store, folder = folder.folder, ?err, "cannot rebuild search folder");
            }
        }

        info!("all search folders rebuilt");
        Ok(())
    }

    /// Stop the engine.
    ///
    /// Every search folder leaves the registry and its rebuild worker
    /// is stopped. Interrupted rebuilds stay marked as rebuilding, so
    /// that they restart at the next load. Pending events are
    /// processed before the dispatcher exits.
    pub async fn shutdown(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        info!("shutting down search folders engine");

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();

        self.queue.shutdown();
        if let Some(dispatcher) = dispatcher {
            dispatcher.await.map_err(crate::thread_pool::Error::from)?;
        }

        for folder in self.registry.drain().await {
            if folder.is_rebuilding() {
                folder.stop_rebuild().await;
                if let Err(err) =
                    set_status(&self.ctx, folder.folder, FolderStatus::Rebuilding).await
                {
                    warn!(folder = folder.folder, ?err, "cannot mark search folder as rebuilding");
                }
            }
        }

        let pool = self
            .pool
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();

        if let Some(pool) = pool {
            pool.close().await?;
        }

        info!("search folders engine shut down");
        Ok(())
    }
}
