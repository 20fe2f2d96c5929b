//! # Memory database
//!
//! Module dedicated to the in-process [`Database`] implementation.
//! It keeps a complete folder hierarchy, the search results table and
//! the folder properties in memory. Folder row locks are real async
//! locks with a lock-wait timeout, and lock conflicts can be injected
//! to exercise the retry paths.
//!
//! Writes of a [`MemoryTransaction`] are applied immediately and
//! recorded in an undo log, which is replayed backwards on rollback.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
    time::timeout,
};
use tracing::{debug, trace};

use super::{
    Database, Error, FolderStatus, PersistedSearchFolder, Result, Row, Transaction,
    MSGFLAG_ASSOCIATED, MSGFLAG_DELETED, MSGFLAG_READ,
};
use crate::{
    restriction::{PropTag, PropValue, SubObject},
    FolderId, Guid, ObjectId, StoreId,
};

/// Default time a transaction waits for a folder row lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ObjectKind {
    Store,
    Folder,
    SearchFolder,
    Message,
}

#[derive(Clone, Debug)]
struct Object {
    kind: ObjectKind,
    store: StoreId,
    parent: Option<FolderId>,
    flags: u32,
    props: BTreeMap<PropTag, PropValue>,
    recipients: Vec<Row>,
    attachments: Vec<Row>,
}

impl Object {
    fn is_deleted(&self) -> bool {
        self.flags & MSGFLAG_DELETED != 0
    }

    fn count(&self, tag: &PropTag) -> i64 {
        match self.props.get(tag) {
            Some(PropValue::Int(count)) => *count,
            _ => 0,
        }
    }
}

#[derive(Debug)]
struct State {
    next_id: ObjectId,
    server_guid: Guid,
    objects: HashMap<ObjectId, Object>,
    results: HashMap<FolderId, BTreeMap<ObjectId, u32>>,
    status: HashMap<FolderId, FolderStatus>,
    criteria: HashMap<FolderId, String>,
    suggestions: HashMap<FolderId, String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            next_id: 1,
            server_guid: [0xff; 16],
            objects: Default::default(),
            results: Default::default(),
            status: Default::default(),
            criteria: Default::default(),
            suggestions: Default::default(),
        }
    }
}

impl State {
    fn object(&self, id: ObjectId) -> Result<&Object> {
        self.objects.get(&id).ok_or(Error::ObjectNotFoundError(id))
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.objects
            .get_mut(&id)
            .ok_or(Error::ObjectNotFoundError(id))
    }

    fn insert(&mut self, kind: ObjectKind, parent: Option<FolderId>) -> Result<ObjectId> {
        let id = self.next_id;

        let store = match parent {
            Some(parent) => self.object(parent)?.store,
            None => id,
        };

        self.next_id += 1;
        self.objects.insert(
            id,
            Object {
                kind,
                store,
                parent,
                flags: 0,
                props: BTreeMap::new(),
                recipients: Vec::new(),
                attachments: Vec::new(),
            },
        );

        Ok(id)
    }

    fn children(&self, folder: FolderId, kind: ObjectKind, excluded_flags: u32) -> Vec<ObjectId> {
        let mut children: Vec<_> = self
            .objects
            .iter()
            .filter(|(_, obj)| obj.parent == Some(folder) && obj.kind == kind)
            .filter(|(_, obj)| obj.flags & excluded_flags == 0)
            .map(|(id, _)| *id)
            .collect();
        // ids are allocated in creation order
        children.sort_unstable_by(|a, b| b.cmp(a));
        children
    }

    fn set_result(&mut self, folder: FolderId, object: ObjectId, flags: Option<u32>) -> Option<u32> {
        let results = self.results.entry(folder).or_default();
        match flags {
            Some(flags) => results.insert(object, flags),
            None => results.remove(&object),
        }
    }
}

/// A write recorded by a transaction, holding the previous value.
#[derive(Debug)]
enum Undo {
    Result(FolderId, ObjectId, Option<u32>),
    Results(FolderId, BTreeMap<ObjectId, u32>),
    Prop(FolderId, PropTag, Option<PropValue>),
    Status(FolderId, Option<FolderStatus>),
    Criteria(FolderId, Option<String>),
    Suggestion(FolderId, Option<String>),
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    locks: Mutex<HashMap<FolderId, Arc<AsyncMutex<()>>>>,
    conflicts: Mutex<HashMap<FolderId, usize>>,
    lock_timeout: Mutex<Option<Duration>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn folder_lock(&self, folder: FolderId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|err| err.into_inner());
        locks.entry(folder).or_default().clone()
    }

    fn take_conflict(&self, folder: FolderId) -> bool {
        let mut conflicts = self.conflicts.lock().unwrap_or_else(|err| err.into_inner());
        match conflicts.get_mut(&folder) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn lock_timeout(&self) -> Duration {
        self.lock_timeout
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .unwrap_or(DEFAULT_LOCK_TIMEOUT)
    }
}

/// The in-memory database.
///
/// Cloning the database gives another handle to the same data.
#[derive(Clone, Debug, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the time a transaction waits for a folder row lock
    /// before failing with a lock wait timeout.
    pub fn set_lock_timeout(&self, lock_timeout: Duration) {
        *self
            .inner
            .lock_timeout
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = Some(lock_timeout);
    }

    /// Make the next `count` attempts to lock the given folder fail
    /// with a lock wait timeout.
    pub fn inject_lock_conflicts(&self, folder: FolderId, count: usize) {
        let mut conflicts = self
            .inner
            .conflicts
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *conflicts.entry(folder).or_default() += count;
    }

    /// Create a new store and return its id, which is also the id of
    /// its root folder.
    pub fn create_store(&self) -> StoreId {
        let mut state = self.inner.state();
        // a root never fails to insert
        state.insert(ObjectKind::Store, None).unwrap_or_default()
    }

    pub fn create_folder(&self, parent: FolderId) -> Result<FolderId> {
        self.inner.state().insert(ObjectKind::Folder, Some(parent))
    }

    pub fn create_search_folder(&self, parent: FolderId) -> Result<FolderId> {
        self.inner
            .state()
            .insert(ObjectKind::SearchFolder, Some(parent))
    }

    /// Create a new unread message in the given folder.
    pub fn create_message(
        &self,
        folder: FolderId,
        props: impl IntoIterator<Item = (PropTag, PropValue)>,
    ) -> Result<ObjectId> {
        let mut state = self.inner.state();
        let id = state.insert(ObjectKind::Message, Some(folder))?;
        state.object_mut(id)?.props.extend(props);
        trace!(folder, message = id, "created message");
        Ok(id)
    }

    pub fn set_prop(&self, object: ObjectId, tag: PropTag, value: impl Into<PropValue>) -> Result<()> {
        let mut state = self.inner.state();
        state.object_mut(object)?.props.insert(tag, value.into());
        Ok(())
    }

    pub fn set_read(&self, message: ObjectId, read: bool) -> Result<()> {
        let mut state = self.inner.state();
        let obj = state.object_mut(message)?;
        if read {
            obj.flags |= MSGFLAG_READ;
        } else {
            obj.flags &= !MSGFLAG_READ;
        }
        Ok(())
    }

    pub fn set_associated(&self, message: ObjectId) -> Result<()> {
        self.inner.state().object_mut(message)?.flags |= MSGFLAG_ASSOCIATED;
        Ok(())
    }

    /// Move an object (message or folder) to another folder of the
    /// same store.
    pub fn move_object(&self, object: ObjectId, folder: FolderId) -> Result<()> {
        let mut state = self.inner.state();
        state.object(folder)?;
        state.object_mut(object)?.parent = Some(folder);
        Ok(())
    }

    pub fn soft_delete(&self, object: ObjectId) -> Result<()> {
        self.inner.state().object_mut(object)?.flags |= MSGFLAG_DELETED;
        Ok(())
    }

    pub fn add_recipient(
        &self,
        message: ObjectId,
        props: impl IntoIterator<Item = (PropTag, PropValue)>,
    ) -> Result<()> {
        let mut state = self.inner.state();
        let obj = state.object_mut(message)?;
        let mut row = Row::new(obj.recipients.len() as ObjectId);
        row.props.extend(props);
        obj.recipients.push(row);
        Ok(())
    }

    pub fn add_attachment(
        &self,
        message: ObjectId,
        props: impl IntoIterator<Item = (PropTag, PropValue)>,
    ) -> Result<()> {
        let mut state = self.inner.state();
        let obj = state.object_mut(message)?;
        let mut row = Row::new(obj.attachments.len() as ObjectId);
        row.props.extend(props);
        obj.attachments.push(row);
        Ok(())
    }

    /// Write raw persisted criteria, bypassing the encoder.
    pub fn set_persisted_criteria(&self, folder: FolderId, criteria: impl ToString) {
        self.inner
            .state()
            .criteria
            .insert(folder, criteria.to_string());
    }

    pub fn set_persisted_status(&self, folder: FolderId, status: FolderStatus) {
        let mut state = self.inner.state();
        match status {
            FolderStatus::Running => state.status.remove(&folder),
            status => state.status.insert(folder, status),
        };
    }

    pub fn persisted_criteria(&self, folder: FolderId) -> Option<String> {
        self.inner.state().criteria.get(&folder).cloned()
    }

    /// The persisted status of the folder, the absence of a record
    /// meaning running.
    pub fn status(&self, folder: FolderId) -> FolderStatus {
        self.inner
            .state()
            .status
            .get(&folder)
            .copied()
            .unwrap_or_default()
    }

    pub fn suggestion(&self, folder: FolderId) -> Option<String> {
        self.inner.state().suggestions.get(&folder).cloned()
    }

    /// The content and unread counters of the folder.
    pub fn folder_counts(&self, folder: FolderId) -> (i64, i64) {
        let state = self.inner.state();
        state
            .objects
            .get(&folder)
            .map(|obj| {
                (
                    obj.count(&PropTag::CONTENT_COUNT),
                    obj.count(&PropTag::CONTENT_UNREAD),
                )
            })
            .unwrap_or_default()
    }

    /// The search result rows of the folder with their flags.
    pub fn results(&self, folder: FolderId) -> BTreeMap<ObjectId, u32> {
        self.inner
            .state()
            .results
            .get(&folder)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            guards: HashMap::new(),
            undo: Vec::new(),
            finished: false,
        }))
    }

    async fn list_search_folders(&self) -> Result<Vec<PersistedSearchFolder>> {
        let state = self.inner.state();

        let mut folders: Vec<_> = state
            .objects
            .iter()
            .filter(|(_, obj)| obj.kind == ObjectKind::SearchFolder && !obj.is_deleted())
            .map(|(id, _)| PersistedSearchFolder {
                folder: *id,
                status: state.status.get(id).copied(),
                criteria: state.criteria.get(id).cloned(),
            })
            .collect();
        folders.sort_by_key(|folder| folder.folder);

        Ok(folders)
    }

    async fn load_criteria(&self, folder: FolderId) -> Result<Option<String>> {
        let state = self.inner.state();
        match state.object(folder)?.kind {
            ObjectKind::SearchFolder => Ok(state.criteria.get(&folder).cloned()),
            _ => Ok(None),
        }
    }

    async fn get_store(&self, object: ObjectId) -> Result<StoreId> {
        let state = self.inner.state();
        state
            .objects
            .get(&object)
            .map(|obj| obj.store)
            .ok_or(Error::StoreNotFoundError(object))
    }

    async fn get_store_guid(&self, store: StoreId) -> Result<Guid> {
        let state = self.inner.state();
        match state.objects.get(&store) {
            Some(obj) if obj.kind == ObjectKind::Store => {
                let mut guid = [0; 16];
                guid[..4].copy_from_slice(&store.to_be_bytes());
                Ok(guid)
            }
            _ => Err(Error::StoreGuidNotFoundError(store)),
        }
    }

    async fn get_server_guid(&self) -> Result<Guid> {
        Ok(self.inner.state().server_guid)
    }

    async fn get_parent(&self, object: ObjectId) -> Result<Option<FolderId>> {
        Ok(self.inner.state().object(object)?.parent)
    }

    async fn list_child_folders(&self, folder: FolderId) -> Result<Vec<FolderId>> {
        let state = self.inner.state();
        Ok(state.children(folder, ObjectKind::Folder, MSGFLAG_DELETED))
    }

    async fn list_child_messages(&self, folder: FolderId) -> Result<Vec<ObjectId>> {
        let state = self.inner.state();
        Ok(state.children(
            folder,
            ObjectKind::Message,
            MSGFLAG_DELETED | MSGFLAG_ASSOCIATED,
        ))
    }

    async fn query_rows(
        &self,
        store: StoreId,
        objects: &[ObjectId],
        tags: &[PropTag],
    ) -> Result<Vec<Row>> {
        let state = self.inner.state();

        let rows = objects
            .iter()
            .filter_map(|id| state.objects.get(id).map(|obj| (*id, obj)))
            .filter(|(_, obj)| obj.store == store && !obj.is_deleted())
            .map(|(id, obj)| {
                let mut row = Row::new(id);
                for tag in tags {
                    if *tag == PropTag::MESSAGE_FLAGS {
                        row.props.insert(*tag, PropValue::from(obj.flags));
                    } else if let Some(value) = obj.props.get(tag) {
                        row.props.insert(*tag, value.clone());
                    }
                }
                row
            })
            .collect();

        Ok(rows)
    }

    async fn query_sub_rows(&self, object: ObjectId, kind: SubObject) -> Result<Vec<Row>> {
        let state = self.inner.state();
        let obj = state.object(object)?;
        Ok(match kind {
            SubObject::Recipients => obj.recipients.clone(),
            SubObject::Attachments => obj.attachments.clone(),
        })
    }

    async fn list_search_results(&self, folder: FolderId) -> Result<Vec<ObjectId>> {
        let state = self.inner.state();
        Ok(state
            .results
            .get(&folder)
            .map(|results| results.keys().copied().collect())
            .unwrap_or_default())
    }
}

/// A transaction of the in-memory database.
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    guards: HashMap<FolderId, OwnedMutexGuard<()>>,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemoryTransaction {
    fn check(&self) -> Result<()> {
        if self.finished {
            Err(Error::TransactionFinishedError)
        } else {
            Ok(())
        }
    }

    fn undo_all(&mut self) {
        let mut state = self.inner.state();

        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Result(folder, object, flags) => {
                    state.set_result(folder, object, flags);
                }
                Undo::Results(folder, results) => {
                    state.results.insert(folder, results);
                }
                Undo::Prop(folder, tag, value) => {
                    if let Some(obj) = state.objects.get_mut(&folder) {
                        match value {
                            Some(value) => obj.props.insert(tag, value),
                            None => obj.props.remove(&tag),
                        };
                    }
                }
                Undo::Status(folder, status) => {
                    match status {
                        Some(status) => state.status.insert(folder, status),
                        None => state.status.remove(&folder),
                    };
                }
                Undo::Criteria(folder, criteria) => {
                    match criteria {
                        Some(criteria) => state.criteria.insert(folder, criteria),
                        None => state.criteria.remove(&folder),
                    };
                }
                Undo::Suggestion(folder, suggestion) => {
                    match suggestion {
                        Some(suggestion) => state.suggestions.insert(folder, suggestion),
                        None => state.suggestions.remove(&folder),
                    };
                }
            }
        }
    }

    fn set_prop(&mut self, folder: FolderId, tag: PropTag, value: i64) -> Result<()> {
        let mut state = self.inner.state();
        let obj = state.object_mut(folder)?;
        let prev = obj.props.insert(tag, PropValue::Int(value));
        drop(state);
        self.undo.push(Undo::Prop(folder, tag, prev));
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn lock_folder(&mut self, folder: FolderId) -> Result<()> {
        self.check()?;

        if self.guards.contains_key(&folder) {
            return Ok(());
        }

        if self.inner.take_conflict(folder) {
            debug!(folder, "injected lock conflict");
            return Err(Error::LockWaitTimeoutError(folder));
        }

        let lock = self.inner.folder_lock(folder);
        let guard = timeout(self.inner.lock_timeout(), lock.lock_owned())
            .await
            .map_err(|_| Error::LockWaitTimeoutError(folder))?;
        self.guards.insert(folder, guard);

        Ok(())
    }

    async fn get_result_flags(
        &mut self,
        folder: FolderId,
        object: ObjectId,
    ) -> Result<Option<u32>> {
        self.check()?;
        let state = self.inner.state();
        Ok(state
            .results
            .get(&folder)
            .and_then(|results| results.get(&object))
            .copied())
    }

    async fn upsert_result(&mut self, folder: FolderId, object: ObjectId, flags: u32) -> Result<()> {
        self.check()?;
        let prev = self.inner.state().set_result(folder, object, Some(flags));
        self.undo.push(Undo::Result(folder, object, prev));
        Ok(())
    }

    async fn insert_results(
        &mut self,
        folder: FolderId,
        objects: &[ObjectId],
        flags: u32,
    ) -> Result<usize> {
        self.check()?;
        let mut state = self.inner.state();
        let mut inserted = 0;

        for object in objects {
            let results = state.results.entry(folder).or_default();
            if !results.contains_key(object) {
                results.insert(*object, flags);
                self.undo.push(Undo::Result(folder, *object, None));
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn update_results_flags(
        &mut self,
        folder: FolderId,
        objects: &[ObjectId],
        flags: u32,
    ) -> Result<usize> {
        self.check()?;
        let mut state = self.inner.state();
        let mut changed = 0;

        if let Some(results) = state.results.get_mut(&folder) {
            for object in objects {
                if let Some(prev) = results.get_mut(object) {
                    if *prev != flags {
                        self.undo.push(Undo::Result(folder, *object, Some(*prev)));
                        *prev = flags;
                        changed += 1;
                    }
                }
            }
        }

        Ok(changed)
    }

    async fn delete_result(&mut self, folder: FolderId, object: ObjectId) -> Result<bool> {
        self.check()?;
        let prev = self.inner.state().set_result(folder, object, None);
        match prev {
            Some(flags) => {
                self.undo.push(Undo::Result(folder, object, Some(flags)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_results(&mut self, folder: FolderId) -> Result<()> {
        self.check()?;
        let prev = self.inner.state().results.remove(&folder);
        if let Some(prev) = prev {
            self.undo.push(Undo::Results(folder, prev));
        }
        Ok(())
    }

    async fn add_folder_count(&mut self, folder: FolderId, tag: PropTag, delta: i64) -> Result<()> {
        self.check()?;
        let count = self.inner.state().object(folder)?.count(&tag);
        self.set_prop(folder, tag, count + delta)
    }

    async fn reset_folder_counts(&mut self, folder: FolderId) -> Result<()> {
        self.check()?;
        self.set_prop(folder, PropTag::CONTENT_COUNT, 0)?;
        self.set_prop(folder, PropTag::CONTENT_UNREAD, 0)
    }

    async fn set_status(&mut self, folder: FolderId, status: FolderStatus) -> Result<()> {
        self.check()?;
        let mut state = self.inner.state();
        let prev = match status {
            FolderStatus::Running => state.status.remove(&folder),
            status => state.status.insert(folder, status),
        };
        drop(state);
        self.undo.push(Undo::Status(folder, prev));
        Ok(())
    }

    async fn save_criteria(&mut self, folder: FolderId, criteria: &str) -> Result<()> {
        self.check()?;
        let prev = self
            .inner
            .state()
            .criteria
            .insert(folder, criteria.to_owned());
        self.undo.push(Undo::Criteria(folder, prev));
        Ok(())
    }

    async fn save_suggestion(&mut self, folder: FolderId, suggestion: &str) -> Result<()> {
        self.check()?;
        let prev = self
            .inner
            .state()
            .suggestions
            .insert(folder, suggestion.to_owned());
        self.undo.push(Undo::Suggestion(folder, prev));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.check()?;
        tx.undo.clear();
        tx.finished = true;
        tx.guards.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.check()?;
        tx.undo_all();
        tx.finished = true;
        tx.guards.clear();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            trace!(writes = self.undo.len(), "rolling back dropped transaction");
            self.undo_all();
        }
    }
}
