//! # Store
//!
//! Module dedicated to the persistence seam of the search folders
//! engine. The relational storage engine is consumed through two
//! traits: [`Database`] for plain reads of the hierarchy, and
//! [`Transaction`] for the row-locked writes of search results,
//! folder status and folder counters.
//!
//! The [`results`] module gathers the helpers built on top of those
//! traits, and the [`memory`] module provides a complete in-process
//! implementation.

pub mod memory;
pub mod results;

use std::{collections::BTreeMap, fmt, result};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    restriction::{PropTag, PropValue, SubObject},
    AnyBoxedError, FolderId, Guid, ObjectId, StoreId,
};

#[doc(inline)]
pub use self::memory::MemoryDatabase;

/// The message has been read.
pub const MSGFLAG_READ: u32 = 0x0001;

/// The object is an associated (hidden) item.
pub const MSGFLAG_ASSOCIATED: u32 = 0x0040;

/// The object has been soft-deleted.
pub const MSGFLAG_DELETED: u32 = 0x0400;

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot lock folder {0}: lock wait timeout exceeded")]
    LockWaitTimeoutError(FolderId),
    #[error("cannot lock folder {0}: deadlock found")]
    DeadlockError(FolderId),
    #[error("cannot find object {0}")]
    ObjectNotFoundError(ObjectId),
    #[error("cannot find store of object {0}")]
    StoreNotFoundError(ObjectId),
    #[error("cannot find guid of store {0}")]
    StoreGuidNotFoundError(StoreId),
    #[error("cannot use transaction: transaction already finished")]
    TransactionFinishedError,
    #[error("database error")]
    DatabaseError(#[source] AnyBoxedError),
}

impl Error {
    /// Return `true` if the error is a transient lock conflict that
    /// may succeed when the transaction is attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockWaitTimeoutError(_) | Self::DeadlockError(_))
    }
}

/// The persisted status of a search folder.
///
/// The absence of a status record means [`FolderStatus::Running`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum FolderStatus {
    #[default]
    Running,
    Rebuilding,
    Stopped,
}

impl FolderStatus {
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Running => 0,
            Self::Rebuilding => 1,
            Self::Stopped => 2,
        }
    }
}

impl TryFrom<u32> for FolderStatus {
    type Error = u32;

    fn try_from(status: u32) -> result::Result<Self, Self::Error> {
        match status {
            0 => Ok(Self::Running),
            1 => Ok(Self::Rebuilding),
            2 => Ok(Self::Stopped),
            status => Err(status),
        }
    }
}

impl fmt::Display for FolderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Rebuilding => write!(f, "rebuilding"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A search folder as found in the database at startup.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PersistedSearchFolder {
    pub folder: FolderId,
    /// The status record, `None` meaning running.
    pub status: Option<FolderStatus>,
    /// The serialized search criteria, if any.
    pub criteria: Option<String>,
}

/// The row data of one object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    pub object: ObjectId,
    pub props: BTreeMap<PropTag, PropValue>,
}

impl Row {
    pub fn new(object: ObjectId) -> Self {
        Self {
            object,
            props: Default::default(),
        }
    }

    pub fn with_prop(mut self, tag: PropTag, value: impl Into<PropValue>) -> Self {
        self.props.insert(tag, value.into());
        self
    }

    pub fn get(&self, tag: &PropTag) -> Option<&PropValue> {
        self.props.get(tag)
    }

    /// Return the message flags of the row, or `None` if they were
    /// not fetched or do not fit the flags range.
    pub fn message_flags(&self) -> Option<u32> {
        match self.props.get(&PropTag::MESSAGE_FLAGS) {
            Some(PropValue::Int(flags)) => u32::try_from(*flags).ok(),
            _ => None,
        }
    }
}

/// Non-transactional reads of the hierarchy.
#[async_trait]
pub trait Database: Send + Sync {
    /// Begin a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// List all non-deleted search folders with their status and
    /// serialized criteria.
    async fn list_search_folders(&self) -> Result<Vec<PersistedSearchFolder>>;

    /// Load the serialized criteria of the given folder.
    ///
    /// Returns `None` if the folder is not a search folder or has no
    /// criteria.
    async fn load_criteria(&self, folder: FolderId) -> Result<Option<String>>;

    /// Get the store owning the given object.
    async fn get_store(&self, object: ObjectId) -> Result<StoreId>;

    async fn get_store_guid(&self, store: StoreId) -> Result<Guid>;

    async fn get_server_guid(&self) -> Result<Guid>;

    /// Get the parent folder of the given object, `None` for a store
    /// root.
    async fn get_parent(&self, object: ObjectId) -> Result<Option<FolderId>>;

    /// List the direct child folders of the given folder, newest
    /// first, excluding soft-deleted ones.
    async fn list_child_folders(&self, folder: FolderId) -> Result<Vec<FolderId>>;

    /// List the messages of the given folder, newest first,
    /// excluding soft-deleted and associated ones.
    async fn list_child_messages(&self, folder: FolderId) -> Result<Vec<ObjectId>>;

    /// Query the given properties of the given objects.
    ///
    /// Objects that do not exist anymore are omitted from the
    /// returned rows. Other rows keep the order of `objects`.
    async fn query_rows(
        &self,
        store: StoreId,
        objects: &[ObjectId],
        tags: &[PropTag],
    ) -> Result<Vec<Row>>;

    /// Query the sub-objects (recipients, attachments) of the given
    /// object.
    async fn query_sub_rows(&self, object: ObjectId, kind: SubObject) -> Result<Vec<Row>>;

    /// List the objects currently stored as results of the given
    /// search folder.
    async fn list_search_results(&self, folder: FolderId) -> Result<Vec<ObjectId>>;
}

/// Transactional writes of search results and folder properties.
///
/// Dropping a transaction that has not been committed rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Lock the status row of the given folder until the end of the
    /// transaction.
    ///
    /// Fails with a retryable error on lock wait timeout or
    /// deadlock.
    async fn lock_folder(&mut self, folder: FolderId) -> Result<()>;

    /// Get the flags of the search result row (folder, object), if
    /// any.
    async fn get_result_flags(&mut self, folder: FolderId, object: ObjectId)
        -> Result<Option<u32>>;

    /// Insert the search result row, or update its flags if it
    /// already exists.
    async fn upsert_result(&mut self, folder: FolderId, object: ObjectId, flags: u32)
        -> Result<()>;

    /// Insert the search result rows that do not exist yet.
    ///
    /// Returns the number of inserted rows.
    async fn insert_results(
        &mut self,
        folder: FolderId,
        objects: &[ObjectId],
        flags: u32,
    ) -> Result<usize>;

    /// Set the flags of existing search result rows.
    ///
    /// Returns the number of rows whose flags actually changed.
    async fn update_results_flags(
        &mut self,
        folder: FolderId,
        objects: &[ObjectId],
        flags: u32,
    ) -> Result<usize>;

    /// Delete the search result row (folder, object).
    ///
    /// Returns `false` if there was no such row.
    async fn delete_result(&mut self, folder: FolderId, object: ObjectId) -> Result<bool>;

    /// Delete all search result rows of the given folder.
    async fn delete_results(&mut self, folder: FolderId) -> Result<()>;

    /// Add the given delta to a numeric folder property.
    async fn add_folder_count(&mut self, folder: FolderId, tag: PropTag, delta: i64)
        -> Result<()>;

    /// Reset the content and unread counters of the given folder.
    async fn reset_folder_counts(&mut self, folder: FolderId) -> Result<()>;

    /// Persist the status of the given folder.
    ///
    /// [`FolderStatus::Running`] removes the status record.
    async fn set_status(&mut self, folder: FolderId, status: FolderStatus) -> Result<()>;

    async fn save_criteria(&mut self, folder: FolderId, criteria: &str) -> Result<()>;

    async fn save_suggestion(&mut self, folder: FolderId, suggestion: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
