//! Rust library to keep search folders of a groupware server up to
//! date.
//!
//! A search folder is a virtual folder whose content is the live
//! result of a [`Restriction`](crate::restriction::Restriction)
//! evaluated against one or more target folders of a store,
//! optionally including all their descendants. The library keeps
//! those result sets correct while messages are created, modified,
//! moved or deleted anywhere in the store, without rescanning the
//! store on every change.
//!
//! The main structure is [`SearchFolders`]. It is built from a
//! [`SearchContext`](crate::context::SearchContext), which gathers
//! the external collaborators of the engine:
//!
//! - a transactional [`Database`](crate::store::Database) holding
//!   the folder hierarchy and the search results,
//! - a [`RestrictionEvaluator`](crate::restriction::RestrictionEvaluator),
//! - an optional [`IndexerClient`](crate::indexer::IndexerClient)
//!   able to shortcut full scans,
//! - a [`Notifier`](crate::notify::Notifier) receiving table and
//!   folder change notifications.
//!
//! See examples in the /tests folder.

pub mod config;
pub mod context;
pub mod criteria;
mod error;
pub mod event;
pub mod folder;
pub mod indexer;
pub mod notify;
mod rebuild;
pub mod registry;
pub mod restriction;
pub mod retry;
mod search_folders;
pub mod stats;
pub mod store;
pub mod thread_pool;
mod update;

#[doc(inline)]
pub use self::{
    error::{AnyBoxedError, AnyError, AnyResult, Error, Result},
    event::{ChangeEvent, ChangeKind},
    rebuild::search,
    search_folders::SearchFolders,
};

/// The identifier of a store, which is also the hierarchy id of the
/// store root object.
pub type StoreId = u32;

/// The hierarchy identifier of a folder.
pub type FolderId = u32;

/// The hierarchy identifier of any object (folder, message…).
pub type ObjectId = u32;

/// A store or server GUID.
pub type Guid = [u8; 16];
