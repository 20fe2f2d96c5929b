use std::{any::Any, error, result};

use thiserror::Error;
use tokio::task::JoinError;

use crate::{criteria, thread_pool, store, FolderId, StoreId};

/// The global `Result` alias of the library.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the library.
///
/// Only structural problems end up here: asynchronous rebuilds and
/// incremental updates never surface their errors to the caller,
/// they are logged and counted instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find search folder {1} in store {0}")]
    SearchFolderNotFoundError(StoreId, FolderId),
    #[error("cannot find any search folder in store {0}")]
    StoreNotFoundError(StoreId),
    #[error("cannot find search criteria of folder {0}")]
    CriteriaNotFoundError(FolderId),
    #[error("cannot search folder {0}: search folders engine is shut down")]
    ShutDownError(FolderId),

    #[error(transparent)]
    CriteriaError(#[from] criteria::Error),
    #[error(transparent)]
    StoreError(#[from] store::Error),
    #[error(transparent)]
    ThreadPoolError(#[from] thread_pool::Error),
}

impl AnyError for Error {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl From<Error> for AnyBoxedError {
    fn from(err: Error) -> Self {
        Box::new(err)
    }
}

/// The global any `Result` alias of the library.
///
/// The difference with [`Result`] is that it takes a dynamic error
/// `Box<dyn AnyError>`.
pub type AnyResult<T> = result::Result<T, AnyBoxedError>;

/// The global, dowcastable any `Error` trait of the library.
///
/// This trait is used by external collaborators (databases,
/// indexers) to report errors that are not known at compilation
/// time.
pub trait AnyError: error::Error + Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl AnyError for JoinError {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The global any boxed `Error` alias of the module.
pub type AnyBoxedError = Box<dyn AnyError + Send + 'static>;

impl error::Error for AnyBoxedError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.as_ref().source()
    }
}

impl From<JoinError> for AnyBoxedError {
    fn from(err: JoinError) -> Self {
        Box::new(err)
    }
}
