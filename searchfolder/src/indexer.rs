//! # Indexer
//!
//! Module dedicated to the external full-text indexer. When
//! available, the indexer returns a list of candidate objects for a
//! restriction, which avoids scanning every message of the target
//! folders. Any indexer error makes the rebuild fall back to a full
//! scan.

use std::result;

use async_trait::async_trait;
use thiserror::Error;

use crate::{restriction::Restriction, AnyBoxedError, FolderId, Guid, ObjectId};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot query indexer: indexer is not available")]
    UnavailableError,
    #[error("cannot query indexer: restriction cannot be handled by the indexer")]
    DeclinedError,
    #[error("cannot query indexer")]
    QueryError(#[source] AnyBoxedError),
}

/// The results of an indexer query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexerResults {
    /// The candidate objects.
    pub objects: Vec<ObjectId>,

    /// The part of the restriction the indexer could not handle,
    /// which still needs to be evaluated against the candidates.
    ///
    /// `None` means every candidate matches.
    pub residual: Option<Restriction>,

    /// The query suggestion of the indexer, echoed back to clients.
    pub suggestion: String,
}

/// The indexer client.
#[async_trait]
pub trait IndexerClient: Send + Sync {
    async fn query(
        &self,
        server: Guid,
        store: Guid,
        folders: &[FolderId],
        restriction: &Restriction,
    ) -> Result<IndexerResults>;
}

/// The indexer client used when no indexer is configured.
#[derive(Clone, Debug, Default)]
pub struct NoIndexer;

#[async_trait]
impl IndexerClient for NoIndexer {
    async fn query(
        &self,
        _server: Guid,
        _store: Guid,
        _folders: &[FolderId],
        _restriction: &Restriction,
    ) -> Result<IndexerResults> {
        Err(Error::UnavailableError)
    }
}
