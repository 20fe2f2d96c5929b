//! # Search folder
//!
//! Module dedicated to the runtime representation of a live search
//! folder. A [`SearchFolder`] is owned by the
//! [`Registry`](crate::registry::Registry); its rebuild worker holds
//! a clone of the same `Arc` for the duration of a search, and
//! reports its completion through a one-shot channel.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::oneshot;
use tracing::debug;

use crate::{criteria::SearchCriteria, FolderId, StoreId};

/// The state of a search folder, as reported to clients.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SearchState(u32);

impl SearchState {
    /// The folder is not an active search folder.
    pub const ABSENT: Self = Self(0);
    /// The folder is an active search folder.
    pub const RUNNING: Self = Self(0x0001);
    /// A rebuild worker is still searching.
    pub const REBUILD: Self = Self(0x0002);
    /// The search includes all descendants of the target folders.
    pub const RECURSIVE: Self = Self(0x0004);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_absent(&self) -> bool {
        self.0 == 0
    }

    pub fn is_running(&self) -> bool {
        self.contains(Self::RUNNING)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.contains(Self::REBUILD)
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A live search folder.
pub struct SearchFolder {
    pub store: StoreId,
    pub folder: FolderId,
    pub criteria: Arc<SearchCriteria>,

    /// Set when the rebuild worker should stop searching.
    exit: AtomicBool,

    /// Set while a rebuild worker owns this search folder.
    rebuilding: AtomicBool,

    /// Resolved when the rebuild worker finishes.
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl SearchFolder {
    pub fn new(store: StoreId, folder: FolderId, criteria: SearchCriteria) -> Self {
        Self {
            store,
            folder,
            criteria: Arc::new(criteria),
            exit: AtomicBool::new(false),
            rebuilding: AtomicBool::new(false),
            done: Mutex::new(None),
        }
    }

    /// The cancellation flag checked by the rebuild worker between
    /// batches.
    pub fn exit_flag(&self) -> &AtomicBool {
        &self.exit
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SearchState {
        let state = SearchState::RUNNING;
        if self.is_rebuilding() {
            state.with(SearchState::REBUILD)
        } else {
            state
        }
    }

    /// Mark the search folder as owned by a rebuild worker.
    ///
    /// The returned sender must be resolved (or dropped) by the
    /// worker once it does not touch the search folder anymore.
    pub(crate) fn start_rebuild(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.rebuilding.store(true, Ordering::Release);
        *self.done.lock().unwrap_or_else(|err| err.into_inner()) = Some(rx);
        tx
    }

    pub(crate) fn finish_rebuild(&self, done: oneshot::Sender<()>) {
        self.rebuilding.store(false, Ordering::Release);
        // the receiver is gone when nobody waits for the worker
        let _ = done.send(());
    }

    /// Ask the rebuild worker to stop, then wait until it finished.
    ///
    /// Returns immediately if no worker owns the search folder.
    pub(crate) async fn stop_rebuild(&self) {
        self.exit.store(true, Ordering::Release);

        let done = self
            .done
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();

        if let Some(done) = done {
            debug!(store = self.store, folder = self.folder, "waiting for rebuild worker to exit");
            // a dropped sender means the worker was aborted, which
            // also releases the search folder
            let _ = done.await;
            self.rebuilding.store(false, Ordering::Release);
        }
    }
}

impl fmt::Debug for SearchFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchFolder")
            .field("store", &self.store)
            .field("folder", &self.folder)
            .field("criteria", &self.criteria)
            .field("exit", &self.is_exit_requested())
            .field("rebuilding", &self.is_rebuilding())
            .finish()
    }
}
