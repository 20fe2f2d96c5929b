//! # Event
//!
//! Module dedicated to change events. The rest of the server pushes
//! a [`ChangeEvent`] for every object mutation into the
//! [`EventQueue`]. The dispatcher drains the queue in bounded
//! batches, groups events into [`ChangeBatch`]es and hands them to
//! the incremental update processor.

pub(crate) mod dispatcher;

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use tokio::sync::{watch, Notify};
use tracing::trace;

use crate::{FolderId, ObjectId, StoreId};

/// The kind of change applied to an object.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChangeKind {
    /// The object has been created in, or moved into, the folder.
    Add,
    /// The properties or flags of the object changed.
    Modify,
    /// The object has been deleted from, or moved out of, the
    /// folder.
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A change of one object in one folder.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChangeEvent {
    pub store: StoreId,
    /// The folder containing the changed object.
    pub folder: FolderId,
    pub object: ObjectId,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(store: StoreId, folder: FolderId, object: ObjectId, kind: ChangeKind) -> Self {
        Self {
            store,
            folder,
            object,
            kind,
        }
    }
}

/// A run of changes of the same kind in the same folder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeBatch {
    pub store: StoreId,
    pub folder: FolderId,
    pub kind: ChangeKind,
    /// The changed objects, sorted and deduplicated.
    pub objects: Vec<ObjectId>,
}

/// Group events into batches.
///
/// Events are sorted by folder, keeping their relative order, then
/// split into maximal runs of the same folder and kind. Duplicate
/// objects of a run are collapsed into one.
pub fn group_events(mut events: Vec<ChangeEvent>) -> Vec<ChangeBatch> {
    events.sort_by_key(|event| event.folder);

    let mut batches: Vec<ChangeBatch> = Vec::new();

    for event in events {
        match batches.last_mut() {
            Some(batch)
                if batch.folder == event.folder
                    && batch.kind == event.kind
                    && batch.store == event.store =>
            {
                batch.objects.push(event.object);
            }
            _ => batches.push(ChangeBatch {
                store: event.store,
                folder: event.folder,
                kind: event.kind,
                objects: vec![event.object],
            }),
        }
    }

    for batch in &mut batches {
        batch.objects.sort_unstable();
        batch.objects.dedup();
    }

    batches
}

/// The queue of pending change events.
///
/// The queue lock is never held across an `.await`.
#[derive(Debug)]
pub struct EventQueue {
    events: Mutex<VecDeque<ChangeEvent>>,
    wake: Notify,
    started: AtomicU64,
    finished: watch::Sender<u64>,
    shutdown: AtomicBool,
    stopped: AtomicBool,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self {
            events: Default::default(),
            wake: Notify::new(),
            started: AtomicU64::new(0),
            finished: watch::channel(0).0,
            shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }
}

impl EventQueue {
    fn events(&self) -> MutexGuard<'_, VecDeque<ChangeEvent>> {
        self.events.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn push(&self, event: ChangeEvent) {
        self.extend([event])
    }

    pub fn extend(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        self.events().extend(events);
        self.wake.notify_one();
    }

    /// The number of pending events.
    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    /// Take at most `size` events from the front of the queue.
    pub fn pop_batch(&self, size: usize) -> Vec<ChangeEvent> {
        let mut events = self.events();
        let size = size.min(events.len());
        events.drain(..size).collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Ask the dispatcher to stop once the queue is empty.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Wait until every event pushed before this call has been
    /// processed.
    ///
    /// Returns immediately once the dispatcher is stopped.
    pub async fn flush(&self) {
        let mut finished = self.finished.subscribe();

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            // the next cycle to start drains the events pushed so far
            let target = self.started.load(Ordering::SeqCst) + 1;
            self.wake.notify_one();

            loop {
                if *finished.borrow_and_update() >= target || self.stopped.load(Ordering::SeqCst)
                {
                    break;
                }
                if finished.changed().await.is_err() {
                    return;
                }
            }

            if self.is_empty() {
                break;
            }
        }

        trace!("event queue flushed");
    }

    pub(crate) fn start_cycle(&self) -> u64 {
        self.started.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn finish_cycle(&self, cycle: u64) {
        self.finished.send_replace(cycle);
    }

    pub(crate) async fn wait(&self) {
        self.wake.notified().await
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let cycle = self.started.load(Ordering::SeqCst);
        self.finished.send_replace(cycle);
    }
}
