//! # Notify
//!
//! Module dedicated to change notifications. The engine does not
//! deliver notifications to clients itself, it hands them to a
//! [`Notifier`] provided by the surrounding server.

use std::sync::Mutex;

use crate::{FolderId, ObjectId, StoreId};

/// A change notification emitted by the search folders engine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Notification {
    /// A row has been added to the content table of a folder.
    TableRowAdded(FolderId, ObjectId),
    /// A row of the content table of a folder has been modified.
    TableRowModified(FolderId, ObjectId),
    /// A row has been removed from the content table of a folder.
    TableRowDeleted(FolderId, ObjectId),
    /// The whole content table of a folder changed.
    TableChanged(FolderId),
    /// The row of a folder (second) changed in the hierarchy table
    /// of its parent (first).
    HierarchyRowModified(FolderId, FolderId),
    /// The cached properties of a folder are stale.
    CacheInvalidated(FolderId),
    /// The folder object itself changed (content counters).
    FolderModified(FolderId),
    /// A rebuild of a search folder finished.
    SearchComplete(StoreId, FolderId),
}

/// The notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);

    fn notify_all(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.notify(notification)
        }
    }
}

/// A notifier discarding every notification.
#[derive(Clone, Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) {
        //
    }
}

/// A notifier keeping every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier(Mutex<Vec<Notification>>);

impl MemoryNotifier {
    /// Take all notifications received so far.
    pub fn take(&self) -> Vec<Notification> {
        let mut notifications = self.0.lock().unwrap_or_else(|err| err.into_inner());
        std::mem::take(&mut *notifications)
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) {
        let mut notifications = self.0.lock().unwrap_or_else(|err| err.into_inner());
        notifications.push(notification);
    }
}
