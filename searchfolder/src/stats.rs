//! # Stats
//!
//! Module dedicated to the search folders counters. Asynchronous
//! failures are invisible to callers, these counters (and the logs)
//! are the only way to observe them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// The search folders counters.
#[derive(Debug, Default)]
pub struct Stats {
    folders: AtomicI64,
    workers: AtomicI64,
    update_retries: AtomicU64,
    update_failures: AtomicU64,
}

impl Stats {
    pub(crate) fn add_folders(&self, delta: i64) {
        self.folders.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn add_workers(&self, delta: i64) {
        self.workers.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn inc_update_retries(&self) {
        self.update_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_update_failures(&self) {
        self.update_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of registered search folders.
    pub fn folders(&self) -> i64 {
        self.folders.load(Ordering::Relaxed)
    }

    /// The number of rebuild workers currently searching.
    pub fn workers(&self) -> i64 {
        self.workers.load(Ordering::Relaxed)
    }

    /// The number of transactions attempted again after a lock
    /// conflict.
    pub fn update_retries(&self) -> u64 {
        self.update_retries.load(Ordering::Relaxed)
    }

    /// The number of folder updates abandoned after exhausting all
    /// attempts.
    pub fn update_failures(&self) -> u64 {
        self.update_failures.load(Ordering::Relaxed)
    }
}

/// A snapshot of the search folders engine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchFoldersReport {
    /// The number of stores having at least one search folder.
    pub stores: usize,
    /// The number of registered search folders.
    pub folders: usize,
    /// The number of change events waiting in the queue.
    pub events: usize,
    pub workers: i64,
    pub update_retries: u64,
    pub update_failures: u64,
}
