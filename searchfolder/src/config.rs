//! # Search folders configuration
//!
//! Module dedicated to the search folders configuration. Every field
//! is optional, missing ones fall back to sensible defaults exposed
//! as constants.

use std::{num::NonZeroUsize, thread::available_parallelism, time::Duration};

use crate::retry::RetryPolicy;

/// Maximum amount of events processed by one dispatcher cycle.
pub const DEFAULT_EVENT_BATCH_SIZE: usize = 500;

/// Amount of messages evaluated per transaction when scanning
/// target folders.
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 20;

/// Amount of indexer candidates evaluated per transaction.
pub const DEFAULT_INDEX_BATCH_SIZE: usize = 200;

/// Number of attempts made to apply one folder update when the
/// database reports a lock conflict.
pub const DEFAULT_MAX_ATTEMPTS: u8 = 4;

pub const DEFAULT_RETRY_BACKOFF_MIN_MS: u64 = 5;
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 50;

/// The search folders configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SearchFoldersConfig {
    /// The number of rebuild workers.
    ///
    /// Defaults to the number of available CPUs.
    pub threads: Option<usize>,

    /// The maximum number of change events drained from the queue
    /// per dispatcher cycle.
    pub event_batch_size: Option<usize>,

    /// The number of messages evaluated per transaction during a
    /// full scan of the target folders.
    pub scan_batch_size: Option<usize>,

    /// The number of indexer candidates evaluated per transaction.
    pub index_batch_size: Option<usize>,

    /// The number of attempts made when a transaction fails because
    /// of a lock wait timeout or a deadlock.
    pub max_attempts: Option<u8>,

    /// The minimum delay between two attempts, in milliseconds.
    pub retry_backoff_min_ms: Option<u64>,

    /// The maximum delay between two attempts, in milliseconds.
    pub retry_backoff_max_ms: Option<u64>,

    /// Should the indexer be queried before scanning target
    /// folders.
    ///
    /// Defaults to `true`.
    pub index_enabled: Option<bool>,
}

impl SearchFoldersConfig {
    pub fn threads(&self) -> usize {
        self.threads
            .filter(|threads| *threads > 0)
            .unwrap_or_else(|| available_parallelism().map_or(1, NonZeroUsize::get))
    }

    pub fn event_batch_size(&self) -> usize {
        self.event_batch_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_EVENT_BATCH_SIZE)
    }

    pub fn scan_batch_size(&self) -> usize {
        self.scan_batch_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_SCAN_BATCH_SIZE)
    }

    pub fn index_batch_size(&self) -> usize {
        self.index_batch_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_INDEX_BATCH_SIZE)
    }

    pub fn is_index_enabled(&self) -> bool {
        self.index_enabled.unwrap_or(true)
    }

    /// Build the retry policy applied to every search folder
    /// transaction.
    pub fn retry_policy(&self) -> RetryPolicy {
        let min = self
            .retry_backoff_min_ms
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MIN_MS);
        let max = self
            .retry_backoff_max_ms
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MAX_MS)
            .max(min);

        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            backoff_min: Duration::from_millis(min),
            backoff_max: Duration::from_millis(max),
        }
    }
}
