//! # Retry
//!
//! Module dedicated to retrying transactions that failed because of
//! a transient lock conflict (lock wait timeout, deadlock). Each
//! attempt is expected to begin, lock, work and commit on its own.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    stats::Stats,
    store::{Error, Result},
};

/// The retry policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// The total number of attempts, including the first one.
    pub max_attempts: u8,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::SearchFoldersConfig::default().retry_policy()
    }
}

#[derive(Debug)]
pub enum RetryState<T> {
    Ok(T),
    Retry,
    Failed(Error),
}

#[derive(Debug)]
pub struct Retry<'a> {
    policy: &'a RetryPolicy,
    pub attempts: u8,
}

impl<'a> Retry<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn next<T>(&mut self, res: Result<T>) -> RetryState<T> {
        self.attempts += 1;

        match res {
            Ok(res) => RetryState::Ok(res),
            Err(err) if err.is_retryable() && self.attempts < self.policy.max_attempts => {
                RetryState::Retry
            }
            Err(err) => RetryState::Failed(err),
        }
    }

    /// Wait a random delay within the policy bounds.
    pub async fn backoff(&self) {
        let min = self.policy.backoff_min.as_millis() as u64;
        let max = (self.policy.backoff_max.as_millis() as u64).max(min);
        let delay = rand::thread_rng().gen_range(min..=max);
        sleep(Duration::from_millis(delay)).await;
    }
}

/// Run the given attempt until it succeeds, fails with a permanent
/// error or exhausts the attempts of the policy.
///
/// Retries and exhausted attempts are recorded in the given stats.
pub async fn retry_transaction<T, F, Fut>(
    policy: &RetryPolicy,
    stats: &Stats,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = Retry::new(policy);

    loop {
        match retry.next(attempt().await) {
            RetryState::Ok(output) => break Ok(output),
            RetryState::Retry => {
                debug!(attempt = retry.attempts, "transaction conflict, retrying");
                stats.inc_update_retries();
                retry.backoff().await;
            }
            RetryState::Failed(err) => {
                if err.is_retryable() {
                    warn!(attempts = retry.attempts, "transaction conflict, giving up");
                    stats.inc_update_failures();
                }
                break Err(err);
            }
        }
    }
}
